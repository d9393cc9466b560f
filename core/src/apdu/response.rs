use std::fmt::{Display, Formatter};

use crate::apdu::{Error, Result};

/// A response that was received from the card.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Response {
    payload: Vec<u8>,
    sw1: u8,
    sw2: u8,
}

impl Response {
    /// Creates a response from its parts.
    pub fn new(payload: Vec<u8>, sw1: u8, sw2: u8) -> Self {
        Self { payload, sw1, sw2 }
    }

    /// Parses a response from the octets.
    /// The last two octets are the status bytes, everything before them is the payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [payload @ .., sw1, sw2] => Ok(Self::new(payload.to_vec(), *sw1, *sw2)),
            _ => Err(Error::ResponseTooShort(bytes.len())),
        }
    }

    /// Converts the response back into octets.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.payload.len() + 2);
        buffer.extend_from_slice(&self.payload);
        buffer.push(self.sw1);
        buffer.push(self.sw2);
        buffer
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub const fn sw1(&self) -> u8 {
        self.sw1
    }

    pub const fn sw2(&self) -> u8 {
        self.sw2
    }

    /// The 16-bit status word, `SW1 << 8 | SW2`.
    pub const fn sw(&self) -> StatusWord {
        StatusWord::new(self.sw1, self.sw2)
    }
}

impl TryFrom<Vec<u8>> for Response {
    type Error = Error;

    fn try_from(mut bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::ResponseTooShort(bytes.len()));
        }

        let sw2 = bytes.pop().unwrap_or_default();
        let sw1 = bytes.pop().unwrap_or_default();

        Ok(Self::new(bytes, sw1, sw2))
    }
}

/// The trailing status word of a response.
///
/// The lifecycle layer never looks inside it; helpers here serve the card operations built on
/// top of it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StatusWord(u16);

impl StatusWord {
    pub const SUCCESS: Self = Self(0x9000);

    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self(((sw1 as u16) << 8) | sw2 as u16)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    pub const fn sw1(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn sw2(self) -> u8 {
        self.0 as u8
    }

    /// Determines whether the status indicates normal processing.
    pub const fn is_success(self) -> bool {
        matches!(self.0, 0x9000 | 0x9100)
    }

    /// `61xx`: more response data is waiting to be fetched with `GET RESPONSE`.
    pub const fn bytes_remaining(self) -> Option<u32> {
        match self.sw1() {
            0x61 => Some(if self.sw2() == 0 { 256 } else { self.sw2() as u32 }),
            _ => None,
        }
    }

    /// `63Cx`: verification failed (or was queried) with `x` retries left.
    pub const fn remaining_retries(self) -> Option<u8> {
        match self.0 & 0xFFF0 {
            0x63C0 => Some((self.0 & 0x0F) as u8),
            _ => None,
        }
    }
}

impl From<u16> for StatusWord {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl PartialEq<u16> for StatusWord {
    fn eq(&self, other: &u16) -> bool {
        self.0 == *other
    }
}

impl Display for StatusWord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}
