use std::fmt::{Display, Formatter};

use crate::apdu::{
    ins, Error, Result, CLA_DEFAULT, MAX_DATA_LEN, MAX_LE, SHORT_MAX_DATA_LEN, SHORT_MAX_LE,
};

const SELECT_P1_DF: u8 = 0x04;
const SELECT_P1_EF: u8 = 0x02;
const SELECT_P2: u8 = 0x0C;

const VERIFY_P2: u8 = 0x80;

const SIGN_CLA: u8 = 0x80;
const SIGN_P1: u8 = 0x00;
const SIGN_P2: u8 = 0x80;

/// An APDU command to be transmitted.
///
/// The value is immutable once built. An empty payload stays distinct from an absent one. With an
/// Le it is sent in the extended form (`00 00 00` then a 2-byte Le); without one no frame can carry
/// it, so it encodes like a command without data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    payload: Option<Vec<u8>>,
    le: Option<u32>,
}

impl Command {
    /// Constructs a command with CLA, INS, P1, and P2.
    /// No payloads will be transmitted or received.
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            payload: None,
            le: None,
        }
    }

    /// Constructs a command from header values wider than a byte, failing if any of them does
    /// not fit in `0..=255`.
    pub fn try_from_header(cla: u32, ins: u32, p1: u32, p2: u32) -> Result<Self> {
        fn byte(field: &'static str, value: u32) -> Result<u8> {
            u8::try_from(value).map_err(|_| Error::HeaderOutOfRange { field, value })
        }

        Ok(Self::new(
            byte("CLA", cla)?,
            byte("INS", ins)?,
            byte("P1", p1)?,
            byte("P2", p2)?,
        ))
    }

    /// Constructs a command with CLA, INS, P1, P2, and Le.
    /// A payload will be received.
    pub fn new_with_le(cla: u8, ins: u8, p1: u8, p2: u8, le: u32) -> Result<Self> {
        Self::try_new(cla, ins, p1, p2, None, Some(le))
    }

    /// Constructs a command with CLA, INS, P1, P2, and a payload.
    /// No payload will be received.
    pub fn new_with_payload(cla: u8, ins: u8, p1: u8, p2: u8, payload: Vec<u8>) -> Result<Self> {
        Self::try_new(cla, ins, p1, p2, Some(payload), None)
    }

    /// Constructs a command with CLA, INS, P1, P2, Le, and a payload.
    /// A payload will be received.
    pub fn new_with_payload_le(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        le: u32,
        payload: Vec<u8>,
    ) -> Result<Self> {
        Self::try_new(cla, ins, p1, p2, Some(payload), Some(le))
    }

    /// Constructs a command from all of its parts, validating the payload length and Le.
    pub fn try_new(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        payload: Option<Vec<u8>>,
        le: Option<u32>,
    ) -> Result<Self> {
        if let Some(p) = &payload {
            if p.len() > MAX_DATA_LEN {
                return Err(Error::DataTooLong(p.len()));
            }
        }

        if let Some(l) = le {
            if l == 0 || l > MAX_LE {
                return Err(Error::LeOutOfRange(l));
            }
        }

        Ok(Self {
            cla,
            ins,
            p1,
            p2,
            payload,
            le,
        })
    }

    /// Constructs a `SELECT FILE` command selecting a DF by its name.
    pub fn select_df(name: Vec<u8>) -> Result<Self> {
        Self::select_file(SELECT_P1_DF, SELECT_P2, name)
    }

    /// Constructs a `SELECT FILE` command selecting an EF by its identifier.
    pub fn select_ef(id: Vec<u8>) -> Result<Self> {
        Self::select_file(SELECT_P1_EF, SELECT_P2, id)
    }

    /// Constructs a `SELECT FILE` command.
    pub fn select_file(p1: u8, p2: u8, payload: Vec<u8>) -> Result<Self> {
        Self::new_with_payload(CLA_DEFAULT, ins::SELECT_FILE, p1, p2, payload)
    }

    /// Constructs a `READ BINARY` command reading from `offset` in the current EF.
    pub fn read_binary(offset: u16, le: u32) -> Result<Self> {
        let [p1, p2] = offset.to_be_bytes();

        Self::new_with_le(CLA_DEFAULT, ins::READ_BINARY, p1, p2, le)
    }

    /// Constructs a `VERIFY` command.
    /// An empty PIN queries the retry counter instead of verifying.
    pub fn verify(pin: Vec<u8>) -> Result<Self> {
        Self::new_with_payload(CLA_DEFAULT, ins::VERIFY, 0x00, VERIFY_P2, pin)
    }

    /// Constructs a `GET RESPONSE` command fetching `le` remaining octets.
    pub fn get_response(le: u32) -> Result<Self> {
        Self::new_with_le(CLA_DEFAULT, ins::GET_RESPONSE, 0x00, 0x00, le)
    }

    /// Constructs a command computing a signature over `digest` with the selected key.
    pub fn sign(digest: Vec<u8>) -> Result<Self> {
        Self::new_with_payload_le(
            SIGN_CLA,
            ins::PERFORM_SECURITY_OPERATION,
            SIGN_P1,
            SIGN_P2,
            SHORT_MAX_LE,
            digest,
        )
    }

    pub const fn cla(&self) -> u8 {
        self.cla
    }

    pub const fn ins(&self) -> u8 {
        self.ins
    }

    pub const fn p1(&self) -> u8 {
        self.p1
    }

    pub const fn p2(&self) -> u8 {
        self.p2
    }

    /// The data field, if any.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// The expected response length, in `1..=65536`.
    pub const fn le(&self) -> Option<u32> {
        self.le
    }

    /// Determines whether the command needs the extended length encoding.
    pub fn is_extended(&self) -> bool {
        match (&self.payload, self.le) {
            // A zero Lc only exists in the extended form.
            (Some(p), Some(_)) if p.is_empty() => true,
            (payload, le) => {
                payload.as_ref().map_or(false, |p| p.len() > SHORT_MAX_DATA_LEN)
                    || le.map_or(false, |l| l > SHORT_MAX_LE)
            }
        }
    }

    /// Converts the command into octets.
    pub fn to_bytes(&self) -> Vec<u8> {
        let extended = self.is_extended();
        let mut buffer: Vec<u8> = Vec::with_capacity(
            4 + 3 + self.payload.as_ref().map_or(0, Vec::len) + 2,
        );

        buffer.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);

        if let Some(p) = self.payload.as_ref().filter(|p| extended || !p.is_empty()) {
            if extended {
                buffer.push(0x00);
                buffer.extend_from_slice(&(p.len() as u16).to_be_bytes());
            } else {
                buffer.push(p.len() as u8);
            }

            buffer.extend_from_slice(p);
        }

        if let Some(l) = self.le {
            if extended {
                if self.payload.is_none() {
                    buffer.push(0x00);
                }

                // 65536 wraps to 0x0000 by the truncation.
                buffer.extend_from_slice(&(l as u16).to_be_bytes());
            } else {
                // 256 wraps to 0x00 by the truncation.
                buffer.push(l as u8);
            }
        }

        buffer
    }

    /// Parses a command from the octets.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (cla, ins, p1, p2, body) = match bytes {
            [cla, ins, p1, p2, body @ ..] => (*cla, *ins, *p1, *p2, body),
            _ => return Err(Error::CommandTooShort(bytes.len())),
        };

        let (payload, le) = match body {
            [] => (None, None),
            [le] => (None, Some(short_le(*le))),
            [0x00, rest @ ..] => decode_extended_body(rest)?,
            [lc, rest @ ..] => {
                let lc = *lc as usize;
                match rest.len() {
                    n if n == lc => (Some(rest.to_vec()), None),
                    n if n == lc + 1 => (Some(rest[..lc].to_vec()), Some(short_le(rest[lc]))),
                    n => return Err(Error::ShortLengthMismatch { lc, body: n }),
                }
            }
        };

        Self::try_new(cla, ins, p1, p2, payload, le)
    }
}

fn short_le(byte: u8) -> u32 {
    match byte {
        0 => SHORT_MAX_LE,
        b => b as u32,
    }
}

fn extended_le(hi: u8, lo: u8) -> u32 {
    match u16::from_be_bytes([hi, lo]) {
        0 => MAX_LE,
        l => l as u32,
    }
}

/// Decodes what follows the `00` marker of an extended frame.
fn decode_extended_body(rest: &[u8]) -> Result<(Option<Vec<u8>>, Option<u32>)> {
    match rest {
        [hi, lo] => Ok((None, Some(extended_le(*hi, *lo)))),
        [hi, lo, tail @ ..] => {
            let lc = u16::from_be_bytes([*hi, *lo]) as usize;

            match tail.len() {
                n if n == lc => Ok((Some(tail.to_vec()), None)),
                n if n == lc + 2 => Ok((
                    Some(tail[..lc].to_vec()),
                    Some(extended_le(tail[lc], tail[lc + 1])),
                )),
                n => Err(Error::ExtendedLengthMismatch { lc, body: n }),
            }
        }
        _ => Err(Error::ExtendedLengthTruncated(rest.len())),
    }
}

impl From<Command> for Vec<u8> {
    fn from(command: Command) -> Self {
        command.to_bytes()
    }
}

impl<'a> TryFrom<&'a [u8]> for Command {
    type Error = Error;

    fn try_from(bytes: &'a [u8]) -> Result<Self> {
        Self::from_bytes(bytes)
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode_upper(self.to_bytes()))
    }
}
