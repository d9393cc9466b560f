//! Common file-system and security operations on a [`Card`] session.
//!
//! Unlike [`Card::transmit`], these interpret the status word: anything but success is
//! returned as [`Error::Status`].

use crate::apdu::{Command, Response, StatusWord};
use crate::tlv;
use crate::{Card, Error, Result};

/// The highest offset `READ BINARY` can address with a 15-bit offset.
const MAX_READ_OFFSET: u16 = 0x7FFF;

/// Octets read to size a TLV-encoded file: a 4-byte tag and a 3-byte length.
const TLV_SIZE_PROBE: u16 = 7;

/// `6B00`: the offset lies beyond the end of the file.
const SW_WRONG_OFFSET: u16 = 0x6B00;

impl Card {
    /// Selects a DF with their name.
    pub async fn select_df(&self, name: &[u8]) -> Result<()> {
        self.call(Command::select_df(name.to_vec())?).await.map(|_| ())
    }

    /// Selects a EF with their identifier.
    pub async fn select_ef(&self, id: [u8; 2]) -> Result<()> {
        self.call(Command::select_ef(id.to_vec())?).await.map(|_| ())
    }

    /// Reads binary from the selected file for `len` octets max.
    /// Without `len`, reads until the card returns a short fragment or the end of the file.
    pub async fn read_binary(&self, len: Option<u16>) -> Result<Vec<u8>> {
        let mut pos: u16 = 0;
        let mut buf: Vec<u8> = Vec::new();

        while len.map_or(true, |l| pos < l) {
            if pos > MAX_READ_OFFSET {
                return Err(Error::Unsupported(format!(
                    "reading beyond offset {:#06X}",
                    MAX_READ_OFFSET
                )));
            }

            let le = match len {
                Some(l) => u32::from(l - pos).min(0x100),
                None => 0x100,
            };

            let fragment = match self.call(Command::read_binary(pos, le)?).await {
                Ok(fragment) => fragment,
                Err(Error::Status(sw))
                    if len.is_none() && !buf.is_empty() && sw == SW_WRONG_OFFSET =>
                {
                    break;
                }
                Err(e) => return Err(e),
            };

            let length = fragment.len();
            buf.extend_from_slice(&fragment);

            if length == 0 || (length as u32) < le {
                break;
            }

            pos = pos.saturating_add(length as u16);
        }

        Ok(buf)
    }

    /// Verifies the PIN against the selected EF.
    pub async fn verify(&self, pin: &[u8]) -> Result<()> {
        self.call(Command::verify(pin.to_vec())?).await.map(|_| ())
    }

    /// Selects a EF then verifies the pin using the EF.
    pub async fn verify_pin(&self, ef: [u8; 2], pin: &[u8]) -> Result<()> {
        self.select_ef(ef).await?;
        self.verify(pin).await
    }

    /// Queries how many PIN attempts remain on the EF, without consuming one.
    pub async fn pin_status(&self, ef: [u8; 2]) -> Result<u8> {
        self.select_ef(ef).await?;

        let sw = self.transmit(&Command::verify(vec![])?).await?.sw();
        sw.remaining_retries().ok_or(Error::Status(sw))
    }

    /// Computes a signature over the digest using the selected key.
    pub async fn sign(&self, digest: &[u8]) -> Result<Vec<u8>> {
        self.call(Command::sign(digest.to_vec())?).await
    }

    /// Extracts the size of current file by reading its TLV header.
    pub async fn read_tlv_size(&self) -> Result<u16> {
        let header = self.read_binary(Some(TLV_SIZE_PROBE)).await?;
        let size = tlv::encoded_len(&header)?;

        u16::try_from(size)
            .map_err(|_| Error::Unsupported(format!("file of {} octets", size)))
    }

    /// Reads the whole TLV-encoded current file.
    pub async fn read_tlv_file(&self) -> Result<Vec<u8>> {
        let size = self.read_tlv_size().await?;

        self.read_binary(Some(size)).await
    }

    /// Transmits a command and returns its payload if it succeeded.
    /// Responses announcing more data (`61xx`) are followed with `GET RESPONSE`.
    async fn call(&self, command: Command) -> Result<Vec<u8>> {
        let mut response = self.transmit(&command).await?;
        let mut payload = Vec::new();

        while let Some(remaining) = response.sw().bytes_remaining() {
            payload.extend_from_slice(response.payload());
            response = self.transmit(&Command::get_response(remaining)?).await?;
        }

        into_payload(payload, response)
    }
}

fn into_payload(mut payload: Vec<u8>, response: Response) -> Result<Vec<u8>> {
    let sw: StatusWord = response.sw();
    if !sw.is_success() {
        return Err(Error::Status(sw));
    }

    payload.extend(response.into_payload());

    Ok(payload)
}
