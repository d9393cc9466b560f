//! APDU (Application Protocol Data Unit) codec.
//!
//! Commands and responses are plain immutable values. [`Command::to_bytes`] and
//! [`Command::from_bytes`] convert between the value and its ISO/IEC 7816-4 frame, choosing
//! between the short and the extended length encoding. [`Response::from_bytes`] splits a
//! response frame into its payload and status bytes.

mod command;
mod response;

pub mod ins;

pub use command::Command;
pub use response::{Response, StatusWord};

/// Default class byte for interindustry commands.
pub const CLA_DEFAULT: u8 = 0x00;

/// Largest data field an APDU can carry (extended form).
pub const MAX_DATA_LEN: usize = 0xFFFF;

/// Largest `Le` an APDU can request (extended form, encoded as `00 00`).
pub const MAX_LE: u32 = 0x1_0000;

/// Largest data field the short form can carry.
pub(crate) const SHORT_MAX_DATA_LEN: usize = 0xFF;

/// Largest `Le` the short form can request (encoded as `00`).
pub(crate) const SHORT_MAX_LE: u32 = 0x100;

/// Errors raised while building, encoding or decoding APDUs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("{field} byte out of range: {value} is not in 0..=255")]
    HeaderOutOfRange { field: &'static str, value: u32 },

    #[error("Command data too long: {0} bytes (maximum is 65535)")]
    DataTooLong(usize),

    #[error("Le out of range: {0} (expected 1..=65536)")]
    LeOutOfRange(u32),

    #[error("Command frame too short: expected at least 4 bytes, got {0}")]
    CommandTooShort(usize),

    #[error("Response frame too short: expected at least 2 bytes, got {0}")]
    ResponseTooShort(usize),

    #[error("Inconsistent short Lc: Lc is {lc} but {body} bytes follow the header")]
    ShortLengthMismatch { lc: usize, body: usize },

    #[error("Truncated extended length field: {0} bytes follow the header")]
    ExtendedLengthTruncated(usize),

    #[error("Inconsistent extended Lc: Lc is {lc} but {body} bytes follow the length field")]
    ExtendedLengthMismatch { lc: usize, body: usize },
}

pub(crate) type Result<T> = std::result::Result<T, Error>;
