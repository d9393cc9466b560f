use crate::apdu::{self, StatusWord};
use crate::tlv;
use crate::transport::TransportError;

/// Error type of every fallible operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid APDU: {0}")]
    Apdu(#[from] apdu::Error),

    #[error("Malformed TLV: {0}")]
    Tlv(#[from] tlv::Error),

    #[error("Failed to parse the record: {0}")]
    Schema(#[from] tlv::schema::Error),

    #[error("No card is present")]
    CardNotPresent,

    #[error("Operation timed out")]
    Timeout,

    #[error("Error occurred on the platform: {0}")]
    Platform(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Device not found: {0}")]
    InvalidDeviceId(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Device {0} is already acquired")]
    AlreadyAcquired(String),

    #[error("Another command is in flight on this card")]
    Busy,

    #[error("Operation cancelled because the resource was released")]
    Cancelled,

    #[error("The {resource} is {state}")]
    InvalidState {
        resource: &'static str,
        state: &'static str,
    },

    #[error("The card returned an error status ({0})")]
    Status(StatusWord),
}

/// Coarse classification of [`Error`], for callers deciding how to react.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input: APDU, TLV or schema.
    Validation,
    CardNotPresent,
    Timeout,
    Platform,
    InvalidDeviceId,
    Unsupported,
    /// The resource is exclusively held by someone else.
    Conflict,
    /// A release unblocked the operation.
    Cancelled,
    InvalidState,
    /// A card operation completed with a non-success status word.
    Status,
}

impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Apdu(_) | Self::Tlv(_) | Self::Schema(_) => ErrorKind::Validation,
            Self::CardNotPresent => ErrorKind::CardNotPresent,
            Self::Timeout => ErrorKind::Timeout,
            Self::Platform(_) => ErrorKind::Platform,
            Self::InvalidDeviceId(_) => ErrorKind::InvalidDeviceId,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::AlreadyAcquired(_) | Self::Busy => ErrorKind::Conflict,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Status(_) => ErrorKind::Status,
        }
    }

    pub(crate) const fn invalid_state(resource: &'static str, state: &'static str) -> Self {
        Self::InvalidState { resource, state }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotFound(id) => Self::InvalidDeviceId(id),
            TransportError::CardNotPresent => Self::CardNotPresent,
            TransportError::Timeout => Self::Timeout,
            TransportError::Unsupported(what) => Self::Unsupported(what),
            TransportError::Platform(source) => Self::Platform(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
