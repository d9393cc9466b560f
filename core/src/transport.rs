//! The capability set a backend provides to the lifecycle layer.
//!
//! A backend owns one shared context to the host's card stack (a PC/SC context, an NFC session
//! delegate) and any number of open connections identified by [`ConnectionHandle`].
//! It never tracks lifecycle state itself: [`crate::Platform`], [`crate::Device`] and
//! [`crate::Card`] decide when each call happens.

use std::fmt::{Debug, Display, Formatter};

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Static description of a target (a reader, an NFC tag slot) as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct TargetDescriptor {
    /// Identifier used to acquire the target. Unique within one backend.
    pub id: String,

    /// Human readable name.
    pub name: String,

    /// Whether the target can carry APDUs at all.
    pub apdu: bool,

    /// Whether the target accepts extended-length APDUs.
    pub extended_length: bool,

    /// Transport protocol tags such as `T=1` or `ISO-DEP`.
    pub protocols: Vec<String>,
}

impl TargetDescriptor {
    /// Describes an APDU-capable target with short APDUs only.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            apdu: true,
            extended_length: false,
            protocols: vec![],
        }
    }

    pub fn with_apdu(self, apdu: bool) -> Self {
        Self { apdu, ..self }
    }

    pub fn with_extended_length(self, extended_length: bool) -> Self {
        Self {
            extended_length,
            ..self
        }
    }

    pub fn with_protocols<I, S>(self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protocols: protocols.into_iter().map(Into::into).collect(),
            ..self
        }
    }
}

/// Opaque handle to an open connection, issued by [`Transport::connect`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl Display for ConnectionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Presence change pushed by backends that can observe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardEvent {
    Inserted { target: String },
    Removed { target: String },
}

impl CardEvent {
    pub fn target(&self) -> &str {
        match self {
            Self::Inserted { target } | Self::Removed { target } => target,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Target not found: {0}")]
    NotFound(String),

    #[error("No card is present on the target")]
    CardNotPresent,

    #[error("The target did not respond in time")]
    Timeout,

    #[error("Not supported by the backend: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Platform(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Wraps an arbitrary message or error as a platform failure.
    pub fn platform<E>(e: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Platform(e.into())
    }
}

/// A backend the lifecycle layer drives.
///
/// Methods may be called from any task; implementations must be safe to share.
/// Blocking host APIs belong on a blocking thread pool, never on the calling task.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Opens the shared context. Called once per platform initialisation.
    async fn establish(&self) -> Result<(), TransportError>;

    /// Closes the shared context and every connection still open.
    fn shutdown(&self);

    /// Enumerates the targets currently known to the host.
    async fn list_targets(&self) -> Result<Vec<TargetDescriptor>, TransportError>;

    /// Checks whether a card sits on the target right now.
    async fn card_present(&self, target: &str) -> Result<bool, TransportError>;

    /// Opens a connection to the card on the target.
    async fn connect(&self, target: &str) -> Result<ConnectionHandle, TransportError>;

    /// Sends one encoded APDU and returns the raw response, status bytes included.
    async fn exchange(
        &self,
        handle: ConnectionHandle,
        command: &[u8],
    ) -> Result<Vec<u8>, TransportError>;

    /// Closes the connection. Unknown handles are ignored.
    fn disconnect(&self, handle: ConnectionHandle);

    /// Subscribes to presence changes.
    /// Backends returning `None` are polled with [`Transport::card_present`] instead.
    fn subscribe(&self) -> Option<broadcast::Receiver<CardEvent>> {
        None
    }
}
