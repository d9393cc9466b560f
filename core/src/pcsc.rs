//! PC/SC support for cardlink.
//! Can be enabled by turning `pcsc` feature on.
//!
//! ## What is PC/SC?
//! PC/SC (Personal Computer/Smart Card) is an abstraction layer for communicating with Smart Cards
//! from Windows. Using this layer, applications can connect to any devices that supports PC/SC,
//! without depending on their driver implementation. Windows and macOS supports PC/SC by themselves,
//! Linux also supports by installing pcsc-lite shared library.
//!
//! ## Supported platform
//! Platforms that supports PC/SC are limited because they are subjected to use devices on PCs.
//! Linux, Windows and macOS are supported by pcsc-rust, backend of this implementation.
//! Refer the documentation of pcsc-rust for details:
//! <https://github.com/bluetech/pcsc-rust>
//!
//! ## Usage
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use cardlink::pcsc::PcscBackend;
//! use cardlink::Platform;
//!
//! # async fn run() -> cardlink::Result<()> {
//! let platform = Platform::new(Arc::new(PcscBackend::default()));
//! platform.init().await?;
//!
//! let reader = platform.get_device_info().await?.remove(0);
//! let device = platform.acquire_device(&reader.descriptor.id).await?;
//! device.wait_for_card_presence(Duration::from_secs(30)).await?;
//!
//! let card = device.start_session().await?;
//! # Ok(())
//! # }
//! ```
//!
//! PC/SC has no push notification through this backend: card presence is polled at
//! [`crate::Config::poll_interval`].

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use pcsc::{Protocols, ReaderState, State, MAX_BUFFER_SIZE_EXTENDED};

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use crate::transport::{ConnectionHandle, TargetDescriptor, Transport, TransportError};

/// Scope of the PC/SC context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Scope {
    User,
    System,
}

impl From<Scope> for pcsc::Scope {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::User => Self::User,
            Scope::System => Self::System,
        }
    }
}

/// Sharing mode of card connections.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ShareMode {
    Exclusive,
    Shared,
}

impl From<ShareMode> for pcsc::ShareMode {
    fn from(mode: ShareMode) -> Self {
        match mode {
            ShareMode::Exclusive => Self::Exclusive,
            ShareMode::Shared => Self::Shared,
        }
    }
}

/// Transmission protocols a connection may negotiate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Protocol {
    T0,
    T1,
    Any,
}

impl Protocol {
    fn tags(self) -> &'static [&'static str] {
        match self {
            Self::T0 => &["T=0"],
            Self::T1 => &["T=1"],
            Self::Any => &["T=0", "T=1"],
        }
    }
}

impl From<Protocol> for Protocols {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::T0 => Self::T0,
            Protocol::T1 => Self::T1,
            Protocol::Any => Self::ANY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PcscConfig {
    pub scope: Scope,
    pub share_mode: ShareMode,
    pub protocol: Protocol,

    /// Whether readers are reported as accepting extended-length APDUs.
    /// PC/SC cannot tell in advance; cards that do not support them answer with an error status.
    pub extended_length: bool,
}

impl Default for PcscConfig {
    fn default() -> Self {
        Self {
            scope: Scope::User,
            share_mode: ShareMode::Shared,
            protocol: Protocol::Any,
            extended_length: true,
        }
    }
}

/// A backend talking to readers through the host's PC/SC service.
///
/// Every PC/SC call blocks, so each one runs on the blocking thread pool.
#[derive(Default)]
pub struct PcscBackend {
    config: PcscConfig,
    context: RwLock<Option<pcsc::Context>>,
    cards: Mutex<HashMap<ConnectionHandle, Arc<pcsc::Card>>>,
    next_handle: AtomicU64,
}

impl PcscBackend {
    pub fn new(config: PcscConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &PcscConfig {
        &self.config
    }

    fn context(&self) -> Result<pcsc::Context, TransportError> {
        self.context
            .read()
            .clone()
            .ok_or_else(|| TransportError::platform("PC/SC context is not established"))
    }

    fn card(&self, handle: ConnectionHandle) -> Result<Arc<pcsc::Card>, TransportError> {
        self.cards.lock().get(&handle).cloned().ok_or_else(|| {
            TransportError::platform(format!("unknown connection {}", handle))
        })
    }
}

impl Debug for PcscBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcscBackend")
            .field("config", &self.config)
            .field("established", &self.context.read().is_some())
            .field("connections", &self.cards.lock().len())
            .finish()
    }
}

#[async_trait]
impl Transport for PcscBackend {
    async fn establish(&self) -> Result<(), TransportError> {
        let scope: pcsc::Scope = self.config.scope.into();
        let context = blocking(move || pcsc::Context::establish(scope)).await?;

        debug!("PC/SC context established");
        *self.context.write() = Some(context);

        Ok(())
    }

    fn shutdown(&self) {
        self.cards.lock().clear();

        if let Some(context) = self.context.write().take() {
            if let Err((_, e)) = context.release() {
                warn!("Failed to release the PC/SC context: {}", e);
            }
        }
    }

    async fn list_targets(&self) -> Result<Vec<TargetDescriptor>, TransportError> {
        let context = self.context()?;
        let readers = blocking(move || context.list_readers_owned()).await?;

        let protocols = self.config.protocol.tags();
        Ok(readers
            .into_iter()
            .map(|reader| {
                let name = reader.to_string_lossy().into_owned();

                TargetDescriptor::new(name.clone(), name)
                    .with_extended_length(self.config.extended_length)
                    .with_protocols(protocols.iter().copied())
            })
            .collect())
    }

    async fn card_present(&self, target: &str) -> Result<bool, TransportError> {
        let context = self.context()?;
        let reader = reader_name(target)?;

        let state = blocking(move || {
            let mut states = [ReaderState::new(reader, State::UNAWARE)];
            context
                .get_status_change(Some(std::time::Duration::ZERO), &mut states)
                .map(|_| states[0].event_state())
        })
        .await
        .map_err(|e| not_found_as(e, target))?;

        Ok(state.contains(State::PRESENT) && !state.contains(State::MUTE))
    }

    async fn connect(&self, target: &str) -> Result<ConnectionHandle, TransportError> {
        let context = self.context()?;
        let reader = reader_name(target)?;
        let share_mode: pcsc::ShareMode = self.config.share_mode.into();
        let protocols: Protocols = self.config.protocol.into();

        let card = blocking(move || context.connect(&reader, share_mode, protocols))
            .await
            .map_err(|e| not_found_as(e, target))?;

        let handle = ConnectionHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.cards.lock().insert(handle, Arc::new(card));

        debug!("Connected to the card on {} ({})", target, handle);

        Ok(handle)
    }

    async fn exchange(
        &self,
        handle: ConnectionHandle,
        command: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let card = self.card(handle)?;
        let tx = command.to_vec();

        blocking(move || {
            let mut rx = vec![0u8; MAX_BUFFER_SIZE_EXTENDED];
            let response = card.transmit(&tx, &mut rx)?;

            Ok(response.to_vec())
        })
        .await
    }

    fn disconnect(&self, handle: ConnectionHandle) {
        // Dropping the card leaves it powered for the next connection.
        self.cards.lock().remove(&handle);
    }
}

fn reader_name(target: &str) -> Result<CString, TransportError> {
    CString::new(target).map_err(|_| TransportError::NotFound(target.to_string()))
}

/// Runs a PC/SC call on the blocking thread pool.
async fn blocking<T, F>(call: F) -> Result<T, TransportError>
where
    F: FnOnce() -> Result<T, pcsc::Error> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(TransportError::platform)?
        .map_err(TransportError::from)
}

fn not_found_as(e: TransportError, target: &str) -> TransportError {
    match e {
        TransportError::NotFound(_) => TransportError::NotFound(target.to_string()),
        e => e,
    }
}

impl From<pcsc::Error> for TransportError {
    fn from(e: pcsc::Error) -> Self {
        match e {
            pcsc::Error::NoSmartcard
            | pcsc::Error::RemovedCard
            | pcsc::Error::UnpoweredCard
            | pcsc::Error::UnresponsiveCard => Self::CardNotPresent,
            pcsc::Error::UnknownReader | pcsc::Error::ReaderUnavailable => {
                Self::NotFound(String::new())
            }
            pcsc::Error::Timeout => Self::Timeout,
            pcsc::Error::UnsupportedFeature | pcsc::Error::UnsupportedCard => {
                Self::Unsupported(e.to_string())
            }
            e => Self::platform(e),
        }
    }
}
