//! A bridge between applications and smart cards.
//!
//! The crate is made of three layers:
//!
//! - [`apdu`] encodes and decodes command and response APDUs (ISO/IEC 7816-4).
//! - [`tlv`] parses BER-TLV structures, and [`tlv::schema`] maps them onto typed records.
//! - [`Platform`], [`Device`] and [`Card`] drive a card through its lifecycle over any
//!   [`transport::Transport`] backend, such as [`nfc::NfcBackend`] or `pcsc::PcscBackend`.
//!
//! ## Usage
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use cardlink::apdu::Command;
//! use cardlink::nfc::NfcBackend;
//! use cardlink::transport::{TargetDescriptor, TransportError};
//! use cardlink::Platform;
//!
//! # async fn run() -> cardlink::Result<()> {
//! let backend = NfcBackend::new(|_: &str, _: &[u8]| -> Result<Vec<u8>, TransportError> {
//!     Ok(vec![0x90, 0x00])
//! })
//! .with_target(TargetDescriptor::new("nfc0", "Built-in NFC"));
//!
//! let platform = Platform::new(Arc::new(backend));
//! platform.init().await?;
//!
//! let device = platform.acquire_device("nfc0").await?;
//! device.wait_for_card_presence(Duration::from_secs(30)).await?;
//!
//! let card = device.start_session().await?;
//! let response = card.transmit(&Command::select_df(vec![0xD3, 0x92])?).await?;
//! assert!(response.sw().is_success());
//! # Ok(())
//! # }
//! ```

// Logging macros compile to nothing unless the `tracing` feature is on.
// Modules import the real ones with `#[cfg(feature = "tracing")] use tracing::...`.
#[cfg(not(feature = "tracing"))]
macro_rules! trace {
    ($($t: tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug {
    ($($t: tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! info {
    ($($t: tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn {
    ($($t: tt)*) => {};
}

#[cfg(feature = "pcsc")]
pub mod pcsc;

pub mod apdu;
pub mod card;
pub mod config;
pub mod device;
pub mod error;
pub mod nfc;
pub mod ops;
pub mod platform;
mod state;
pub mod tlv;
pub mod transport;

pub use card::{Card, CardState};
pub use config::Config;
pub use device::{Device, DeviceInfo, DeviceState};
pub use error::{Error, ErrorKind, Result};
pub use platform::{LifecycleEvent, Platform, PlatformState};
