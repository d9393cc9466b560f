//! Communicating with the card using NFC technology.
//!
//! NFC stacks live in the host (an Android `IsoDep` tag, a CoreNFC reader session), so this
//! backend is fed from the outside: the host registers the targets it exposes, reports tags as
//! they come and go, and carries APDU frames through a [`Handler`].
//!
//! ## Usage
//! ```rust
//! use std::sync::Arc;
//!
//! use cardlink::nfc::NfcBackend;
//! use cardlink::transport::{TargetDescriptor, TransportError};
//! use cardlink::Platform;
//!
//! let backend = Arc::new(
//!     NfcBackend::new(|_: &str, _command: &[u8]| -> Result<Vec<u8>, TransportError> {
//!         // Hand the frame to the host's NFC stack here.
//!         Ok(vec![0x90, 0x00])
//!     })
//!     .with_target(TargetDescriptor::new("nfc0", "Built-in NFC").with_protocols(["ISO-DEP"])),
//! );
//!
//! let platform = Platform::new(backend.clone());
//!
//! // Later, from the host's discovery callback:
//! backend.tag_discovered("nfc0");
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::transport::{CardEvent, ConnectionHandle, TargetDescriptor, Transport, TransportError};

const EVENT_CAPACITY: usize = 16;

/// A delegate carrying APDU frames to a tag through the host's NFC stack.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Transmits the frame to the tag on `target`, then receives the raw response from them.
    async fn handle(&self, target: &str, command: &[u8]) -> Result<Vec<u8>, TransportError>;
}

#[async_trait]
impl<F> Handler for F
where
    F: Fn(&str, &[u8]) -> Result<Vec<u8>, TransportError> + Send + Sync,
{
    async fn handle(&self, target: &str, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        self(target, command)
    }
}

struct Connection {
    target: String,
    alive: bool,
}

/// A backend driven by the host's NFC stack.
pub struct NfcBackend {
    handler: Box<dyn Handler>,
    push_events: bool,
    established: AtomicBool,
    targets: Mutex<Vec<TargetDescriptor>>,
    present: Mutex<HashSet<String>>,
    connections: Mutex<HashMap<ConnectionHandle, Connection>>,
    next_handle: AtomicU64,
    events: broadcast::Sender<CardEvent>,
}

impl NfcBackend {
    /// Creates a backend that pushes tag discovery to the lifecycle layer.
    pub fn new(handler: impl Handler + 'static) -> Self {
        Self::with_events(handler, true)
    }

    /// Creates a backend whose presence is polled instead, for hosts that cannot call back
    /// on discovery.
    pub fn polling(handler: impl Handler + 'static) -> Self {
        Self::with_events(handler, false)
    }

    fn with_events(handler: impl Handler + 'static, push_events: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            handler: Box::new(handler),
            push_events,
            established: AtomicBool::new(false),
            targets: Mutex::new(vec![]),
            present: Mutex::new(HashSet::new()),
            connections: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            events,
        }
    }

    pub fn with_target(self, descriptor: TargetDescriptor) -> Self {
        self.add_target(descriptor);
        self
    }

    /// Registers a target, replacing any previous one with the same identifier.
    pub fn add_target(&self, descriptor: TargetDescriptor) {
        let mut targets = self.targets.lock();

        targets.retain(|target| target.id != descriptor.id);
        targets.push(descriptor);
    }

    /// Unregisters a target. A tag on it is treated as lost.
    pub fn remove_target(&self, id: &str) {
        self.tag_lost(id);
        self.targets.lock().retain(|target| target.id != id);
    }

    /// Reports a tag entering the field of the target.
    pub fn tag_discovered(&self, target: &str) {
        if !self.present.lock().insert(target.to_string()) {
            return;
        }

        debug!("Tag discovered on {}", target);

        if self.push_events {
            let _ = self.events.send(CardEvent::Inserted {
                target: target.to_string(),
            });
        }
    }

    /// Reports the tag leaving the field of the target.
    /// Connections opened to it stay dead even if a tag comes back.
    pub fn tag_lost(&self, target: &str) {
        if !self.present.lock().remove(target) {
            return;
        }

        debug!("Tag lost on {}", target);

        self.connections
            .lock()
            .values_mut()
            .filter(|connection| connection.target == target)
            .for_each(|connection| connection.alive = false);

        if self.push_events {
            let _ = self.events.send(CardEvent::Removed {
                target: target.to_string(),
            });
        }
    }

    pub fn is_present(&self, target: &str) -> bool {
        self.present.lock().contains(target)
    }

    /// Number of connections not yet closed by the lifecycle layer.
    pub fn open_connections(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    fn ensure_established(&self) -> Result<(), TransportError> {
        match self.is_established() {
            true => Ok(()),
            false => Err(TransportError::platform("NFC backend is not established")),
        }
    }

    fn ensure_target(&self, target: &str) -> Result<(), TransportError> {
        match self.targets.lock().iter().any(|t| t.id == target) {
            true => Ok(()),
            false => Err(TransportError::NotFound(target.to_string())),
        }
    }
}

impl Debug for NfcBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfcBackend")
            .field("push_events", &self.push_events)
            .field("established", &self.is_established())
            .field("targets", &*self.targets.lock())
            .field("open_connections", &self.open_connections())
            .finish()
    }
}

#[async_trait]
impl Transport for NfcBackend {
    async fn establish(&self) -> Result<(), TransportError> {
        self.established.store(true, Ordering::Release);

        Ok(())
    }

    fn shutdown(&self) {
        self.established.store(false, Ordering::Release);
        self.connections.lock().clear();
    }

    async fn list_targets(&self) -> Result<Vec<TargetDescriptor>, TransportError> {
        self.ensure_established()?;

        Ok(self.targets.lock().clone())
    }

    async fn card_present(&self, target: &str) -> Result<bool, TransportError> {
        self.ensure_established()?;
        self.ensure_target(target)?;

        Ok(self.is_present(target))
    }

    async fn connect(&self, target: &str) -> Result<ConnectionHandle, TransportError> {
        self.ensure_established()?;
        self.ensure_target(target)?;

        if !self.is_present(target) {
            return Err(TransportError::CardNotPresent);
        }

        let handle = ConnectionHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.connections.lock().insert(
            handle,
            Connection {
                target: target.to_string(),
                alive: true,
            },
        );

        Ok(handle)
    }

    async fn exchange(
        &self,
        handle: ConnectionHandle,
        command: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let target = match self.connections.lock().get(&handle) {
            Some(Connection {
                target,
                alive: true,
            }) => target.clone(),
            Some(_) => return Err(TransportError::CardNotPresent),
            None => {
                return Err(TransportError::platform(format!(
                    "unknown connection {}",
                    handle
                )))
            }
        };

        self.handler.handle(&target, command).await
    }

    fn disconnect(&self, handle: ConnectionHandle) {
        self.connections.lock().remove(&handle);
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<CardEvent>> {
        self.push_events.then(|| self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> NfcBackend {
        NfcBackend::new(|_: &str, command: &[u8]| -> Result<Vec<u8>, TransportError> {
            let mut response = command.to_vec();
            response.extend_from_slice(&[0x90, 0x00]);
            Ok(response)
        })
        .with_target(TargetDescriptor::new("nfc0", "Built-in NFC"))
    }

    #[tokio::test]
    async fn test_requires_establish() {
        let backend = backend();

        assert!(backend.list_targets().await.is_err());

        backend.establish().await.unwrap();
        assert_eq!(1, backend.list_targets().await.unwrap().len());
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let backend = backend();
        backend.establish().await.unwrap();

        assert!(matches!(
            backend.connect("nfc0").await,
            Err(TransportError::CardNotPresent)
        ));
        assert!(matches!(
            backend.connect("nfc9").await,
            Err(TransportError::NotFound(_))
        ));

        backend.tag_discovered("nfc0");
        let handle = backend.connect("nfc0").await.unwrap();

        assert_eq!(
            vec![0x01, 0x90, 0x00],
            backend.exchange(handle, &[0x01]).await.unwrap()
        );

        backend.disconnect(handle);
        assert_eq!(0, backend.open_connections());
    }

    #[tokio::test]
    async fn test_lost_tag_kills_connections() {
        let backend = backend();
        backend.establish().await.unwrap();
        backend.tag_discovered("nfc0");

        let handle = backend.connect("nfc0").await.unwrap();
        backend.tag_lost("nfc0");
        backend.tag_discovered("nfc0");

        assert!(matches!(
            backend.exchange(handle, &[0x01]).await,
            Err(TransportError::CardNotPresent)
        ));
    }

    #[tokio::test]
    async fn test_events() {
        let backend = backend();
        let mut events = backend.subscribe().unwrap();

        backend.tag_discovered("nfc0");
        backend.tag_discovered("nfc0");
        backend.tag_lost("nfc0");

        assert_eq!(
            CardEvent::Inserted {
                target: "nfc0".into()
            },
            events.recv().await.unwrap()
        );
        assert_eq!(
            CardEvent::Removed {
                target: "nfc0".into()
            },
            events.recv().await.unwrap()
        );
    }

    #[test]
    fn test_polling_has_no_events() {
        let backend = NfcBackend::polling(|_: &str, _: &[u8]| -> Result<Vec<u8>, TransportError> {
            Ok(vec![0x90, 0x00])
        });

        assert!(backend.subscribe().is_none());
    }
}
