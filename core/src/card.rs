//! A live session with the card on an acquired device.

use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};

#[cfg(feature = "tracing")]
use tracing::{debug, info, trace};

use crate::apdu::{Command, Response};
use crate::device::DeviceShared;
use crate::platform::LifecycleEvent;
use crate::state;
use crate::transport::{ConnectionHandle, Transport, TransportError};
use crate::{Error, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum CardState {
    Active,
    Released,
    /// The card left the target while the session was open.
    Lost,
}

impl CardState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Released => "released",
            Self::Lost => "lost",
        }
    }
}

impl Display for CardState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exclusive handle to a card session.
///
/// Commands are exchanged one at a time: a [`Card::transmit`] issued while another is in
/// flight fails with [`Error::Busy`] instead of queueing. Dropping the handle releases the
/// session and returns the device to [`crate::DeviceState::CardPresent`].
pub struct Card {
    shared: Arc<CardShared>,
}

pub(crate) struct CardShared {
    device_id: String,
    device: Weak<DeviceShared>,
    handle: ConnectionHandle,
    transport: Arc<dyn Transport>,
    exchange_timeout: Option<Duration>,
    extended_length: bool,
    state: watch::Sender<CardState>,
    exchange: tokio::sync::Mutex<()>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Card {
    pub(crate) fn new(shared: Arc<CardShared>) -> Self {
        Self { shared }
    }

    /// Identifier of the device this card sits on.
    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    pub fn state(&self) -> CardState {
        self.shared.state()
    }

    /// Whether extended-length commands may be sent to this card.
    pub fn supports_extended_length(&self) -> bool {
        self.shared.extended_length
    }

    /// Transmits a command to the card, then receives a response from them.
    ///
    /// The status word is returned as-is; interpreting it is up to the caller.
    /// If the backend reports the card gone, the session becomes [`CardState::Lost`] and
    /// [`Error::CardNotPresent`] is returned.
    pub async fn transmit(&self, command: &Command) -> Result<Response> {
        let shared = &self.shared;
        let _exchange = shared.exchange.try_lock().map_err(|_| Error::Busy)?;

        shared.ensure_active()?;

        if command.is_extended() && !shared.extended_length {
            return Err(Error::Unsupported(format!(
                "extended-length APDU on {}",
                shared.device_id
            )));
        }

        let tx = command.to_bytes();
        trace!("TX: {}", hex::encode(&tx));

        let finished = state::wait_until(shared.state.subscribe(), |s| *s != CardState::Active);
        let exchanged = tokio::select! {
            exchanged = with_deadline(
                shared.exchange_timeout,
                shared.transport.exchange(shared.handle, &tx),
            ) => exchanged,
            state = finished => {
                return Err(match state {
                    CardState::Lost => Error::CardNotPresent,
                    _ => Error::Cancelled,
                });
            }
        };

        match exchanged {
            Ok(rx) => {
                trace!("RX: {}", hex::encode(&rx));

                Ok(Response::from_bytes(&rx)?)
            }
            Err(TransportError::CardNotPresent) => {
                shared.mark_lost();

                Err(Error::CardNotPresent)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ends the session. Releasing twice, or after the card was lost, is a no-op.
    pub fn release(&self) {
        self.shared.release();
    }
}

impl Drop for Card {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl Debug for Card {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Card")
            .field("device_id", &self.shared.device_id)
            .field("handle", &self.shared.handle)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl CardShared {
    pub(crate) fn new(
        device_id: String,
        device: Weak<DeviceShared>,
        handle: ConnectionHandle,
        transport: Arc<dyn Transport>,
        exchange_timeout: Option<Duration>,
        extended_length: bool,
        events: broadcast::Sender<LifecycleEvent>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(CardState::Active);

        Arc::new(Self {
            device_id,
            device,
            handle,
            transport,
            exchange_timeout,
            extended_length,
            state,
            exchange: tokio::sync::Mutex::new(()),
            events,
        })
    }

    fn state(&self) -> CardState {
        *self.state.borrow()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            CardState::Active => Ok(()),
            CardState::Lost => Err(Error::CardNotPresent),
            state => Err(Error::invalid_state("card", state.as_str())),
        }
    }

    pub(crate) fn release(&self) {
        self.finish(CardState::Released);
    }

    pub(crate) fn mark_lost(&self) {
        self.finish(CardState::Lost);
    }

    fn finish(&self, to: CardState) {
        if state::transition(&self.state, &[CardState::Active], to).is_err() {
            return;
        }

        self.transport.disconnect(self.handle);

        let device = self.device_id.clone();
        let event = match to {
            CardState::Lost => {
                info!("Card on {} was lost", device);
                LifecycleEvent::CardLost { device }
            }
            _ => {
                debug!("Card on {} released", device);
                LifecycleEvent::CardReleased { device }
            }
        };

        if let Some(device) = self.device.upgrade() {
            device.on_card_finished(self, to == CardState::Lost);
        }

        let _ = self.events.send(event);
    }
}

async fn with_deadline<F, T>(
    deadline: Option<Duration>,
    call: F,
) -> std::result::Result<T, TransportError>
where
    F: Future<Output = std::result::Result<T, TransportError>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, call)
            .await
            .unwrap_or(Err(TransportError::Timeout)),
        None => call.await,
    }
}
