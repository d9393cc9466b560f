//! A target acquired from a [`crate::Platform`], waiting for or holding a card.

use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

#[cfg(feature = "tracing")]
use tracing::{debug, info};

use crate::card::{Card, CardShared};
use crate::platform::{LifecycleEvent, PlatformShared};
use crate::state;
use crate::transport::{CardEvent, TargetDescriptor, Transport};
use crate::{Config, Error, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceState {
    /// Known to the backend but not acquired.
    Idle,
    Acquired,
    AwaitingCard,
    CardPresent,
    SessionActive,
    Released,
}

impl DeviceState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Acquired => "acquired",
            Self::AwaitingCard => "awaiting a card",
            Self::CardPresent => "holding a card",
            Self::SessionActive => "in a session",
            Self::Released => "released",
        }
    }
}

impl Display for DeviceState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A target as listed by [`crate::Platform::get_device_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceInfo {
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub descriptor: TargetDescriptor,
    pub state: DeviceState,
}

/// Exclusive handle to an acquired target.
///
/// Dropping the handle releases the device and any card session on it.
pub struct Device {
    shared: Arc<DeviceShared>,
}

pub(crate) struct DeviceShared {
    descriptor: TargetDescriptor,
    transport: Arc<dyn Transport>,
    config: Config,
    event_driven: bool,
    state: watch::Sender<DeviceState>,
    card: Mutex<Option<Arc<CardShared>>>,
    events: broadcast::Sender<LifecycleEvent>,
    platform: Weak<PlatformShared>,
}

impl Device {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> &str {
        self.shared.id()
    }

    pub fn descriptor(&self) -> &TargetDescriptor {
        &self.shared.descriptor
    }

    pub fn state(&self) -> DeviceState {
        self.shared.state()
    }

    /// Suspends until a card is on the target.
    ///
    /// Returns immediately when a card is already known to be present.
    /// On timeout the device goes back to [`DeviceState::Acquired`] and [`Error::Timeout`] is
    /// returned; a release while waiting yields [`Error::Cancelled`].
    pub async fn wait_for_card_presence(&self, timeout: Duration) -> Result<()> {
        let shared = &self.shared;

        match state::transition(
            &shared.state,
            &[DeviceState::Acquired, DeviceState::AwaitingCard],
            DeviceState::AwaitingCard,
        ) {
            Ok(_) => {}
            Err(DeviceState::CardPresent) => return Ok(()),
            Err(state) => return Err(Error::invalid_state("device", state.as_str())),
        }

        info!("Waiting for a card on {}", shared.id());

        let released = state::wait_until(shared.state.subscribe(), |s| {
            *s == DeviceState::Released
        });
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(timeout, shared.presence()) => outcome,
            _ = released => return Err(Error::Cancelled),
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                shared.stop_waiting();
                Err(e)
            }
            Err(_) => {
                debug!("No card appeared on {} in {:?}", shared.id(), timeout);
                shared.stop_waiting();
                Err(Error::Timeout)
            }
        }
    }

    /// Opens a session with the card on the target.
    ///
    /// A device that has not seen a card yet is checked implicitly: the backend reports
    /// [`Error::CardNotPresent`] when there is none. If connecting fails for any reason, the
    /// device goes back to [`DeviceState::AwaitingCard`]. A device owns at most one live card.
    pub async fn start_session(&self) -> Result<Card> {
        let shared = &self.shared;

        if !shared.descriptor.apdu {
            return Err(Error::Unsupported(format!(
                "{} does not carry APDUs",
                shared.id()
            )));
        }

        state::transition(
            &shared.state,
            &[
                DeviceState::Acquired,
                DeviceState::AwaitingCard,
                DeviceState::CardPresent,
            ],
            DeviceState::SessionActive,
        )
        .map_err(|state| Error::invalid_state("device", state.as_str()))?;

        debug!("Connecting to the card on {}", shared.id());

        let released = state::wait_until(shared.state.subscribe(), |s| {
            *s == DeviceState::Released
        });
        let connected = tokio::select! {
            connected = shared.transport.connect(shared.id()) => connected,
            _ = released => return Err(Error::Cancelled),
        };

        let handle = match connected {
            Ok(handle) => handle,
            Err(e) => {
                // Whatever was seen before, the card cannot be assumed present any more.
                let _ = state::transition(
                    &shared.state,
                    &[DeviceState::SessionActive],
                    DeviceState::AwaitingCard,
                );

                return Err(e.into());
            }
        };

        let card = CardShared::new(
            shared.id().to_string(),
            Arc::downgrade(shared),
            handle,
            Arc::clone(&shared.transport),
            shared.config.exchange_timeout,
            shared.descriptor.extended_length && shared.config.allow_extended,
            shared.events.clone(),
        );

        {
            let mut slot = shared.card.lock();
            if shared.state() != DeviceState::SessionActive {
                drop(slot);
                shared.transport.disconnect(handle);

                return Err(Error::Cancelled);
            }

            *slot = Some(Arc::clone(&card));
        }

        debug!("Session started on {} ({})", shared.id(), handle);

        Ok(Card::new(card))
    }

    /// Releases the device, ending the card session on it if any.
    /// Releasing twice is a no-op.
    pub fn release(&self) {
        self.shared.release();
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("descriptor", &self.shared.descriptor)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl DeviceShared {
    pub(crate) fn new(
        descriptor: TargetDescriptor,
        transport: Arc<dyn Transport>,
        config: Config,
        event_driven: bool,
        events: broadcast::Sender<LifecycleEvent>,
        platform: Weak<PlatformShared>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(DeviceState::Acquired);

        Arc::new(Self {
            descriptor,
            transport,
            config,
            event_driven,
            state,
            card: Mutex::new(None),
            events,
            platform,
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub(crate) fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    /// Resolves once a card is known to be on the target.
    async fn presence(&self) -> Result<()> {
        if self.transport.card_present(self.id()).await? {
            return self.mark_present();
        }

        if self.event_driven {
            let reached = state::wait_until(self.state.subscribe(), |s| {
                matches!(
                    s,
                    DeviceState::CardPresent | DeviceState::SessionActive | DeviceState::Released
                )
            })
            .await;

            return match reached {
                DeviceState::Released => Err(Error::Cancelled),
                _ => Ok(()),
            };
        }

        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            if self.transport.card_present(self.id()).await? {
                return self.mark_present();
            }
        }
    }

    fn mark_present(&self) -> Result<()> {
        match state::transition(
            &self.state,
            &[DeviceState::Acquired, DeviceState::AwaitingCard],
            DeviceState::CardPresent,
        ) {
            Ok(_) => {
                info!("Card detected on {}", self.id());
                let _ = self.events.send(LifecycleEvent::CardPresent {
                    device: self.id().to_string(),
                });

                Ok(())
            }
            Err(DeviceState::CardPresent | DeviceState::SessionActive) => Ok(()),
            Err(_) => Err(Error::Cancelled),
        }
    }

    fn stop_waiting(&self) {
        let _ = state::transition(
            &self.state,
            &[DeviceState::AwaitingCard],
            DeviceState::Acquired,
        );
    }

    pub(crate) fn on_card_event(&self, event: &CardEvent) {
        match event {
            CardEvent::Inserted { .. } => {
                let _ = self.mark_present();
            }
            CardEvent::Removed { .. } => {
                if state::transition(
                    &self.state,
                    &[DeviceState::CardPresent],
                    DeviceState::AwaitingCard,
                )
                .is_ok()
                {
                    info!("Card removed from {}", self.id());
                    let _ = self.events.send(LifecycleEvent::CardRemoved {
                        device: self.id().to_string(),
                    });
                }

                let card = self.card.lock().clone();
                if let Some(card) = card {
                    card.mark_lost();
                }
            }
        }
    }

    /// Called by a card once it reached a terminal state.
    pub(crate) fn on_card_finished(&self, card: &CardShared, lost: bool) {
        {
            let mut slot = self.card.lock();
            let current = slot
                .as_ref()
                .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), card));
            if current {
                slot.take();
            }
        }

        let next = match lost {
            true => DeviceState::AwaitingCard,
            false => DeviceState::CardPresent,
        };
        let _ = state::transition(&self.state, &[DeviceState::SessionActive], next);
    }

    pub(crate) fn release(&self) {
        if self.state.send_replace(DeviceState::Released) == DeviceState::Released {
            return;
        }

        let card = self.card.lock().take();
        if let Some(card) = card {
            card.release();
        }

        debug!("Device released: {}", self.id());
        let _ = self.events.send(LifecycleEvent::DeviceReleased {
            device: self.id().to_string(),
        });

        if let Some(platform) = self.platform.upgrade() {
            platform.forget_device(self);
        }
    }
}
