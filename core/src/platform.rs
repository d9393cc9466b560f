//! The root of the lifecycle: one backend context and the devices acquired through it.

use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use crate::device::{Device, DeviceInfo, DeviceShared, DeviceState};
use crate::state;
use crate::transport::{CardEvent, Transport, TransportError};
use crate::{Config, Error, Result};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PlatformState {
    Uninitialized,
    Initialized,
    Released,
}

impl PlatformState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Released => "released",
        }
    }
}

impl Display for PlatformState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification of a lifecycle change, delivered through [`Platform::subscribe`].
///
/// Each card ends with exactly one of `CardReleased` or `CardLost`, each device with one
/// `DeviceReleased`, and the platform with one `PlatformReleased`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum LifecycleEvent {
    CardPresent { device: String },
    CardRemoved { device: String },
    CardLost { device: String },
    CardReleased { device: String },
    DeviceReleased { device: String },
    PlatformReleased,
}

/// Entry point of the lifecycle, owning the shared backend context.
///
/// Dropping the platform releases it along with every device and card acquired through it.
pub struct Platform {
    shared: Arc<PlatformShared>,
}

pub(crate) struct PlatformShared {
    transport: Arc<dyn Transport>,
    config: Config,
    state: watch::Sender<PlatformState>,
    init_lock: tokio::sync::Mutex<()>,
    event_driven: AtomicBool,
    devices: Mutex<HashMap<String, Arc<DeviceShared>>>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Platform {
    /// Creates an uninitialised platform over the backend with the default configuration.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, Config::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: Config) -> Self {
        let (state, _) = watch::channel(PlatformState::Uninitialized);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            shared: Arc::new(PlatformShared {
                transport,
                config,
                state,
                init_lock: tokio::sync::Mutex::new(()),
                event_driven: AtomicBool::new(false),
                devices: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn state(&self) -> PlatformState {
        self.shared.state()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Subscribes to lifecycle events of this platform and everything under it.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.events.subscribe()
    }

    /// Establishes the backend context.
    ///
    /// Fails with [`Error::InvalidState`] unless the platform is uninitialised: a released
    /// platform cannot be brought back, and initialising twice is a caller bug.
    pub async fn init(&self) -> Result<()> {
        let shared = &self.shared;
        let _init = shared.init_lock.lock().await;

        let current = shared.state();
        if current != PlatformState::Uninitialized {
            return Err(Error::invalid_state("platform", current.as_str()));
        }

        debug!("Establishing the backend context");
        if let Err(e) = shared.until_released(shared.transport.establish()).await {
            if matches!(e, Error::Cancelled) {
                shared.transport.shutdown();
            }

            return Err(e);
        }

        if let Some(events) = shared.transport.subscribe() {
            shared.event_driven.store(true, Ordering::Release);
            tokio::spawn(watch_card_events(
                Arc::downgrade(shared),
                events,
                shared.state.subscribe(),
            ));
        }

        if state::transition(
            &shared.state,
            &[PlatformState::Uninitialized],
            PlatformState::Initialized,
        )
        .is_err()
        {
            // Released between establishing and here; nobody else will shut the context down.
            shared.transport.shutdown();
            return Err(Error::Cancelled);
        }

        debug!("Platform initialised");

        Ok(())
    }

    /// Lists every target the backend knows, with the state of the ones acquired here.
    pub async fn get_device_info(&self) -> Result<Vec<DeviceInfo>> {
        let shared = &self.shared;
        shared.ensure_initialized()?;

        let targets = shared
            .until_released(shared.transport.list_targets())
            .await?;
        let devices = shared.devices.lock();

        Ok(targets
            .into_iter()
            .map(|descriptor| {
                let state = devices
                    .get(&descriptor.id)
                    .map_or(DeviceState::Idle, |device| device.state());

                DeviceInfo { descriptor, state }
            })
            .collect())
    }

    /// Takes exclusive ownership of a target.
    ///
    /// Fails with [`Error::AlreadyAcquired`] while another [`Device`] holds the same target.
    pub async fn acquire_device(&self, id: &str) -> Result<Device> {
        let shared = &self.shared;
        shared.ensure_initialized()?;

        let descriptor = shared
            .until_released(shared.transport.list_targets())
            .await?
            .into_iter()
            .find(|target| target.id == id)
            .ok_or_else(|| Error::InvalidDeviceId(id.to_string()))?;

        let mut devices = shared.devices.lock();
        shared.ensure_initialized()?;

        if devices.contains_key(id) {
            return Err(Error::AlreadyAcquired(id.to_string()));
        }

        let device = DeviceShared::new(
            descriptor,
            Arc::clone(&shared.transport),
            shared.config.clone(),
            shared.event_driven.load(Ordering::Acquire),
            shared.events.clone(),
            Arc::downgrade(shared),
        );
        devices.insert(id.to_string(), Arc::clone(&device));

        debug!("Acquired device: {}", id);

        Ok(Device::new(device))
    }

    /// Releases the platform, cascading to every device and card under it.
    /// Releasing twice is a no-op.
    pub fn release(&self) {
        self.shared.release();
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl Debug for Platform {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("transport", &self.shared.transport)
            .field("state", &self.shared.state())
            .field("devices", &self.shared.devices.lock().len())
            .finish()
    }
}

impl PlatformShared {
    fn state(&self) -> PlatformState {
        *self.state.borrow()
    }

    fn ensure_initialized(&self) -> Result<()> {
        match self.state() {
            PlatformState::Initialized => Ok(()),
            state => Err(Error::invalid_state("platform", state.as_str())),
        }
    }

    /// Runs a backend call, giving up with [`Error::Cancelled`] once the platform is released.
    async fn until_released<F, T>(&self, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, TransportError>>,
    {
        let released = state::wait_until(self.state.subscribe(), |s| {
            *s == PlatformState::Released
        });

        tokio::select! {
            outcome = call => Ok(outcome?),
            _ = released => Err(Error::Cancelled),
        }
    }

    fn release(&self) {
        let previous = match state::transition(
            &self.state,
            &[PlatformState::Uninitialized, PlatformState::Initialized],
            PlatformState::Released,
        ) {
            Ok(previous) => previous,
            Err(_) => return,
        };

        let devices = self
            .devices
            .lock()
            .drain()
            .map(|(_, device)| device)
            .collect::<Vec<_>>();

        for device in devices {
            device.release();
        }

        if previous == PlatformState::Initialized {
            self.transport.shutdown();
        }

        debug!("Platform released");
        let _ = self.events.send(LifecycleEvent::PlatformReleased);
    }

    pub(crate) fn forget_device(&self, device: &DeviceShared) {
        let mut devices = self.devices.lock();

        let owned = devices
            .get(device.id())
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), device));
        if owned {
            devices.remove(device.id());
        }
    }

    fn dispatch(&self, event: &CardEvent) {
        let device = self.devices.lock().get(event.target()).cloned();

        if let Some(device) = device {
            device.on_card_event(event);
        }
    }
}

/// Forwards presence changes from an event-driven backend to the acquired devices.
async fn watch_card_events(
    platform: Weak<PlatformShared>,
    mut events: broadcast::Receiver<CardEvent>,
    state: watch::Receiver<PlatformState>,
) {
    let released = state::wait_until(state, |s| *s == PlatformState::Released);
    tokio::pin!(released);

    loop {
        let received = tokio::select! {
            received = events.recv() => received,
            _ = &mut released => break,
        };

        match received {
            Ok(event) => {
                let Some(platform) = platform.upgrade() else {
                    break;
                };

                platform.dispatch(&event);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Missed {} card events; presence may be stale", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    debug!("Stopped watching card events");
}
