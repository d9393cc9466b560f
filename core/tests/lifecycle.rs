mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cardlink::apdu::Command;
use cardlink::nfc::NfcBackend;
use cardlink::transport::{ConnectionHandle, TargetDescriptor, Transport, TransportError};
use cardlink::{
    CardState, Config, DeviceState, ErrorKind, LifecycleEvent, Platform, PlatformState,
};
use tokio::time::{sleep, Instant};

use common::{backend, platform, platform_with, polling_backend, slow_backend, FIXTURE};

fn select() -> Command {
    Command::select_df(vec![0xD3, 0x92, 0xF0, 0x00]).unwrap()
}

#[tokio::test]
async fn test_init_and_list() {
    let backend = backend();
    let platform = platform(&backend).await;

    assert_eq!(PlatformState::Initialized, platform.state());

    let devices = platform.get_device_info().await.unwrap();
    assert_eq!(1, devices.len());
    assert_eq!(FIXTURE, devices[0].descriptor.id);
    assert_eq!(DeviceState::Idle, devices[0].state);

    let _device = platform.acquire_device(FIXTURE).await.unwrap();
    let devices = platform.get_device_info().await.unwrap();
    assert_eq!(DeviceState::Acquired, devices[0].state);
}

#[tokio::test]
async fn test_requires_init() {
    let platform = Platform::new(backend());

    let e = platform.get_device_info().await.unwrap_err();
    assert_eq!(ErrorKind::InvalidState, e.kind());

    let e = platform.acquire_device(FIXTURE).await.unwrap_err();
    assert_eq!(ErrorKind::InvalidState, e.kind());
}

#[tokio::test]
async fn test_init_twice() {
    let backend = backend();
    let platform = platform(&backend).await;

    let e = platform.init().await.unwrap_err();
    assert_eq!(ErrorKind::InvalidState, e.kind());

    platform.release();
    let e = platform.init().await.unwrap_err();
    assert_eq!(ErrorKind::InvalidState, e.kind());
}

#[tokio::test]
async fn test_acquire_conflict() {
    let backend = backend();
    let platform = platform(&backend).await;

    let device = platform.acquire_device(FIXTURE).await.unwrap();
    let e = platform.acquire_device(FIXTURE).await.unwrap_err();
    assert_eq!(ErrorKind::Conflict, e.kind());

    drop(device);
    let device = platform.acquire_device(FIXTURE).await.unwrap();
    assert_eq!(DeviceState::Acquired, device.state());
}

#[tokio::test]
async fn test_acquire_unknown() {
    let backend = backend();
    let platform = platform(&backend).await;

    let e = platform.acquire_device("nowhere").await.unwrap_err();
    assert_eq!(ErrorKind::InvalidDeviceId, e.kind());
}

#[tokio::test(start_paused = true)]
async fn test_wait_timeout() {
    let backend = polling_backend();
    let platform = platform(&backend).await;
    let device = platform.acquire_device(FIXTURE).await.unwrap();

    let started = Instant::now();
    let e = device
        .wait_for_card_presence(Duration::from_secs(1))
        .await
        .unwrap_err();

    assert_eq!(ErrorKind::Timeout, e.kind());
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(DeviceState::Acquired, device.state());
}

#[tokio::test(start_paused = true)]
async fn test_wait_polled() {
    let backend = polling_backend();
    let platform = platform(&backend).await;
    let device = platform.acquire_device(FIXTURE).await.unwrap();

    let feeder = Arc::clone(&backend);
    tokio::spawn(async move {
        sleep(Duration::from_millis(600)).await;
        feeder.tag_discovered(FIXTURE);
    });

    device
        .wait_for_card_presence(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(DeviceState::CardPresent, device.state());
}

#[tokio::test(start_paused = true)]
async fn test_wait_event_driven() {
    let backend = backend();
    let platform = platform(&backend).await;
    let mut events = platform.subscribe();
    let device = platform.acquire_device(FIXTURE).await.unwrap();

    let feeder = Arc::clone(&backend);
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        feeder.tag_discovered(FIXTURE);
    });

    device
        .wait_for_card_presence(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(DeviceState::CardPresent, device.state());
    assert_eq!(
        LifecycleEvent::CardPresent {
            device: FIXTURE.into()
        },
        events.recv().await.unwrap()
    );
}

#[tokio::test]
async fn test_wait_with_card_already_present() {
    let backend = backend();
    backend.tag_discovered(FIXTURE);

    let platform = platform(&backend).await;
    let device = platform.acquire_device(FIXTURE).await.unwrap();

    device
        .wait_for_card_presence(Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(DeviceState::CardPresent, device.state());
}

#[tokio::test]
async fn test_session() {
    let backend = backend();
    backend.tag_discovered(FIXTURE);

    let platform = platform(&backend).await;
    let mut events = platform.subscribe();
    let device = platform.acquire_device(FIXTURE).await.unwrap();
    device
        .wait_for_card_presence(Duration::from_secs(1))
        .await
        .unwrap();

    let card = device.start_session().await.unwrap();
    assert_eq!(DeviceState::SessionActive, device.state());
    assert_eq!(1, backend.open_connections());

    let e = device.start_session().await.unwrap_err();
    assert_eq!(ErrorKind::InvalidState, e.kind());

    let response = card.transmit(&select()).await.unwrap();
    assert!(response.sw().is_success());
    assert_eq!(&[0x00, 0xA4, 0x04, 0x0C], response.payload());

    card.release();
    card.release();

    assert_eq!(CardState::Released, card.state());
    assert_eq!(DeviceState::CardPresent, device.state());
    assert_eq!(0, backend.open_connections());

    let e = card.transmit(&select()).await.unwrap_err();
    assert_eq!(ErrorKind::InvalidState, e.kind());

    assert_eq!(
        LifecycleEvent::CardPresent {
            device: FIXTURE.into()
        },
        events.recv().await.unwrap()
    );
    assert_eq!(
        LifecycleEvent::CardReleased {
            device: FIXTURE.into()
        },
        events.recv().await.unwrap()
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_session_without_card() {
    let backend = backend();
    let platform = platform(&backend).await;
    let device = platform.acquire_device(FIXTURE).await.unwrap();

    let e = device.start_session().await.unwrap_err();
    assert_eq!(ErrorKind::CardNotPresent, e.kind());
    assert_eq!(DeviceState::AwaitingCard, device.state());
}

/// A reader that always holds a card but fails to open connections to it.
#[derive(Debug)]
struct Jammed;

#[async_trait]
impl Transport for Jammed {
    async fn establish(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn shutdown(&self) {}

    async fn list_targets(&self) -> Result<Vec<TargetDescriptor>, TransportError> {
        Ok(vec![common::descriptor()])
    }

    async fn card_present(&self, _: &str) -> Result<bool, TransportError> {
        Ok(true)
    }

    async fn connect(&self, _: &str) -> Result<ConnectionHandle, TransportError> {
        Err(TransportError::platform("reader jammed"))
    }

    async fn exchange(&self, _: ConnectionHandle, _: &[u8]) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::platform("reader jammed"))
    }

    fn disconnect(&self, _: ConnectionHandle) {}
}

#[tokio::test]
async fn test_session_connect_failure_clears_presence() {
    let platform = Platform::new(Arc::new(Jammed));
    platform.init().await.unwrap();

    let device = platform.acquire_device(FIXTURE).await.unwrap();
    device
        .wait_for_card_presence(Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(DeviceState::CardPresent, device.state());

    let e = device.start_session().await.unwrap_err();
    assert_eq!(ErrorKind::Platform, e.kind());
    assert_eq!(DeviceState::AwaitingCard, device.state());
}

#[tokio::test]
async fn test_session_on_non_apdu_target() {
    let backend = Arc::new(
        NfcBackend::new(|_: &str, _: &[u8]| -> Result<Vec<u8>, TransportError> {
            Ok(vec![0x90, 0x00])
        })
        .with_target(common::descriptor().with_apdu(false)),
    );
    backend.tag_discovered(FIXTURE);

    let platform = platform(&backend).await;
    let device = platform.acquire_device(FIXTURE).await.unwrap();

    let e = device.start_session().await.unwrap_err();
    assert_eq!(ErrorKind::Unsupported, e.kind());
}

#[tokio::test]
async fn test_card_loss() {
    let backend = backend();
    backend.tag_discovered(FIXTURE);

    let platform = platform(&backend).await;
    let mut events = platform.subscribe();
    let device = platform.acquire_device(FIXTURE).await.unwrap();
    let card = device.start_session().await.unwrap();

    backend.tag_lost(FIXTURE);

    let e = card.transmit(&select()).await.unwrap_err();
    assert_eq!(ErrorKind::CardNotPresent, e.kind());
    assert_eq!(CardState::Lost, card.state());
    assert_eq!(DeviceState::AwaitingCard, device.state());
    assert_eq!(0, backend.open_connections());

    // Lost is terminal: releasing afterwards emits nothing more.
    card.release();
    assert_eq!(CardState::Lost, card.state());
    assert_eq!(
        LifecycleEvent::CardLost {
            device: FIXTURE.into()
        },
        events.recv().await.unwrap()
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_card_loss_polled() {
    let backend = polling_backend();
    backend.tag_discovered(FIXTURE);

    let platform = platform(&backend).await;
    let device = platform.acquire_device(FIXTURE).await.unwrap();
    let card = device.start_session().await.unwrap();

    backend.tag_lost(FIXTURE);

    let e = card.transmit(&select()).await.unwrap_err();
    assert_eq!(ErrorKind::CardNotPresent, e.kind());
    assert_eq!(DeviceState::AwaitingCard, device.state());

    let feeder = Arc::clone(&backend);
    tokio::spawn(async move {
        sleep(Duration::from_millis(300)).await;
        feeder.tag_discovered(FIXTURE);
    });

    device
        .wait_for_card_presence(Duration::from_secs(1))
        .await
        .unwrap();
    let card = device.start_session().await.unwrap();
    assert!(card.transmit(&select()).await.unwrap().sw().is_success());
}

#[tokio::test(start_paused = true)]
async fn test_busy() {
    let backend = slow_backend(Duration::from_millis(500));
    backend.tag_discovered(FIXTURE);

    let platform = platform(&backend).await;
    let device = platform.acquire_device(FIXTURE).await.unwrap();
    let card = device.start_session().await.unwrap();

    let command = select();
    let (first, second) = tokio::join!(card.transmit(&command), card.transmit(&command));

    assert!(first.unwrap().sw().is_success());
    assert_eq!(ErrorKind::Conflict, second.unwrap_err().kind());

    // The card is free again once the first exchange completed.
    assert!(card.transmit(&select()).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_exchange_timeout() {
    let backend = slow_backend(Duration::from_secs(10));
    backend.tag_discovered(FIXTURE);

    let config = Config::default().with_exchange_timeout(Duration::from_millis(100));
    let platform = platform_with(&backend, config).await;
    let device = platform.acquire_device(FIXTURE).await.unwrap();
    let card = device.start_session().await.unwrap();

    let e = card.transmit(&select()).await.unwrap_err();
    assert_eq!(ErrorKind::Timeout, e.kind());
    assert_eq!(CardState::Active, card.state());
}

#[tokio::test]
async fn test_extended_length_unsupported() {
    let backend = backend();
    backend.tag_discovered(FIXTURE);

    let platform = platform(&backend).await;
    let device = platform.acquire_device(FIXTURE).await.unwrap();
    let card = device.start_session().await.unwrap();

    let command = Command::new_with_payload(0x00, 0xD6, 0x00, 0x00, vec![0x5A; 300]).unwrap();
    let e = card.transmit(&command).await.unwrap_err();

    assert_eq!(ErrorKind::Unsupported, e.kind());
    assert!(!card.supports_extended_length());
}

#[tokio::test]
async fn test_extended_length_supported() {
    let backend = Arc::new(
        NfcBackend::new(common::Echo {
            delay: Duration::ZERO,
        })
        .with_target(common::descriptor().with_extended_length(true)),
    );
    backend.tag_discovered(FIXTURE);

    let platform = platform(&backend).await;
    let device = platform.acquire_device(FIXTURE).await.unwrap();
    let card = device.start_session().await.unwrap();

    let command = Command::new_with_payload(0x00, 0xD6, 0x00, 0x00, vec![0x5A; 300]).unwrap();
    assert!(card.transmit(&command).await.unwrap().sw().is_success());
}

#[tokio::test]
async fn test_extended_length_disabled() {
    let backend = Arc::new(
        NfcBackend::new(common::Echo {
            delay: Duration::ZERO,
        })
        .with_target(common::descriptor().with_extended_length(true)),
    );
    backend.tag_discovered(FIXTURE);

    let platform = platform_with(&backend, Config::default().with_allow_extended(false)).await;
    let device = platform.acquire_device(FIXTURE).await.unwrap();
    let card = device.start_session().await.unwrap();

    let command = Command::new_with_payload(0x00, 0xD6, 0x00, 0x00, vec![0x5A; 300]).unwrap();
    let e = card.transmit(&command).await.unwrap_err();
    assert_eq!(ErrorKind::Unsupported, e.kind());
}

#[tokio::test(start_paused = true)]
async fn test_release_cancels_wait() {
    let backend = backend();
    let platform = platform(&backend).await;
    let device = platform.acquire_device(FIXTURE).await.unwrap();

    let (waited, _) = tokio::join!(device.wait_for_card_presence(Duration::from_secs(60)), async {
        sleep(Duration::from_millis(10)).await;
        device.release();
    });

    assert_eq!(ErrorKind::Cancelled, waited.unwrap_err().kind());
    assert_eq!(DeviceState::Released, device.state());
}

#[tokio::test(start_paused = true)]
async fn test_release_cancels_transmit() {
    let backend = slow_backend(Duration::from_secs(10));
    backend.tag_discovered(FIXTURE);

    let platform = platform(&backend).await;
    let device = platform.acquire_device(FIXTURE).await.unwrap();
    let card = device.start_session().await.unwrap();

    let command = select();
    let started = Instant::now();
    let (transmitted, _) = tokio::join!(card.transmit(&command), async {
        sleep(Duration::from_millis(10)).await;
        platform.release();
    });

    assert_eq!(ErrorKind::Cancelled, transmitted.unwrap_err().kind());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(CardState::Released, card.state());
}

#[tokio::test]
async fn test_release_cascade() {
    let backend = backend();
    backend.tag_discovered(FIXTURE);

    let platform = platform(&backend).await;
    let mut events = platform.subscribe();
    let device = platform.acquire_device(FIXTURE).await.unwrap();
    let card = device.start_session().await.unwrap();

    platform.release();
    platform.release();

    assert_eq!(PlatformState::Released, platform.state());
    assert_eq!(DeviceState::Released, device.state());
    assert_eq!(CardState::Released, card.state());
    assert!(!backend.is_established());
    assert_eq!(0, backend.open_connections());

    device.release();
    card.release();

    let mut received = vec![];
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }

    assert_eq!(
        vec![
            LifecycleEvent::CardReleased {
                device: FIXTURE.into()
            },
            LifecycleEvent::DeviceReleased {
                device: FIXTURE.into()
            },
            LifecycleEvent::PlatformReleased,
        ],
        received,
    );

    let e = device
        .wait_for_card_presence(Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::InvalidState, e.kind());

    let e = platform.acquire_device(FIXTURE).await.unwrap_err();
    assert_eq!(ErrorKind::InvalidState, e.kind());
}

#[tokio::test]
async fn test_drop_releases() {
    let backend = backend();
    backend.tag_discovered(FIXTURE);

    {
        let platform = platform(&backend).await;
        let device = platform.acquire_device(FIXTURE).await.unwrap();
        let _card = device.start_session().await.unwrap();

        assert_eq!(1, backend.open_connections());
    }

    assert!(!backend.is_established());
    assert_eq!(0, backend.open_connections());
}
