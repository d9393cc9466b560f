#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cardlink::nfc::{Handler, NfcBackend};
use cardlink::transport::{TargetDescriptor, TransportError};
use cardlink::{Config, Platform};

pub const FIXTURE: &str = "fixture";

/// Answers every command with `90 00` after an optional delay.
pub struct Echo {
    pub delay: Duration,
}

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, _: &str, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut response = command[..4].to_vec();
        response.extend_from_slice(&[0x90, 0x00]);

        Ok(response)
    }
}

pub fn descriptor() -> TargetDescriptor {
    TargetDescriptor::new(FIXTURE, "Test fixture").with_protocols(["ISO-DEP"])
}

pub fn backend() -> Arc<NfcBackend> {
    slow_backend(Duration::ZERO)
}

pub fn slow_backend(delay: Duration) -> Arc<NfcBackend> {
    Arc::new(NfcBackend::new(Echo { delay }).with_target(descriptor()))
}

pub fn polling_backend() -> Arc<NfcBackend> {
    Arc::new(NfcBackend::polling(Echo { delay: Duration::ZERO }).with_target(descriptor()))
}

pub async fn platform(backend: &Arc<NfcBackend>) -> Platform {
    platform_with(backend, Config::default()).await
}

pub async fn platform_with(backend: &Arc<NfcBackend>, config: Config) -> Platform {
    let platform = Platform::with_config(backend.clone(), config);
    platform.init().await.unwrap();

    platform
}
