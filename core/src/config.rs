//! Runtime configuration of a [`crate::Platform`].

use std::time::Duration;

/// Tunables shared by every device and card under one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Period between presence checks on backends that cannot push card events.
    pub poll_interval: Duration,

    /// Deadline for a single exchange with the card. `None` waits as long as the backend does.
    pub exchange_timeout: Option<Duration>,

    /// Whether extended-length APDUs may be sent at all.
    /// Targets that do not advertise extended length support reject them regardless.
    pub allow_extended: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            exchange_timeout: None,
            allow_extended: true,
        }
    }
}

impl Config {
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub fn with_exchange_timeout(self, exchange_timeout: Duration) -> Self {
        Self {
            exchange_timeout: Some(exchange_timeout),
            ..self
        }
    }

    pub fn with_allow_extended(self, allow_extended: bool) -> Self {
        Self {
            allow_extended,
            ..self
        }
    }
}
