use std::time::Duration;

use modemlink_queue::QueueConfig;
use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Default number of device slots in a [`DeviceTable`](crate::DeviceTable).
pub const DEFAULT_MAX_DEVICES: usize = 3;

/// Default bound on the busy-retry loop of `send`.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;

/// Default sleep between busy retries.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 10;

/// Link-wide settings shared by every device of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub max_devices: usize,
    pub send_timeout_ms: u64,
    pub retry_interval_ms: u64,
    /// Queue sizing for channels opened without their own.
    pub default_queue: QueueConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_devices: DEFAULT_MAX_DEVICES,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            default_queue: QueueConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_devices == 0 || self.max_devices > usize::from(u8::MAX) + 1 {
            return Err(LinkError::InvalidArgument(format!(
                "max_devices must be in 1..=256, got {}",
                self.max_devices
            )));
        }
        if self.retry_interval_ms == 0 {
            return Err(LinkError::InvalidArgument(
                "retry_interval_ms must be non-zero".to_string(),
            ));
        }
        self.default_queue.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.max_devices, 3);
        assert_eq!(config.send_timeout(), Duration::from_secs(5));
        assert_eq!(config.retry_interval(), Duration::from_millis(10));
        assert_eq!(config.default_queue.capacity, 2000);
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: LinkConfig = serde_json::from_str(
            r#"{"send_timeout_ms": 250, "default_queue": {"capacity": 128}}"#,
        )
        .unwrap();
        assert_eq!(config.send_timeout_ms, 250);
        assert_eq!(config.max_devices, DEFAULT_MAX_DEVICES);
        assert_eq!(config.default_queue.capacity, 128);
        assert_eq!(config.default_queue.pause_threshold, 20);
    }

    #[test]
    fn rejects_zero_devices_and_bad_queue() {
        let config = LinkConfig {
            max_devices: 0,
            ..LinkConfig::default()
        };
        assert!(matches!(config.validate(), Err(LinkError::InvalidArgument(_))));

        let config = LinkConfig {
            default_queue: QueueConfig::new(8, 20),
            ..LinkConfig::default()
        };
        assert!(matches!(config.validate(), Err(LinkError::ResourceExhausted(_))));
    }
}
