use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::header::{HEADER_SIZE, MAX_MESSAGE_SIZE};

/// Default ring capacity: a 1600-byte payload plus 400 bytes of headroom.
pub const DEFAULT_CAPACITY: usize = 1600 + 400;

/// Default free-space level at or below which reception pauses.
pub const DEFAULT_PAUSE_THRESHOLD: usize = 20;

/// Largest capacity whose messages always fit a 15-bit header size.
pub const MAX_QUEUE_CAPACITY: usize = MAX_MESSAGE_SIZE;

/// Sizing of one channel's receive queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Ring capacity in bytes, headers included.
    pub capacity: usize,
    /// Reception pauses once free space drops to this many bytes.
    pub pause_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            pause_threshold: DEFAULT_PAUSE_THRESHOLD,
        }
    }
}

impl QueueConfig {
    pub fn new(capacity: usize, pause_threshold: usize) -> Self {
        Self {
            capacity,
            pause_threshold,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_pause_threshold(mut self, pause_threshold: usize) -> Self {
        self.pause_threshold = pause_threshold;
        self
    }

    /// Check the sizing rules.
    ///
    /// The capacity must exceed one header, the pause headroom and one
    /// payload byte, and the threshold must cover a header so reception
    /// pauses before the overflow guard starts dropping bytes.
    pub fn validate(&self) -> Result<()> {
        if self.pause_threshold < HEADER_SIZE {
            return Err(QueueError::ThresholdTooLow {
                threshold: self.pause_threshold,
            });
        }
        let required = HEADER_SIZE + self.pause_threshold + 1;
        if self.capacity <= required {
            return Err(QueueError::Undersized {
                capacity: self.capacity,
                required,
            });
        }
        if self.capacity > MAX_QUEUE_CAPACITY {
            return Err(QueueError::TooLarge {
                capacity: self.capacity,
                max: MAX_QUEUE_CAPACITY,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = QueueConfig::default();
        assert_eq!(config.capacity, 2000);
        assert_eq!(config.pause_threshold, 20);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_undersized_capacity() {
        let err = QueueConfig::new(23, 20).validate().unwrap_err();
        assert_eq!(
            err,
            QueueError::Undersized {
                capacity: 23,
                required: 23
            }
        );
        QueueConfig::new(24, 20).validate().unwrap();
    }

    #[test]
    fn rejects_oversized_capacity() {
        let err = QueueConfig::new(MAX_QUEUE_CAPACITY + 1, 20)
            .validate()
            .unwrap_err();
        assert!(matches!(err, QueueError::TooLarge { .. }));
        QueueConfig::new(MAX_QUEUE_CAPACITY, 20).validate().unwrap();
    }

    #[test]
    fn rejects_threshold_below_header() {
        let err = QueueConfig::new(64, 1).validate().unwrap_err();
        assert_eq!(err, QueueError::ThresholdTooLow { threshold: 1 });
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: QueueConfig = serde_json::from_str(r#"{"capacity": 64}"#).unwrap();
        assert_eq!(config, QueueConfig::new(64, DEFAULT_PAUSE_THRESHOLD));
    }
}
