use crate::header::HEADER_SIZE;

/// Errors raised by queue construction and message reads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The configured capacity cannot hold a header plus the pause headroom.
    #[error("queue capacity {capacity} too small (need more than {required} bytes)")]
    Undersized { capacity: usize, required: usize },

    /// The configured capacity cannot be described by a 15-bit header size.
    #[error("queue capacity {capacity} exceeds maximum {max}")]
    TooLarge { capacity: usize, max: usize },

    /// The pause threshold would let the overflow guard trip before flow
    /// control engages.
    #[error("pause threshold {threshold} below header size {HEADER_SIZE}")]
    ThresholdTooLow { threshold: usize },

    /// The header at the read cursor is not marked complete.
    ///
    /// Framing is generated locally, so this always indicates a bug.
    #[error("incomplete message header at index {index}")]
    Framing { index: usize },
}

pub type Result<T> = std::result::Result<T, QueueError>;
