use std::time::Duration;

use modemlink_queue::QueueError;
use modemlink_transport::{PortError, PortFault};

/// Errors that can occur in channel and device operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// A caller-supplied argument or handle was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The channel has been closed (or was never opened).
    #[error("channel not initialized")]
    NotInitialized,

    /// No room for another channel, or the queue cannot be sized as asked.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The header at the read cursor was not complete.
    #[error("framing error at queue index {index}")]
    Framing { index: usize },

    /// The physical interface rejected a request.
    #[error("transport error: {0}")]
    Transport(#[from] PortError),

    /// The physical interface reported a fault since the last receive.
    #[error("transport fault: {0}")]
    TransportFault(PortFault),

    /// The physical interface stayed busy for the whole send window.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

impl From<QueueError> for LinkError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Undersized { .. } => LinkError::ResourceExhausted(err.to_string()),
            QueueError::TooLarge { .. } | QueueError::ThresholdTooLow { .. } => {
                LinkError::InvalidArgument(err.to_string())
            }
            QueueError::Framing { index } => LinkError::Framing { index },
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
