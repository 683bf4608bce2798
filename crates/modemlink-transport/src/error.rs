/// Errors reported synchronously by a physical interface.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// The interface is already busy with a receive or transmit.
    #[error("interface busy")]
    Busy,

    /// The interface reported a hardware fault.
    #[error("interface fault: {0}")]
    Fault(String),

    /// Failed to open the underlying device.
    #[error("failed to open {path}: {reason}")]
    Open { path: String, reason: String },

    /// An I/O error occurred on the underlying device.
    #[error("interface I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No event sink is attached, or the adapter has been shut down.
    #[error("interface detached")]
    Detached,
}

impl PortError {
    /// Returns true for the transient busy condition callers may retry.
    pub fn is_busy(&self) -> bool {
        matches!(self, PortError::Busy)
    }
}

pub type Result<T> = std::result::Result<T, PortError>;
