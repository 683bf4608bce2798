//! Message framing, flow control and channel hand-off for byte-at-a-time
//! modem links.
//!
//! A UART (or SPI/I2C bridge) delivers one byte per interrupt. modemlink
//! turns that stream into whole messages: bytes are framed into a lock-free
//! ring queue, a classifier decides where messages end, reception pauses
//! before the queue can overflow, and two logical channels can share one
//! physical link, for example a command channel and a data channel.
//!
//! # Crate Structure
//!
//! - [`transport`]: Physical interface abstraction and adapters (simulator, host serial)
//! - [`queue`]: Framed RX ring queue, stream buffer, classifiers and flow control
//! - [`channel`]: Devices, channels, TX path and blocking/async receive

/// Re-export transport types.
pub mod transport {
    pub use modemlink_transport::*;
}

/// Re-export queue types.
pub mod queue {
    pub use modemlink_queue::*;
}

/// Re-export channel and device types.
pub mod channel {
    pub use modemlink_channel::*;
}
