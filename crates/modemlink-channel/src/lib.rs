//! Channels and devices on top of a byte-at-a-time serial interface.
//!
//! This is the "just works" layer. Initialize a [`Device`] on a
//! [`SerialPort`](modemlink_transport::SerialPort), open up to two channels
//! on it, and receive whole messages while the interface delivers one byte
//! per interrupt. Reception pauses when a channel's queue runs low and
//! resumes when the consumer catches up.

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod signal;

pub use channel::{
    ChannelHandle, ChannelHooks, ChannelId, ChannelMode, ChannelOptions, ChannelState,
    ChannelStats, Receipt,
};
pub use config::{
    LinkConfig, DEFAULT_MAX_DEVICES, DEFAULT_RETRY_INTERVAL_MS, DEFAULT_SEND_TIMEOUT_MS,
};
pub use device::{Device, DeviceId, DeviceStats, DeviceTable};
pub use error::{LinkError, Result};
pub use signal::Signal;
