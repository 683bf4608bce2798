//! Physical interface abstraction for byte-at-a-time serial links.
//!
//! The layers above never touch hardware registers. They talk to a
//! [`SerialPort`] that can:
//! - arm a single one-byte receive
//! - start a transmit of N bytes
//!
//! and they receive completions through [`PortEvents`], which the adapter
//! invokes from its interrupt (or interrupt-like) context.
//!
//! This is the lowest layer of modemlink. Two adapters ship with it:
//! [`SimulatedUart`] for deterministic tests and tools, and `HostSerial`
//! (behind the `serial` feature) for real ports on a host machine.

pub mod error;
pub mod sim;
pub mod traits;

#[cfg(feature = "serial")]
pub mod serial;

pub use error::{PortError, Result};
pub use sim::SimulatedUart;
pub use traits::{InterfaceKind, PortEvents, PortFault, SerialPort};

#[cfg(feature = "serial")]
pub use serial::{HostSerial, HostSerialConfig};
