use std::fmt;
use std::sync::Weak;

use crate::error::Result;

/// Kind of physical bus behind a [`SerialPort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    Uart,
    Spi,
    I2c,
}

impl InterfaceKind {
    /// Short lowercase name, used in logs and CLI output.
    pub fn name(self) -> &'static str {
        match self {
            InterfaceKind::Uart => "uart",
            InterfaceKind::Spi => "spi",
            InterfaceKind::I2c => "i2c",
        }
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hardware fault reported through [`PortEvents::transport_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortFault {
    /// Receive data register overrun.
    Overrun,
    /// Stop bit not detected.
    Framing,
    /// Parity mismatch.
    Parity,
    /// Line noise detected.
    Noise,
    /// Host-side I/O failure (host adapters only).
    Io,
}

impl PortFault {
    pub fn code(self) -> u8 {
        match self {
            PortFault::Overrun => 1,
            PortFault::Framing => 2,
            PortFault::Parity => 3,
            PortFault::Noise => 4,
            PortFault::Io => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PortFault::Overrun),
            2 => Some(PortFault::Framing),
            3 => Some(PortFault::Parity),
            4 => Some(PortFault::Noise),
            5 => Some(PortFault::Io),
            _ => None,
        }
    }
}

impl fmt::Display for PortFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortFault::Overrun => "overrun",
            PortFault::Framing => "framing",
            PortFault::Parity => "parity",
            PortFault::Noise => "noise",
            PortFault::Io => "io",
        };
        f.write_str(name)
    }
}

/// Completion notifications delivered by an adapter.
///
/// Every method runs in the adapter's interrupt context: implementations must
/// not block, allocate unboundedly or sleep.
pub trait PortEvents: Send + Sync {
    /// One byte arrived for the receive armed by [`SerialPort::arm_receive`].
    fn byte_received(&self, byte: u8);

    /// The transmit started by [`SerialPort::begin_transmit`] finished.
    fn transmit_complete(&self);

    /// The interface reported a fault. Any armed receive is aborted.
    fn transport_error(&self, fault: PortFault);
}

/// A physical interface that receives one byte per armed receive.
///
/// Only one receive and one transmit can be outstanding at a time; both
/// calls return [`crate::PortError::Busy`] otherwise. Neither call blocks.
pub trait SerialPort: Send + Sync {
    /// Human-readable identity (device path, instance name).
    fn name(&self) -> &str;

    /// Bus kind. Defaults to UART.
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Uart
    }

    /// Register the sink that receives completions.
    fn attach(&self, events: Weak<dyn PortEvents>);

    /// Drop the registered sink. Later completions are discarded.
    fn detach(&self);

    /// Arm a single one-byte receive.
    fn arm_receive(&self) -> Result<()>;

    /// Start transmitting `bytes`. Returns as soon as the transfer is accepted.
    fn begin_transmit(&self, bytes: &[u8]) -> Result<()>;

    /// Abort an in-flight transmit, if any.
    fn abort_transmit(&self);
}

impl fmt::Debug for dyn SerialPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialPort")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}
