//! Deterministic in-process UART used by tests and the `replay` command.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::trace;

use crate::error::{PortError, Result};
use crate::traits::{PortEvents, PortFault, SerialPort};

/// A simulated UART with hardware flow control.
///
/// Incoming bytes wait in a FIFO until a receive is armed; [`pump`] then
/// delivers exactly one byte per armed receive, the way a one-byte interrupt
/// receive behaves on real hardware. Nothing is delivered on a background
/// thread: the test decides when "interrupts" fire.
///
/// Transmits are recorded and stay in flight until [`complete_transmit`] is
/// called.
///
/// [`pump`]: SimulatedUart::pump
/// [`complete_transmit`]: SimulatedUart::complete_transmit
pub struct SimulatedUart {
    name: String,
    events: Mutex<Option<Weak<dyn PortEvents>>>,
    pending: Mutex<VecDeque<u8>>,
    transmitted: Mutex<Vec<Vec<u8>>>,
    armed: AtomicBool,
    arm_calls: AtomicUsize,
    refuse_arms: AtomicUsize,
    refuse_transmits: AtomicUsize,
    stuck_busy: AtomicBool,
    tx_in_flight: AtomicBool,
}

impl SimulatedUart {
    /// Create a detached simulator.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            events: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            transmitted: Mutex::new(Vec::new()),
            armed: AtomicBool::new(false),
            arm_calls: AtomicUsize::new(0),
            refuse_arms: AtomicUsize::new(0),
            refuse_transmits: AtomicUsize::new(0),
            stuck_busy: AtomicBool::new(false),
            tx_in_flight: AtomicBool::new(false),
        })
    }

    /// Queue bytes on the wire and deliver as many as armed receives allow.
    ///
    /// Returns the number of bytes delivered by this call.
    pub fn inject(&self, bytes: &[u8]) -> usize {
        lock(&self.pending).extend(bytes.iter().copied());
        self.pump()
    }

    /// Deliver pending bytes while a receive is armed.
    pub fn pump(&self) -> usize {
        let Some(events) = self.sink() else {
            return 0;
        };

        let mut delivered = 0usize;
        while self.armed.swap(false, Ordering::AcqRel) {
            let next = lock(&self.pending).pop_front();
            match next {
                Some(byte) => {
                    events.byte_received(byte);
                    delivered += 1;
                }
                None => {
                    self.armed.store(true, Ordering::Release);
                    break;
                }
            }
        }
        if delivered > 0 {
            trace!(port = %self.name, delivered, "simulated bytes delivered");
        }
        delivered
    }

    /// Number of bytes still waiting on the wire.
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether a one-byte receive is currently armed.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Number of successful `arm_receive` calls so far.
    pub fn arm_count(&self) -> usize {
        self.arm_calls.load(Ordering::Acquire)
    }

    /// Make the next `count` calls to `arm_receive` fail with `Busy`.
    pub fn refuse_next_arms(&self, count: usize) {
        self.refuse_arms.store(count, Ordering::Release);
    }

    /// Make the next `count` calls to `begin_transmit` fail with `Busy`.
    pub fn refuse_next_transmits(&self, count: usize) {
        self.refuse_transmits.store(count, Ordering::Release);
    }

    /// Keep reporting `Busy` for every transmit until cleared.
    pub fn set_stuck_busy(&self, stuck: bool) {
        self.stuck_busy.store(stuck, Ordering::Release);
    }

    /// Whether a transmit is in flight.
    pub fn is_transmitting(&self) -> bool {
        self.tx_in_flight.load(Ordering::Acquire)
    }

    /// Finish the in-flight transmit and fire the completion.
    ///
    /// Returns false when nothing was in flight.
    pub fn complete_transmit(&self) -> bool {
        if !self.tx_in_flight.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(events) = self.sink() {
            events.transmit_complete();
        }
        true
    }

    /// Report a hardware fault. The armed receive, if any, is aborted.
    pub fn raise_fault(&self, fault: PortFault) {
        self.armed.store(false, Ordering::Release);
        if let Some(events) = self.sink() {
            events.transport_error(fault);
        }
    }

    /// Every accepted transmit, oldest first.
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        lock(&self.transmitted).clone()
    }

    fn sink(&self) -> Option<Arc<dyn PortEvents>> {
        lock(&self.events).as_ref().and_then(Weak::upgrade)
    }
}

impl SerialPort for SimulatedUart {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&self, events: Weak<dyn PortEvents>) {
        *lock(&self.events) = Some(events);
    }

    fn detach(&self) {
        *lock(&self.events) = None;
        self.armed.store(false, Ordering::Release);
    }

    fn arm_receive(&self) -> Result<()> {
        if take_one(&self.refuse_arms) {
            return Err(PortError::Busy);
        }
        if self.armed.swap(true, Ordering::AcqRel) {
            return Err(PortError::Busy);
        }
        self.arm_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn begin_transmit(&self, bytes: &[u8]) -> Result<()> {
        if self.stuck_busy.load(Ordering::Acquire) || take_one(&self.refuse_transmits) {
            return Err(PortError::Busy);
        }
        if self.tx_in_flight.swap(true, Ordering::AcqRel) {
            return Err(PortError::Busy);
        }
        lock(&self.transmitted).push(bytes.to_vec());
        Ok(())
    }

    fn abort_transmit(&self) {
        self.tx_in_flight.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for SimulatedUart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedUart")
            .field("name", &self.name)
            .field("armed", &self.is_armed())
            .field("pending", &self.pending_len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}
