//! Host serial port adapter backed by the `serialport` crate.
//!
//! A receive thread stands in for the RX interrupt: it reads one byte at a
//! time and hands it to the attached sink only while a receive is armed.
//! While disarmed the thread stops reading, so bytes stay in the OS buffer
//! (and the device is throttled by hardware flow control when enabled).
//! A transmit thread writes each accepted buffer and then reports completion.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use serialport::SerialPort as _;
use tracing::{debug, info, warn};

use crate::error::{PortError, Result};
use crate::traits::{PortEvents, PortFault, SerialPort};

const IDLE_POLL: Duration = Duration::from_millis(1);

/// Settings for [`HostSerial::open`].
#[derive(Debug, Clone)]
pub struct HostSerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub path: String,
    /// Line speed.
    pub baud_rate: u32,
    /// Read timeout of the receive thread; bounds shutdown latency.
    pub read_timeout: Duration,
    /// Enable RTS/CTS hardware flow control.
    pub hardware_flow_control: bool,
}

impl HostSerialConfig {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            read_timeout: Duration::from_millis(20),
            hardware_flow_control: false,
        }
    }
}

struct Shared {
    events: Mutex<Option<Weak<dyn PortEvents>>>,
    armed: AtomicBool,
    tx_busy: AtomicBool,
    running: AtomicBool,
}

impl Shared {
    fn sink(&self) -> Option<Arc<dyn PortEvents>> {
        lock(&self.events).as_ref().and_then(Weak::upgrade)
    }
}

/// A real serial port driven by a receive thread and a transmit thread.
pub struct HostSerial {
    name: String,
    shared: Arc<Shared>,
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl HostSerial {
    /// Open the port and start its worker threads.
    pub fn open(config: &HostSerialConfig) -> Result<Arc<Self>> {
        let flow = if config.hardware_flow_control {
            serialport::FlowControl::Hardware
        } else {
            serialport::FlowControl::None
        };
        let port = serialport::new(&config.path, config.baud_rate)
            .timeout(config.read_timeout)
            .flow_control(flow)
            .open()
            .map_err(|err| PortError::Open {
                path: config.path.clone(),
                reason: err.to_string(),
            })?;
        let writer = port.try_clone().map_err(|err| PortError::Open {
            path: config.path.clone(),
            reason: err.to_string(),
        })?;

        let shared = Arc::new(Shared {
            events: Mutex::new(None),
            armed: AtomicBool::new(false),
            tx_busy: AtomicBool::new(false),
            running: AtomicBool::new(true),
        });
        let (tx, rx) = mpsc::channel::<Vec<u8>>();

        let rx_thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("{}-rx", config.path))
                .spawn(move || receive_loop(port, shared))?
        };
        let tx_thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("{}-tx", config.path))
                .spawn(move || transmit_loop(writer, rx, shared))?
        };

        info!(path = %config.path, baud = config.baud_rate, "serial port opened");

        Ok(Arc::new(Self {
            name: config.path.clone(),
            shared,
            tx: Mutex::new(Some(tx)),
            threads: Mutex::new(vec![rx_thread, tx_thread]),
        }))
    }

    fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        lock(&self.tx).take();
        for handle in lock(&self.threads).drain(..) {
            let _ = handle.join();
        }
    }
}

impl SerialPort for HostSerial {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&self, events: Weak<dyn PortEvents>) {
        *lock(&self.shared.events) = Some(events);
    }

    fn detach(&self) {
        *lock(&self.shared.events) = None;
        self.shared.armed.store(false, Ordering::Release);
    }

    fn arm_receive(&self) -> Result<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(PortError::Detached);
        }
        if self.shared.armed.swap(true, Ordering::AcqRel) {
            return Err(PortError::Busy);
        }
        Ok(())
    }

    fn begin_transmit(&self, bytes: &[u8]) -> Result<()> {
        if self.shared.tx_busy.swap(true, Ordering::AcqRel) {
            return Err(PortError::Busy);
        }
        let guard = lock(&self.tx);
        let Some(tx) = guard.as_ref() else {
            self.shared.tx_busy.store(false, Ordering::Release);
            return Err(PortError::Detached);
        };
        if tx.send(bytes.to_vec()).is_err() {
            self.shared.tx_busy.store(false, Ordering::Release);
            return Err(PortError::Detached);
        }
        Ok(())
    }

    fn abort_transmit(&self) {
        // A write already handed to the OS cannot be recalled; only the
        // busy flag is released so the next transmit is accepted.
        self.shared.tx_busy.store(false, Ordering::Release);
    }
}

impl Drop for HostSerial {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for HostSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSerial").field("name", &self.name).finish()
    }
}

fn receive_loop(mut port: Box<dyn serialport::SerialPort>, shared: Arc<Shared>) {
    let mut byte = [0u8; 1];
    while shared.running.load(Ordering::Acquire) {
        if !shared.armed.load(Ordering::Acquire) {
            std::thread::sleep(IDLE_POLL);
            continue;
        }
        match port.read(&mut byte) {
            Ok(1) => {
                shared.armed.store(false, Ordering::Release);
                if let Some(events) = shared.sink() {
                    events.byte_received(byte[0]);
                }
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::TimedOut => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(error = %err, "serial receive failed");
                shared.armed.store(false, Ordering::Release);
                if let Some(events) = shared.sink() {
                    events.transport_error(PortFault::Io);
                }
                std::thread::sleep(IDLE_POLL);
            }
        }
    }
    debug!("serial receive thread stopped");
}

fn transmit_loop(
    mut port: Box<dyn serialport::SerialPort>,
    rx: Receiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    while let Ok(buf) = rx.recv() {
        let result = port.write_all(&buf).and_then(|_| port.flush());
        shared.tx_busy.store(false, Ordering::Release);
        let Some(events) = shared.sink() else {
            continue;
        };
        match result {
            Ok(()) => events.transmit_complete(),
            Err(err) => {
                warn!(error = %err, "serial transmit failed");
                events.transport_error(PortFault::Io);
            }
        }
    }
    debug!("serial transmit thread stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
