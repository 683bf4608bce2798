//! Logical channels on a device.
//!
//! A channel owns one receive store (framed queue or stream ring), its
//! notifications and its transmit accounting. The device decides which
//! channel the producer context writes into; everything here is either
//! producer-side (`deliver`, `claim_transmit`, `record_fault`) or
//! consumer-side (the [`ChannelHandle`] operations).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use modemlink_queue::{
    Classifier, QueueConfig, QueueSnapshot, QueueStats, RxQueue, RxStreamBuffer, StreamStats,
};
use modemlink_transport::PortFault;
use serde::Serialize;
use tracing::{debug, warn};

use crate::device::{Device, DeviceId};
use crate::error::{LinkError, Result};
use crate::signal::Signal;

/// How received bytes are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    /// Classifier-delimited messages in an [`RxQueue`].
    Framed,
    /// Raw bytes in an [`RxStreamBuffer`].
    Stream,
}

impl ChannelMode {
    pub fn name(self) -> &'static str {
        match self {
            ChannelMode::Framed => "framed",
            ChannelMode::Stream => "stream",
        }
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// Closed, or never opened.
    Uninitialized,
    /// Open, but reception has not been armed on its behalf yet.
    Initialized,
    /// Receiving.
    Active,
    /// Free space fell to the pause threshold; no new receive is armed.
    Paused,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Uninitialized => "uninitialized",
            ChannelState::Initialized => "initialized",
            ChannelState::Active => "active",
            ChannelState::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Identity of a channel: its device plus a per-device sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelId {
    pub device: DeviceId,
    pub number: u32,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/ch{}", self.device, self.number)
    }
}

/// Optional callbacks for the layer above.
///
/// All three run in the producer context: they must not block and must not
/// call back into the channel.
pub trait ChannelHooks: Send + Sync {
    /// A framed message completed, or a stream byte arrived.
    fn on_message(&self, _channel: ChannelId) {}

    /// A transmit started by this channel finished.
    fn on_transmit_complete(&self, _channel: ChannelId) {}

    /// The interface reported a fault while this channel was receiving.
    fn on_transport_error(&self, _channel: ChannelId, _fault: PortFault) {}
}

/// Parameters of [`Device::open`].
#[derive(Clone)]
pub struct ChannelOptions {
    mode: ChannelMode,
    classifier: Option<Arc<dyn Classifier>>,
    hooks: Option<Arc<dyn ChannelHooks>>,
    queue: Option<QueueConfig>,
}

impl ChannelOptions {
    /// Options for `mode` with no classifier attached.
    pub fn new(mode: ChannelMode) -> Self {
        Self {
            mode,
            classifier: None,
            hooks: None,
            queue: None,
        }
    }

    /// Framed mode split by `classifier`.
    pub fn framed(classifier: impl Classifier + 'static) -> Self {
        Self::new(ChannelMode::Framed).with_classifier(classifier)
    }

    pub fn stream() -> Self {
        Self::new(ChannelMode::Stream)
    }

    pub fn with_classifier(mut self, classifier: impl Classifier + 'static) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    pub fn with_shared_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ChannelHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Override the device's default queue sizing.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("mode", &self.mode)
            .field("classifier", &self.classifier.is_some())
            .field("hooks", &self.hooks.is_some())
            .field("queue", &self.queue)
            .finish()
    }
}

/// Outcome of a framed receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// One message was copied out.
    Message { size: usize, remaining: usize },
    /// No complete message yet.
    Empty,
    /// The wait expired with no message. Nothing was discarded.
    TimedOut,
    /// The channel was closed.
    Closed,
}

impl Receipt {
    pub fn size(&self) -> Option<usize> {
        match self {
            Receipt::Message { size, .. } => Some(*size),
            _ => None,
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, Receipt::Message { .. })
    }
}

/// Counters and state of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub id: ChannelId,
    pub mode: ChannelMode,
    pub state: ChannelState,
    pub current: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamStats>,
    pub transport_faults: u64,
    pub transmits_started: u64,
    pub transmits_completed: u64,
}

enum RxStore {
    Framed {
        queue: RxQueue,
        classifier: Arc<dyn Classifier>,
    },
    Stream(RxStreamBuffer),
}

pub(crate) struct Channel {
    id: ChannelId,
    mode: ChannelMode,
    open: AtomicBool,
    activated: AtomicBool,
    store: RxStore,
    hooks: Option<Arc<dyn ChannelHooks>>,
    rx_signal: Signal,
    tx_signal: Signal,
    // started/confirmed: consumer; completed: producer, or control under the
    // device write lock.
    tx_started: AtomicU64,
    tx_confirmed: AtomicU64,
    tx_completed: AtomicU64,
    faults: AtomicU64,
    last_fault: AtomicU8,
    faults_seen: AtomicU64,
    consumer: Mutex<()>,
    sender: Mutex<()>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        options: ChannelOptions,
        default_queue: QueueConfig,
    ) -> Result<Self> {
        let queue_config = options.queue.unwrap_or(default_queue);
        let store = match options.mode {
            ChannelMode::Framed => {
                let classifier = options.classifier.ok_or_else(|| {
                    LinkError::InvalidArgument("framed mode requires a classifier".to_string())
                })?;
                RxStore::Framed {
                    queue: RxQueue::new(queue_config)?,
                    classifier,
                }
            }
            ChannelMode::Stream => RxStore::Stream(RxStreamBuffer::new(queue_config.capacity)?),
        };
        Ok(Self {
            id,
            mode: options.mode,
            open: AtomicBool::new(true),
            activated: AtomicBool::new(false),
            store,
            hooks: options.hooks,
            rx_signal: Signal::new(),
            tx_signal: Signal::new(),
            tx_started: AtomicU64::new(0),
            tx_confirmed: AtomicU64::new(0),
            tx_completed: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            last_fault: AtomicU8::new(0),
            faults_seen: AtomicU64::new(0),
            consumer: Mutex::new(()),
            sender: Mutex::new(()),
        })
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn is_paused(&self) -> bool {
        match &self.store {
            RxStore::Framed { queue, .. } => queue.is_paused(),
            RxStore::Stream(_) => false,
        }
    }

    pub(crate) fn mark_active(&self) {
        self.activated.store(true, Ordering::Release);
    }

    pub(crate) fn state(&self) -> ChannelState {
        if !self.is_open() {
            ChannelState::Uninitialized
        } else if self.is_paused() {
            ChannelState::Paused
        } else if self.activated.load(Ordering::Acquire) {
            ChannelState::Active
        } else {
            ChannelState::Initialized
        }
    }

    /// Producer side: store one byte. Returns whether to keep receiving.
    pub(crate) fn deliver(&self, byte: u8) -> bool {
        let (notify, keep_receiving) = match &self.store {
            RxStore::Framed { queue, classifier } => {
                let outcome = queue.write_byte(byte, classifier.as_ref());
                (outcome.message_complete, outcome.keep_receiving)
            }
            RxStore::Stream(buffer) => (buffer.write_byte(byte), true),
        };
        if notify {
            self.rx_signal.raise();
            if let Some(hooks) = &self.hooks {
                hooks.on_message(self.id);
            }
        } else if !keep_receiving {
            // a waiter may have drained the queue before this pause landed
            self.rx_signal.raise();
        }
        keep_receiving
    }

    /// Attribute one transmit completion to this channel, if it has one
    /// outstanding. With `confirmed_only`, transmits whose acceptance has not
    /// been recorded yet are skipped.
    pub(crate) fn claim_transmit(&self, confirmed_only: bool) -> bool {
        let completed = self.tx_completed.load(Ordering::Acquire);
        let mark = if confirmed_only {
            self.tx_confirmed.load(Ordering::Acquire)
        } else {
            self.tx_started.load(Ordering::Acquire)
        };
        if mark <= completed {
            return false;
        }
        if self
            .tx_completed
            .compare_exchange(completed, completed + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.tx_signal.raise();
        if let Some(hooks) = &self.hooks {
            hooks.on_transmit_complete(self.id);
        }
        true
    }

    pub(crate) fn tx_pending(&self) -> bool {
        self.tx_started.load(Ordering::Acquire) > self.tx_completed.load(Ordering::Acquire)
    }

    /// Forget outstanding transmits. Caller holds the device write lock.
    pub(crate) fn abandon_transmits(&self) {
        let started = self.tx_started.load(Ordering::Acquire);
        self.tx_confirmed.store(started, Ordering::Release);
        self.tx_completed.store(started, Ordering::Release);
    }

    /// Producer side: remember a fault for the next receive.
    pub(crate) fn record_fault(&self, fault: PortFault) {
        self.last_fault.store(fault.code(), Ordering::Relaxed);
        self.faults.fetch_add(1, Ordering::Release);
        self.rx_signal.raise();
        if let Some(hooks) = &self.hooks {
            hooks.on_transport_error(self.id, fault);
        }
    }

    fn fault_pending(&self) -> bool {
        self.faults.load(Ordering::Acquire) != self.faults_seen.load(Ordering::Acquire)
    }

    /// Consume a pending fault, if any.
    fn take_fault(&self) -> Option<PortFault> {
        let faults = self.faults.load(Ordering::Acquire);
        if faults == self.faults_seen.load(Ordering::Relaxed) {
            return None;
        }
        self.faults_seen.store(faults, Ordering::Release);
        let code = self.last_fault.load(Ordering::Relaxed);
        Some(PortFault::from_code(code).unwrap_or(PortFault::Io))
    }

    fn rx_ready(&self) -> bool {
        if !self.is_open() || self.fault_pending() {
            return true;
        }
        match &self.store {
            RxStore::Framed { queue, .. } => queue.unread() > 0 || queue.resume_due(),
            RxStore::Stream(buffer) => buffer.available() > 0,
        }
    }

    /// Mark the channel closed. Returns false if it already was.
    pub(crate) fn shut(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }

    /// Empty the receive store. The producer must not be able to reach the
    /// channel while this runs.
    pub(crate) fn discard(&self) {
        let _consumer = lock(&self.consumer);
        match &self.store {
            RxStore::Framed { queue, classifier } => {
                queue.reset();
                classifier.reset();
            }
            RxStore::Stream(buffer) => buffer.reset(),
        }
        self.faults_seen
            .store(self.faults.load(Ordering::Acquire), Ordering::Release);
    }

    pub(crate) fn wake_all(&self) {
        self.rx_signal.raise();
        self.tx_signal.raise();
    }

    fn free_bytes(&self) -> usize {
        match &self.store {
            RxStore::Framed { queue, .. } => queue.free_bytes(),
            RxStore::Stream(buffer) => buffer.free_bytes(),
        }
    }

    pub(crate) fn stats(&self, current: bool) -> ChannelStats {
        let (queue, stream) = match &self.store {
            RxStore::Framed { queue, .. } => (Some(queue.stats()), None),
            RxStore::Stream(buffer) => (None, Some(buffer.stats())),
        };
        ChannelStats {
            id: self.id,
            mode: self.mode,
            state: self.state(),
            current,
            queue,
            stream,
            transport_faults: self.faults.load(Ordering::Acquire),
            transmits_started: self.tx_started.load(Ordering::Acquire),
            transmits_completed: self.tx_completed.load(Ordering::Acquire),
        }
    }
}

/// Handle to an open channel.
///
/// Clones refer to the same channel. Dropping a handle does not close the
/// channel; call [`close`](ChannelHandle::close).
#[derive(Clone)]
pub struct ChannelHandle {
    device: Arc<Device>,
    channel: Arc<Channel>,
}

impl ChannelHandle {
    pub(crate) fn new(device: Arc<Device>, channel: Arc<Channel>) -> Self {
        Self { device, channel }
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id
    }

    pub fn mode(&self) -> ChannelMode {
        self.channel.mode
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Close the channel, discarding unread data and waking any waiter.
    ///
    /// The inactive channel of the device, if any, becomes current. A second
    /// close returns [`LinkError::NotInitialized`].
    pub fn close(&self) -> Result<()> {
        self.device.close_channel(&self.channel)
    }

    /// Route incoming bytes to this channel.
    pub fn select(&self) -> Result<()> {
        self.device.select_channel(&self.channel)
    }

    /// Empty this channel's queue while keeping it open.
    pub fn reset(&self) -> Result<()> {
        self.device.reset_channel(&self.channel)
    }

    /// The other open channel on the same device.
    pub fn other_channel(&self) -> Result<Option<ChannelHandle>> {
        self.ensure_open()?;
        Ok(self
            .device
            .other_channel(&self.channel)
            .map(|other| ChannelHandle::new(Arc::clone(&self.device), other)))
    }

    /// Whether incoming bytes are currently routed to this channel.
    pub fn is_current(&self) -> bool {
        self.device.is_current(&self.channel)
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn free_bytes(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.channel.free_bytes())
    }

    pub fn stats(&self) -> ChannelStats {
        self.channel.stats(self.is_current())
    }

    /// Dump of the framed queue.
    pub fn snapshot(&self) -> Result<QueueSnapshot> {
        self.ensure_open()?;
        match &self.channel.store {
            RxStore::Framed { queue, .. } => Ok(queue.snapshot()),
            RxStore::Stream(_) => Err(LinkError::InvalidArgument(
                "stream channels have no message queue".to_string(),
            )),
        }
    }

    /// Start transmitting `bytes` on the device.
    ///
    /// Retries every `retry_interval` while the interface is busy, up to
    /// `send_timeout`. Returns once the interface accepted the transfer;
    /// use [`wait_transmit`](Self::wait_transmit) to wait for completion.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(LinkError::InvalidArgument("empty payload".to_string()));
        }
        self.ensure_open()?;
        if !self.is_current() {
            return Err(LinkError::InvalidArgument(format!(
                "{} is not the selected channel",
                self.channel.id
            )));
        }

        let config = self.device.config();
        let deadline = Instant::now() + config.send_timeout();
        let channel = &self.channel;
        let _sender = lock(&channel.sender);
        let started = channel.tx_started.load(Ordering::Relaxed) + 1;
        channel.tx_started.store(started, Ordering::Release);

        let mut retries = 0u32;
        loop {
            match self.device.port().begin_transmit(bytes) {
                Ok(()) => break,
                Err(err) if err.is_busy() => {
                    if Instant::now() >= deadline {
                        channel.tx_started.store(started - 1, Ordering::Release);
                        warn!(channel = %channel.id, retries, "send timed out, interface busy");
                        return Err(LinkError::TimedOut(config.send_timeout()));
                    }
                    retries += 1;
                    debug!(channel = %channel.id, retries, "interface busy, retrying send");
                    thread::sleep(config.retry_interval());
                }
                Err(err) => {
                    channel.tx_started.store(started - 1, Ordering::Release);
                    return Err(err.into());
                }
            }
        }
        channel.tx_confirmed.store(started, Ordering::Release);
        self.device.resume_stalled_receive();
        Ok(())
    }

    /// Block until every transmit started by this channel has completed.
    pub fn wait_transmit(&self, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        let channel = &self.channel;
        let target = channel.tx_started.load(Ordering::Acquire);
        let done = channel.tx_signal.wait(Some(timeout), || {
            !channel.is_open() || channel.tx_completed.load(Ordering::Acquire) >= target
        });
        self.ensure_open()?;
        if done {
            Ok(())
        } else {
            Err(LinkError::TimedOut(timeout))
        }
    }

    pub fn transmit_pending(&self) -> bool {
        self.channel.tx_pending()
    }

    /// Copy the oldest complete message into `out`, replacing its contents.
    ///
    /// Never blocks. A fault reported by the interface since the last call
    /// is returned once as [`LinkError::TransportFault`], and reception is
    /// re-armed.
    pub fn receive(&self, out: &mut BytesMut) -> Result<Receipt> {
        let channel = &self.channel;
        if !channel.is_open() {
            return Ok(Receipt::Closed);
        }
        self.surface_fault()?;

        let (result, resume) = {
            let _consumer = lock(&channel.consumer);
            let RxStore::Framed { queue, .. } = &channel.store else {
                return Err(LinkError::InvalidArgument(
                    "receive on a stream channel; use stream_receive".to_string(),
                ));
            };
            out.clear();
            match queue.read(out)? {
                Some(outcome) => (Some(outcome), outcome.resume),
                // a pause published after the last read still needs lifting
                None => (None, queue.poll_resume()),
            }
        };

        if resume {
            debug!(
                channel = %channel.id,
                free = channel.free_bytes(),
                "reception resumed"
            );
            // a message already out must not be lost to a failed re-arm
            if let Err(err) = self.device.kick() {
                warn!(channel = %channel.id, error = %err, "re-arm after resume failed");
            }
        }
        Ok(match result {
            Some(outcome) => Receipt::Message {
                size: outcome.size,
                remaining: outcome.remaining,
            },
            None => Receipt::Empty,
        })
    }

    /// Like [`receive`](Self::receive), but waits up to `timeout` for a
    /// message.
    pub fn receive_timeout(&self, out: &mut BytesMut, timeout: Duration) -> Result<Receipt> {
        self.receive_until(out, Some(timeout))
    }

    /// Like [`receive`](Self::receive), but waits for a message or close.
    pub fn receive_blocking(&self, out: &mut BytesMut) -> Result<Receipt> {
        self.receive_until(out, None)
    }

    fn receive_until(&self, out: &mut BytesMut, timeout: Option<Duration>) -> Result<Receipt> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.receive(out)? {
                Receipt::Empty => {}
                receipt => return Ok(receipt),
            }
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => return Ok(Receipt::TimedOut),
                },
                None => None,
            };
            let channel = &self.channel;
            if !channel.rx_signal.wait(remaining, || channel.rx_ready()) {
                return Ok(Receipt::TimedOut);
            }
        }
    }

    /// Async counterpart of [`receive_timeout`](Self::receive_timeout);
    /// `None` waits until a message arrives or the channel closes.
    #[cfg(feature = "async")]
    pub async fn receive_async(
        &self,
        out: &mut BytesMut,
        timeout: Option<Duration>,
    ) -> Result<Receipt> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.receive(out)? {
                Receipt::Empty => {}
                receipt => return Ok(receipt),
            }
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => return Ok(Receipt::TimedOut),
                },
                None => None,
            };
            let channel = &self.channel;
            if !channel
                .rx_signal
                .wait_async(remaining, || channel.rx_ready())
                .await
            {
                return Ok(Receipt::TimedOut);
            }
        }
    }

    /// Move up to `out.len()` buffered bytes into `out`. Never blocks;
    /// returns 0 when nothing is buffered.
    pub fn stream_receive(&self, out: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        self.surface_fault()?;
        let _consumer = lock(&self.channel.consumer);
        match &self.channel.store {
            RxStore::Stream(buffer) => Ok(buffer.read(out)),
            RxStore::Framed { .. } => Err(LinkError::InvalidArgument(
                "stream_receive on a framed channel; use receive".to_string(),
            )),
        }
    }

    /// Like [`stream_receive`](Self::stream_receive), but waits up to
    /// `timeout` for at least one byte. Returns 0 on timeout.
    pub fn stream_receive_timeout(&self, out: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let n = self.stream_receive(out)?;
            if n > 0 || out.is_empty() {
                return Ok(n);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(0);
            }
            let channel = &self.channel;
            channel.rx_signal.wait(Some(left), || channel.rx_ready());
        }
    }

    fn surface_fault(&self) -> Result<()> {
        let Some(fault) = self.channel.take_fault() else {
            return Ok(());
        };
        warn!(channel = %self.channel.id, %fault, "transport fault surfaced");
        if let Err(err) = self.device.kick() {
            warn!(channel = %self.channel.id, error = %err, "re-arm after fault failed");
        }
        Err(LinkError::TransportFault(fault))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.channel.is_open() {
            Ok(())
        } else {
            Err(LinkError::NotInitialized)
        }
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.channel.id)
            .field("mode", &self.channel.mode)
            .field("state", &self.channel.state())
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
