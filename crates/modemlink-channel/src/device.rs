//! Devices: one physical interface shared by up to two channels.
//!
//! The device is the interface's event sink. Each received byte is written
//! into whichever channel is current; the other open channel keeps its
//! buffered state untouched until it is selected again.
//!
//! Control operations serialize on the slot lock. The producer never takes
//! it: it reads the current channel through an atomic pointer that mirrors
//! the current slot, so a byte arriving during a hand-off still lands in a
//! queue.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError, Weak};
use std::thread;

use modemlink_transport::{PortError, PortEvents, PortFault, SerialPort};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelHandle, ChannelId, ChannelOptions, ChannelStats};
use crate::config::LinkConfig;
use crate::error::{LinkError, Result};

/// Index of a device in a [`DeviceTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId(pub u8);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Counters of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    /// Bytes that arrived with no channel open, or while the current
    /// channel was being reset.
    pub dropped: u64,
    /// Faults reported by the interface.
    pub faults: u64,
    /// Receive arms refused with `Busy` and deferred.
    pub stalls: u64,
    /// Transmit completions with no outstanding transmit to match.
    pub stray_completions: u64,
}

/// The physical receive path: at most one one-byte receive outstanding.
struct Link {
    port: Arc<dyn SerialPort>,
    rx_armed: AtomicBool,
    rx_stalled: AtomicBool,
    stalls: AtomicU64,
}

impl Link {
    /// Arm a receive unless one is already outstanding.
    ///
    /// A `Busy` refusal marks the receive as stalled; it is re-armed by the
    /// next accepted send or transmit completion.
    fn arm(&self) -> std::result::Result<(), PortError> {
        if self.rx_armed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.port.arm_receive() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.rx_armed.store(false, Ordering::SeqCst);
                if err.is_busy() {
                    self.stalls.fetch_add(1, Ordering::Relaxed);
                    self.rx_stalled.store(true, Ordering::SeqCst);
                }
                Err(err)
            }
        }
    }

    /// Re-arm a stalled receive. Only one caller wins the stalled flag.
    fn resume_stalled(&self) -> bool {
        self.rx_stalled.swap(false, Ordering::SeqCst) && self.arm().is_ok()
    }
}

#[derive(Default)]
struct Slots {
    current: Option<Arc<Channel>>,
    inactive: Option<Arc<Channel>>,
}

impl Slots {
    fn is_current(&self, channel: &Arc<Channel>) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, channel))
    }

    fn is_inactive(&self, channel: &Arc<Channel>) -> bool {
        self.inactive
            .as_ref()
            .is_some_and(|inactive| Arc::ptr_eq(inactive, channel))
    }

    fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.current.iter().chain(self.inactive.iter())
    }

    /// Remove `channel`, promoting the inactive channel if the current one
    /// left. Returns true when a promotion happened.
    fn remove(&mut self, channel: &Arc<Channel>) -> bool {
        if self.is_current(channel) {
            self.current = self.inactive.take();
            self.current.is_some()
        } else {
            if self.is_inactive(channel) {
                self.inactive = None;
            }
            false
        }
    }
}

/// Marks a producer call in flight for as long as it lives.
struct Delivery<'a>(&'a AtomicUsize);

impl<'a> Delivery<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A physical interface and its channel slots.
pub struct Device {
    id: DeviceId,
    config: LinkConfig,
    link: Link,
    slots: RwLock<Slots>,
    // Non-owning mirror of `slots.current`, read by the producer.
    receiver: AtomicPtr<Channel>,
    deliveries: AtomicUsize,
    initialized: AtomicBool,
    next_channel: AtomicU32,
    dropped: AtomicU64,
    faults: AtomicU64,
    stray_completions: AtomicU64,
    unclaimed_completions: AtomicU64,
}

impl Device {
    /// Bind `port` to a new device and register it as the port's event sink.
    pub fn new(id: DeviceId, port: Arc<dyn SerialPort>, config: LinkConfig) -> Arc<Self> {
        let device = Arc::new(Self {
            id,
            config,
            link: Link {
                port,
                rx_armed: AtomicBool::new(false),
                rx_stalled: AtomicBool::new(false),
                stalls: AtomicU64::new(0),
            },
            slots: RwLock::new(Slots::default()),
            receiver: AtomicPtr::new(ptr::null_mut()),
            deliveries: AtomicUsize::new(0),
            initialized: AtomicBool::new(true),
            next_channel: AtomicU32::new(1),
            dropped: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            stray_completions: AtomicU64::new(0),
            unclaimed_completions: AtomicU64::new(0),
        });
        let sink: Weak<dyn PortEvents> = Arc::downgrade(&device) as Weak<dyn PortEvents>;
        device.link.port.attach(sink);
        info!(
            device = %id,
            port = device.link.port.name(),
            kind = %device.link.port.kind(),
            "device initialized"
        );
        device
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn port(&self) -> &Arc<dyn SerialPort> {
        &self.link.port
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Open a channel on this device.
    ///
    /// The first open channel becomes current; the second is registered
    /// inactive. Reception is armed if it is not already.
    pub fn open(self: &Arc<Self>, options: ChannelOptions) -> Result<ChannelHandle> {
        if !self.is_initialized() {
            return Err(LinkError::InvalidArgument(format!(
                "{} is not initialized",
                self.id
            )));
        }
        let id = ChannelId {
            device: self.id,
            number: self.next_channel.fetch_add(1, Ordering::Relaxed),
        };
        let mode = options.mode();
        let channel = Arc::new(Channel::new(id, options, self.config.default_queue)?);

        let current = {
            let mut slots = self.write_slots();
            if slots.current.is_none() {
                slots.current = Some(Arc::clone(&channel));
                self.publish(&slots);
                true
            } else if slots.inactive.is_none() {
                slots.inactive = Some(Arc::clone(&channel));
                false
            } else {
                return Err(LinkError::ResourceExhausted(format!(
                    "{} already has two open channels",
                    self.id
                )));
            }
        };

        if let Err(err) = self.kick() {
            {
                let mut slots = self.write_slots();
                slots.remove(&channel);
                self.publish(&slots);
                channel.shut();
            }
            warn!(channel = %id, error = %err, "open failed, receive could not be armed");
            return Err(err.into());
        }

        info!(channel = %id, %mode, current, "channel opened");
        Ok(ChannelHandle::new(Arc::clone(self), channel))
    }

    /// Close every channel and detach from the port.
    pub fn deinit(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        let closed: Vec<Arc<Channel>> = {
            let mut slots = self.write_slots();
            let closed: Vec<_> = [slots.current.take(), slots.inactive.take()]
                .into_iter()
                .flatten()
                .collect();
            self.publish(&slots);
            for channel in &closed {
                if channel.tx_pending() {
                    self.link.port.abort_transmit();
                }
                channel.abandon_transmits();
                channel.shut();
            }
            closed
        };
        for channel in &closed {
            channel.discard();
            channel.wake_all();
        }
        self.link.port.detach();
        self.link.rx_armed.store(false, Ordering::SeqCst);
        self.link.rx_stalled.store(false, Ordering::SeqCst);
        info!(device = %self.id, channels = closed.len(), "device deinitialized");
    }

    /// Re-arm reception for the current channel unless it is paused, and
    /// hand out transmit completions the producer could not attribute.
    ///
    /// A `Busy` refusal is not an error: the receive is marked stalled.
    pub(crate) fn kick(&self) -> std::result::Result<(), PortError> {
        let slots = self.read_slots();
        self.settle_completions(&slots);
        let Some(current) = slots.current.as_ref() else {
            return Ok(());
        };
        if current.is_paused() || !self.is_initialized() {
            return Ok(());
        }
        match self.link.arm() {
            Ok(()) => {
                current.mark_active();
                Ok(())
            }
            Err(err) if err.is_busy() => {
                debug!(channel = %current.id(), "receive stalled, interface busy");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn resume_stalled_receive(&self) {
        if self.link.resume_stalled() {
            debug!(device = %self.id, "stalled receive re-armed");
        }
    }

    pub(crate) fn close_channel(&self, channel: &Arc<Channel>) -> Result<()> {
        let promoted = {
            let mut slots = self.write_slots();
            if !channel.shut() {
                return Err(LinkError::NotInitialized);
            }
            if channel.tx_pending() {
                self.link.port.abort_transmit();
            }
            channel.abandon_transmits();
            let promoted = slots.remove(channel);
            self.publish(&slots);
            promoted
        };
        channel.discard();
        channel.wake_all();
        info!(channel = %channel.id(), promoted, "channel closed");
        // a promoted channel, or a byte that arrived with no channel, needs a
        // fresh receive
        if let Err(err) = self.kick() {
            warn!(device = %self.id, error = %err, "re-arm after close failed");
        }
        Ok(())
    }

    pub(crate) fn select_channel(&self, channel: &Arc<Channel>) -> Result<()> {
        {
            let mut slots = self.write_slots();
            if !channel.is_open() {
                return Err(LinkError::NotInitialized);
            }
            if slots.is_current(channel) {
                return Ok(());
            }
            if !slots.is_inactive(channel) {
                return Err(LinkError::InvalidArgument(format!(
                    "{} is not open on {}",
                    channel.id(),
                    self.id
                )));
            }
            let slots = &mut *slots;
            std::mem::swap(&mut slots.current, &mut slots.inactive);
            self.publish(slots);
        }
        info!(channel = %channel.id(), "channel selected");
        self.kick()?;
        Ok(())
    }

    pub(crate) fn reset_channel(&self, channel: &Arc<Channel>) -> Result<()> {
        {
            let slots = self.write_slots();
            if !channel.is_open() {
                return Err(LinkError::NotInitialized);
            }
            if slots.is_current(channel) {
                // bytes racing the reset are discarded with the queue
                self.route(ptr::null_mut());
                channel.discard();
                self.publish(&slots);
            } else {
                channel.discard();
            }
        }
        info!(channel = %channel.id(), "channel reset");
        self.kick()?;
        Ok(())
    }

    pub(crate) fn other_channel(&self, channel: &Arc<Channel>) -> Option<Arc<Channel>> {
        let slots = self.read_slots();
        if slots.is_current(channel) {
            slots.inactive.clone()
        } else if slots.is_inactive(channel) {
            slots.current.clone()
        } else {
            None
        }
    }

    pub(crate) fn is_current(&self, channel: &Arc<Channel>) -> bool {
        self.read_slots().is_current(channel)
    }

    /// Handle of the channel currently receiving, if any.
    pub fn current_channel(self: &Arc<Self>) -> Option<ChannelHandle> {
        let current = self.read_slots().current.clone()?;
        Some(ChannelHandle::new(Arc::clone(self), current))
    }

    /// Number of open channels (0, 1 or 2).
    pub fn open_channels(&self) -> usize {
        self.read_slots().channels().count()
    }

    pub fn channel_stats(&self) -> Vec<ChannelStats> {
        let slots = self.read_slots();
        slots
            .channels()
            .map(|channel| channel.stats(slots.is_current(channel)))
            .collect()
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            dropped: self.dropped.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            stalls: self.link.stalls.load(Ordering::Relaxed),
            stray_completions: self.stray_completions.load(Ordering::Relaxed),
        }
    }

    // Confirmed transmits are matched first, so a completion racing a new
    // send goes to the transmit that was actually in flight.
    fn attribute_completions(&self, slots: &Slots, mut count: u64) -> u64 {
        for confirmed_only in [true, false] {
            for channel in slots.channels() {
                while count > 0 && channel.claim_transmit(confirmed_only) {
                    count -= 1;
                }
            }
        }
        count
    }

    fn settle_completions(&self, slots: &Slots) {
        let count = self.unclaimed_completions.swap(0, Ordering::AcqRel);
        if count == 0 {
            return;
        }
        let stray = self.attribute_completions(slots, count);
        self.stray_completions.fetch_add(stray, Ordering::Relaxed);
    }

    /// Point the producer at `slots.current`.
    ///
    /// Caller holds the slot write lock and keeps every channel it removed
    /// alive until this returns.
    fn publish(&self, slots: &Slots) {
        let next = slots
            .current
            .as_ref()
            .map_or(ptr::null_mut(), |current| Arc::as_ptr(current).cast_mut());
        self.route(next);
    }

    /// Swap the producer's target, then wait out any delivery still using
    /// the previous one.
    fn route(&self, next: *mut Channel) {
        if self.receiver.swap(next, Ordering::SeqCst) == next {
            return;
        }
        while self.deliveries.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
    }

    /// Run `f` on the channel the producer currently writes into.
    fn with_receiver<T>(&self, f: impl FnOnce(Option<&Channel>) -> T) -> T {
        let _delivery = Delivery::enter(&self.deliveries);
        let receiver = self.receiver.load(Ordering::SeqCst);
        // SAFETY: a non-null `receiver` points into an `Arc<Channel>` held in
        // `slots.current`. `route` swaps the pointer before that Arc can be
        // released and waits for `deliveries` to drain, and this delivery was
        // counted before the pointer was loaded.
        let receiver = unsafe { receiver.as_ref() };
        f(receiver)
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, Slots> {
        self.slots
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, Slots> {
        self.slots
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // Transmit completions never wait for the slots.
    fn try_slots(&self) -> Option<RwLockReadGuard<'_, Slots>> {
        match self.slots.try_read() {
            Ok(slots) => Some(slots),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

impl PortEvents for Device {
    fn byte_received(&self, byte: u8) {
        self.link.rx_armed.store(false, Ordering::SeqCst);
        let keep_receiving = self.with_receiver(|current| match current {
            Some(current) => current.deliver(byte),
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        });
        if keep_receiving {
            let _ = self.link.arm();
        }
    }

    fn transmit_complete(&self) {
        match self.try_slots() {
            Some(slots) => {
                let stray = self.attribute_completions(&slots, 1);
                self.stray_completions.fetch_add(stray, Ordering::Relaxed);
            }
            None => {
                self.unclaimed_completions.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.link.resume_stalled();
    }

    fn transport_error(&self, fault: PortFault) {
        self.link.rx_armed.store(false, Ordering::SeqCst);
        self.faults.fetch_add(1, Ordering::Relaxed);
        self.with_receiver(|current| {
            if let Some(current) = current {
                current.record_fault(fault);
            }
        });
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("port", &self.link.port.name())
            .field("initialized", &self.is_initialized())
            .field("open_channels", &self.open_channels())
            .finish()
    }
}

/// Fixed-size table of devices, addressed by [`DeviceId`].
///
/// Lets an interrupt dispatcher that only knows a device index route events
/// without holding device references of its own.
pub struct DeviceTable {
    config: LinkConfig,
    devices: RwLock<Vec<Option<Arc<Device>>>>,
}

impl DeviceTable {
    pub fn new(config: LinkConfig) -> Result<Self> {
        config.validate()?;
        let devices = vec![None; config.max_devices];
        Ok(Self {
            config,
            devices: RwLock::new(devices),
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Initialize device `id` on `port`.
    pub fn init(&self, id: DeviceId, port: Arc<dyn SerialPort>) -> Result<Arc<Device>> {
        let mut devices = self
            .devices
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let slot = devices.get_mut(usize::from(id.0)).ok_or_else(|| {
            LinkError::InvalidArgument(format!(
                "{id} out of range (max {} devices)",
                self.config.max_devices
            ))
        })?;
        if slot.is_some() {
            return Err(LinkError::InvalidArgument(format!(
                "{id} already initialized"
            )));
        }
        let device = Device::new(id, port, self.config.clone());
        *slot = Some(Arc::clone(&device));
        Ok(device)
    }

    /// Close every channel of device `id` and free its slot.
    pub fn deinit(&self, id: DeviceId) -> Result<()> {
        let device = {
            let mut devices = self
                .devices
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            devices
                .get_mut(usize::from(id.0))
                .and_then(Option::take)
                .ok_or_else(|| LinkError::InvalidArgument(format!("{id} is not initialized")))?
        };
        device.deinit();
        Ok(())
    }

    pub fn get(&self, id: DeviceId) -> Result<Arc<Device>> {
        self.try_get(id)
            .ok_or_else(|| LinkError::InvalidArgument(format!("{id} is not initialized")))
    }

    /// Open a channel on device `id`.
    pub fn open(&self, id: DeviceId, options: ChannelOptions) -> Result<ChannelHandle> {
        self.get(id)?.open(options)
    }

    /// Route a received byte to device `id`. Never blocks.
    pub fn on_byte_received(&self, id: DeviceId, byte: u8) {
        if let Some(device) = self.try_get_nonblocking(id) {
            device.byte_received(byte);
        }
    }

    pub fn on_transmit_complete(&self, id: DeviceId) {
        if let Some(device) = self.try_get_nonblocking(id) {
            device.transmit_complete();
        }
    }

    pub fn on_transport_error(&self, id: DeviceId, fault: PortFault) {
        if let Some(device) = self.try_get_nonblocking(id) {
            device.transport_error(fault);
        }
    }

    fn try_get(&self, id: DeviceId) -> Option<Arc<Device>> {
        let devices = self
            .devices
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        devices.get(usize::from(id.0)).cloned().flatten()
    }

    fn try_get_nonblocking(&self, id: DeviceId) -> Option<Arc<Device>> {
        let devices = match self.devices.try_read() {
            Ok(devices) => devices,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        devices.get(usize::from(id.0)).cloned().flatten()
    }
}

impl fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTable")
            .field("max_devices", &self.config.max_devices)
            .finish()
    }
}
