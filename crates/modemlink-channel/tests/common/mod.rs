#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use modemlink_channel::{
    ChannelHandle, ChannelHooks, ChannelId, ChannelOptions, Device, DeviceId, LinkConfig, Receipt,
};
use modemlink_queue::{QueueConfig, Terminator, CR};
use modemlink_transport::{PortFault, SimulatedUart};

pub fn device() -> (Arc<SimulatedUart>, Arc<Device>) {
    device_with(LinkConfig::default())
}

pub fn device_with(config: LinkConfig) -> (Arc<SimulatedUart>, Arc<Device>) {
    let port = SimulatedUart::new("sim0");
    let device = Device::new(DeviceId(0), port.clone(), config);
    (port, device)
}

pub fn framed(device: &Arc<Device>, capacity: usize, threshold: usize) -> ChannelHandle {
    device
        .open(ChannelOptions::framed(Terminator(CR)).with_queue(QueueConfig::new(capacity, threshold)))
        .unwrap()
}

pub fn recv(handle: &ChannelHandle) -> Option<Vec<u8>> {
    let mut out = BytesMut::new();
    match handle.receive(&mut out).unwrap() {
        Receipt::Message { size, .. } => {
            assert_eq!(size, out.len());
            Some(out.to_vec())
        }
        _ => None,
    }
}

#[derive(Default)]
pub struct CountingHooks {
    pub messages: AtomicUsize,
    pub transmits: AtomicUsize,
    pub faults: Mutex<Vec<(ChannelId, PortFault)>>,
}

impl CountingHooks {
    pub fn messages(&self) -> usize {
        self.messages.load(Ordering::SeqCst)
    }

    pub fn transmits(&self) -> usize {
        self.transmits.load(Ordering::SeqCst)
    }
}

impl ChannelHooks for CountingHooks {
    fn on_message(&self, _channel: ChannelId) {
        self.messages.fetch_add(1, Ordering::SeqCst);
    }

    fn on_transmit_complete(&self, _channel: ChannelId) {
        self.transmits.fetch_add(1, Ordering::SeqCst);
    }

    fn on_transport_error(&self, channel: ChannelId, fault: PortFault) {
        self.faults.lock().unwrap().push((channel, fault));
    }
}
