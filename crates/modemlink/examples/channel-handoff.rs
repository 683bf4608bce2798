//! Channel hand-off example: a command channel and a data channel sharing one
//! UART. Bytes land only in the currently selected channel.
//!
//! Run with:
//!   cargo run --example channel-handoff

use bytes::BytesMut;
use modemlink::channel::{ChannelOptions, DeviceId, DeviceTable, LinkConfig, Receipt};
use modemlink::queue::{Terminator, CR};
use modemlink::transport::SimulatedUart;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let table = DeviceTable::new(LinkConfig::default())?;
    let port = SimulatedUart::new("uart1");
    table.init(DeviceId(1), port.clone())?;

    let command = table.open(DeviceId(1), ChannelOptions::framed(Terminator(CR)))?;
    let data = table.open(DeviceId(1), ChannelOptions::stream())?;
    eprintln!("current: {}  inactive: {}", command.id(), data.id());

    port.inject(b"CONNECT 115200\r");
    data.select()?;
    port.inject(b"\x7e\x45\x00\x00\x1c\x7e");
    command.select()?;
    port.inject(b"NO CARRIER\r");

    let mut line = BytesMut::new();
    while let Receipt::Message { .. } = command.receive(&mut line)? {
        eprintln!("[{}] {}", command.id(), String::from_utf8_lossy(&line).trim_end());
    }
    let mut frame = [0u8; 64];
    let n = data.stream_receive(&mut frame)?;
    eprintln!("[{}] {} raw bytes: {:02x?}", data.id(), n, &frame[..n]);

    table.deinit(DeviceId(1))?;
    Ok(())
}
