//! AT session example: a command channel on a simulated UART.
//!
//! A feeder thread plays the modem, answering after a short delay, while the
//! main thread sends commands and waits for each response line.
//!
//! Run with:
//!   cargo run --example at-session

use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use modemlink::channel::{ChannelOptions, Device, DeviceId, LinkConfig, Receipt};
use modemlink::queue::Sequence;
use modemlink::transport::SimulatedUart;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port = SimulatedUart::new("uart0");
    let device = Device::new(DeviceId(0), port.clone(), LinkConfig::default());
    let commands = device.open(ChannelOptions::framed(Sequence::crlf()))?;

    for (command, reply) in [
        (&b"ATI\r"[..], &b"Quectel BG96\r\nOK\r\n"[..]),
        (&b"AT+CSQ\r"[..], &b"+CSQ: 21,99\r\nOK\r\n"[..]),
    ] {
        commands.send(command)?;
        eprintln!("[host]  -> {}", String::from_utf8_lossy(command).trim_end());

        let modem = {
            let port = port.clone();
            thread::spawn(move || {
                port.complete_transmit();
                thread::sleep(Duration::from_millis(20));
                port.inject(reply);
            })
        };

        commands.wait_transmit(Duration::from_secs(1))?;
        let mut line = BytesMut::new();
        loop {
            match commands.receive_timeout(&mut line, Duration::from_secs(1))? {
                Receipt::Message { .. } => {
                    let text = String::from_utf8_lossy(&line);
                    eprintln!("[modem] <- {}", text.trim_end());
                    if text.starts_with("OK") {
                        break;
                    }
                }
                other => {
                    eprintln!("[host]  no response: {other:?}");
                    break;
                }
            }
        }
        modem.join().map_err(|_| "modem thread panicked")?;
    }

    eprintln!("[host]  stats: {:?}", commands.stats());
    device.deinit();
    Ok(())
}
