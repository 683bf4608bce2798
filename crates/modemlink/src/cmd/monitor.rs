use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use modemlink_channel::{ChannelOptions, DeviceId, DeviceTable, LinkConfig, LinkError, Receipt};
use modemlink_transport::{HostSerial, HostSerialConfig};
use tracing::{info, warn};

use crate::cmd::{parse_duration, parse_escaped, MonitorArgs};
use crate::exit::{link_error, port_error, CliError, CliResult, INTERNAL, SUCCESS, TIMEOUT};
use crate::output::{print_message, OutputFormat, Received};

const MONITOR_DEVICE: DeviceId = DeviceId(0);
// Upper bound on how long Ctrl-C goes unnoticed.
const POLL: Duration = Duration::from_millis(100);

pub fn run(args: MonitorArgs, format: OutputFormat, config: LinkConfig) -> CliResult<i32> {
    let deadline = args
        .timeout
        .as_deref()
        .map(parse_duration)
        .transpose()?
        .map(|timeout| Instant::now() + timeout);
    let command = args.send.as_deref().map(parse_escaped).transpose()?;
    let options = args.channel.options(&config)?;

    let mut serial = HostSerialConfig::new(&args.path, args.baud);
    serial.hardware_flow_control = args.rtscts;
    let port = HostSerial::open(&serial).map_err(|err| port_error("open failed", err))?;

    let table = DeviceTable::new(config).map_err(|err| link_error("invalid config", err))?;
    table
        .init(MONITOR_DEVICE, port)
        .map_err(|err| link_error("device init failed", err))?;
    let result = monitor(&table, options, command, deadline, &args, format);
    let _ = table.deinit(MONITOR_DEVICE);
    result
}

fn monitor(
    table: &DeviceTable,
    options: ChannelOptions,
    command: Option<Vec<u8>>,
    deadline: Option<Instant>,
    args: &MonitorArgs,
    format: OutputFormat,
) -> CliResult<i32> {
    let handle = table
        .open(MONITOR_DEVICE, options)
        .map_err(|err| link_error("open failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    if let Some(command) = command {
        handle
            .send(&command)
            .map_err(|err| link_error("send failed", err))?;
        handle
            .wait_transmit(table.config().send_timeout())
            .map_err(|err| link_error("send failed", err))?;
        info!(channel = %handle.id(), bytes = command.len(), "command sent");
    }

    let mut out = BytesMut::new();
    let mut printed = 0usize;

    while running.load(Ordering::SeqCst) {
        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(CliError::new(
                        TIMEOUT,
                        format!("timed out after {printed} messages"),
                    ));
                }
                left.min(POLL)
            }
            None => POLL,
        };

        match handle.receive_timeout(&mut out, wait) {
            Ok(Receipt::Message { remaining, .. }) => {
                print_message(
                    &Received {
                        channel: handle.id(),
                        payload: out.to_vec(),
                        remaining,
                    },
                    format,
                );
                printed = printed.saturating_add(1);
                if let Some(count) = args.count {
                    if printed >= count {
                        return Ok(SUCCESS);
                    }
                }
            }
            Ok(Receipt::Empty | Receipt::TimedOut) => {}
            Ok(Receipt::Closed) => break,
            Err(LinkError::TransportFault(fault)) => {
                warn!(channel = %handle.id(), %fault, "transport fault");
            }
            Err(err) => return Err(link_error("receive failed", err)),
        }
    }

    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
