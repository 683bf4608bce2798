use bytes::BytesMut;
use modemlink_channel::{
    ChannelHandle, ChannelMode, DeviceId, DeviceTable, LinkConfig, LinkError, Receipt,
};
use modemlink_transport::SimulatedUart;
use tracing::{info, warn};

use crate::cmd::{parse_escaped, parse_hex, ReplayArgs};
use crate::exit::{io_error, link_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_messages, print_snapshot, print_stats, OutputFormat, Received};

const REPLAY_DEVICE: DeviceId = DeviceId(0);
const STREAM_READ_SIZE: usize = 256;

pub fn run(args: ReplayArgs, format: OutputFormat, config: LinkConfig) -> CliResult<i32> {
    let input = load_input(&args)?;
    if args.chunk == 0 {
        return Err(CliError::new(USAGE, "chunk size must be greater than zero"));
    }
    let options = args.channel.options(&config)?;

    let table = DeviceTable::new(config).map_err(|err| link_error("invalid config", err))?;
    let port = SimulatedUart::new("replay");
    let device = table
        .init(REPLAY_DEVICE, port.clone())
        .map_err(|err| link_error("device init failed", err))?;
    let handle = table
        .open(REPLAY_DEVICE, options)
        .map_err(|err| link_error("open failed", err))?;

    let mut received = Vec::new();
    for chunk in input.chunks(args.chunk) {
        port.inject(chunk);
        drain(&handle, &port, &mut received)?;
    }
    drain(&handle, &port, &mut received)?;
    let undelivered = port.pending_len();

    info!(
        channel = %handle.id(),
        input = input.len(),
        messages = received.len(),
        undelivered,
        "replay finished"
    );
    print_messages(&received, format);

    if args.dump {
        match handle.snapshot() {
            Ok(snapshot) => print_snapshot(&snapshot, format),
            Err(LinkError::InvalidArgument(_)) => {
                warn!("--dump needs a framed channel; skipped");
            }
            Err(err) => return Err(link_error("dump failed", err)),
        }
    }
    if args.stats {
        print_stats(&handle.stats(), &device.stats(), undelivered, format);
    }

    table
        .deinit(REPLAY_DEVICE)
        .map_err(|err| link_error("device deinit failed", err))?;
    Ok(SUCCESS)
}

fn load_input(args: &ReplayArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        parse_escaped(data)
    } else if let Some(hex) = &args.hex {
        parse_hex(hex)
    } else if let Some(path) = &args.file {
        std::fs::read(path)
            .map_err(|err| io_error(&format!("cannot read {}", path.display()), err))
    } else {
        Err(CliError::new(USAGE, "one of --data, --hex or --file is required"))
    }
}

/// Take everything the channel holds, pumping bytes the simulator held back
/// while reception was paused, until neither side makes progress.
fn drain(
    handle: &ChannelHandle,
    port: &SimulatedUart,
    received: &mut Vec<Received>,
) -> CliResult<()> {
    match handle.mode() {
        ChannelMode::Framed => drain_framed(handle, port, received),
        ChannelMode::Stream => drain_stream(handle, port, received),
    }
}

fn drain_framed(
    handle: &ChannelHandle,
    port: &SimulatedUart,
    received: &mut Vec<Received>,
) -> CliResult<()> {
    let mut out = BytesMut::new();
    loop {
        match handle.receive(&mut out) {
            Ok(Receipt::Message { remaining, .. }) => received.push(Received {
                channel: handle.id(),
                payload: out.to_vec(),
                remaining,
            }),
            Ok(Receipt::Empty) => {
                if port.pump() == 0 {
                    return Ok(());
                }
            }
            Ok(Receipt::TimedOut | Receipt::Closed) => return Ok(()),
            Err(LinkError::TransportFault(fault)) => {
                warn!(channel = %handle.id(), %fault, "transport fault during replay");
            }
            Err(err) => return Err(link_error("receive failed", err)),
        }
    }
}

fn drain_stream(
    handle: &ChannelHandle,
    port: &SimulatedUart,
    received: &mut Vec<Received>,
) -> CliResult<()> {
    let mut buf = [0u8; STREAM_READ_SIZE];
    loop {
        let n = match handle.stream_receive(&mut buf) {
            Ok(n) => n,
            Err(LinkError::TransportFault(fault)) => {
                warn!(channel = %handle.id(), %fault, "transport fault during replay");
                continue;
            }
            Err(err) => return Err(link_error("receive failed", err)),
        };
        if n > 0 {
            received.push(Received {
                channel: handle.id(),
                payload: buf[..n].to_vec(),
                remaining: 0,
            });
        } else if port.pump() == 0 {
            return Ok(());
        }
    }
}
