use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgGroup, Args, Subcommand, ValueEnum};
use modemlink_channel::{ChannelMode, ChannelOptions, LinkConfig};
use modemlink_queue::{Classifier, QueueConfig, Sequence, Terminator};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

#[cfg(feature = "serial")]
pub mod monitor;
pub mod replay;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Feed bytes through a simulated UART and print the messages framed from them.
    Replay(ReplayArgs),
    /// Open a serial port and print received messages.
    #[cfg(feature = "serial")]
    Monitor(MonitorArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat, config: LinkConfig) -> CliResult<i32> {
    match command {
        Command::Replay(args) => replay::run(args, format, config),
        #[cfg(feature = "serial")]
        Command::Monitor(args) => monitor::run(args, format, config),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum ModeArg {
    /// Split the input into messages at the terminator.
    Framed,
    /// Deliver raw bytes without framing.
    Stream,
}

/// Channel settings shared by `replay` and `monitor`.
#[derive(Args, Debug)]
pub struct ChannelArgs {
    /// Channel mode.
    #[arg(long, value_enum, default_value = "framed")]
    pub mode: ModeArg,
    /// Message terminator. Escapes \r, \n, \t, \0, \\ and \xNN are understood;
    /// more than one byte means a terminator sequence such as "\r\n".
    #[arg(long, default_value = "\\r")]
    pub terminator: String,
    /// Receive queue capacity in bytes. Overrides the config file.
    #[arg(long)]
    pub capacity: Option<usize>,
    /// Free-space threshold at which reception pauses. Overrides the config file.
    #[arg(long)]
    pub threshold: Option<usize>,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("input").required(true).args(["data", "hex", "file"])))]
pub struct ReplayArgs {
    /// Input bytes, with escapes (e.g. "AT\r\nOK\r\n").
    #[arg(long)]
    pub data: Option<String>,
    /// Input bytes as hex (whitespace and ':' separators allowed).
    #[arg(long)]
    pub hex: Option<String>,
    /// Read input bytes from a file.
    #[arg(long)]
    pub file: Option<PathBuf>,
    #[command(flatten)]
    pub channel: ChannelArgs,
    /// Bytes injected per step before the consumer drains the channel.
    #[arg(long, default_value = "16")]
    pub chunk: usize,
    /// Print the receive queue contents after the replay.
    #[arg(long)]
    pub dump: bool,
    /// Print channel and device statistics after the replay.
    #[arg(long)]
    pub stats: bool,
}

#[cfg(feature = "serial")]
#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// Serial device path (e.g. /dev/ttyUSB0, COM3).
    pub path: String,
    /// Line speed.
    #[arg(long, default_value = "115200")]
    pub baud: u32,
    /// Enable RTS/CTS hardware flow control.
    #[arg(long)]
    pub rtscts: bool,
    /// Command to send once the channel is open, with escapes (e.g. "ATI\r").
    #[arg(long)]
    pub send: Option<String>,
    #[command(flatten)]
    pub channel: ChannelArgs,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
    /// Give up after this long (e.g. 30s, 500ms).
    #[arg(long)]
    pub timeout: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

impl ChannelArgs {
    /// Build channel options on top of the configured default queue.
    pub fn options(&self, config: &LinkConfig) -> CliResult<ChannelOptions> {
        let mut queue: QueueConfig = config.default_queue;
        if let Some(capacity) = self.capacity {
            queue = queue.with_capacity(capacity);
        }
        if let Some(threshold) = self.threshold {
            queue = queue.with_pause_threshold(threshold);
        }
        let options = match self.mode {
            ModeArg::Framed => ChannelOptions::new(ChannelMode::Framed)
                .with_shared_classifier(classifier(&self.terminator)?),
            ModeArg::Stream => ChannelOptions::stream(),
        };
        Ok(options.with_queue(queue))
    }
}

fn classifier(terminator: &str) -> CliResult<Arc<dyn Classifier>> {
    let bytes = parse_escaped(terminator)?;
    match bytes.as_slice() {
        [] => Err(CliError::new(USAGE, "terminator must not be empty")),
        [byte] => Ok(Arc::new(Terminator(*byte))),
        pattern => Ok(Arc::new(Sequence::new(pattern))),
    }
}

/// Decode `\r`, `\n`, `\t`, `\0`, `\\` and `\xNN` escapes.
pub fn parse_escaped(input: &str) -> CliResult<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();
    while let Some(byte) = bytes.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        let escaped = match bytes.next() {
            Some(b'r') => b'\r',
            Some(b'n') => b'\n',
            Some(b't') => b'\t',
            Some(b'0') => 0,
            Some(b'\\') => b'\\',
            Some(b'x') => {
                let hi = bytes.next().and_then(hex_digit);
                let lo = bytes.next().and_then(hex_digit);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => (hi << 4) | lo,
                    _ => {
                        return Err(CliError::new(
                            USAGE,
                            format!("invalid \\x escape in {input:?}"),
                        ))
                    }
                }
            }
            Some(other) => {
                return Err(CliError::new(
                    USAGE,
                    format!("unknown escape \\{} in {input:?}", other as char),
                ))
            }
            None => {
                return Err(CliError::new(
                    USAGE,
                    format!("trailing backslash in {input:?}"),
                ))
            }
        };
        out.push(escaped);
    }
    Ok(out)
}

/// Decode hex digits, ignoring whitespace and ':' separators.
pub fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let digits: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':')
        .collect();
    if digits.len() % 2 != 0 {
        return Err(CliError::new(USAGE, "hex input has an odd number of digits"));
    }
    digits
        .chunks(2)
        .map(|pair| match (hex_digit(pair[0]), hex_digit(pair[1])) {
            (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
            _ => Err(CliError::new(
                USAGE,
                format!(
                    "invalid hex digit in {:?}",
                    String::from_utf8_lossy(pair)
                ),
            )),
        })
        .collect()
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
