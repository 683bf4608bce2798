use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use modemlink_channel::{ChannelId, ChannelStats, DeviceStats};
use modemlink_queue::QueueSnapshot;
use serde::Serialize;

const MESSAGE_SCHEMA: &str =
    "https://schemas.3leaps.dev/modemlink/cli/v1/message-received.schema.json";
const SNAPSHOT_SCHEMA: &str =
    "https://schemas.3leaps.dev/modemlink/cli/v1/queue-snapshot.schema.json";
const STATS_SCHEMA: &str = "https://schemas.3leaps.dev/modemlink/cli/v1/link-stats.schema.json";

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One message (or stream chunk) taken off a channel.
#[derive(Debug, Clone)]
pub struct Received {
    pub channel: ChannelId,
    pub payload: Vec<u8>,
    pub remaining: usize,
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    schema_id: &'a str,
    index: usize,
    channel: String,
    payload_size: usize,
    payload: String,
    remaining: usize,
    timestamp: String,
}

pub fn print_messages(messages: &[Received], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let timestamp = now_unix_seconds();
            for (index, msg) in messages.iter().enumerate() {
                let out = MessageOutput {
                    schema_id: MESSAGE_SCHEMA,
                    index,
                    channel: msg.channel.to_string(),
                    payload_size: msg.payload.len(),
                    payload: payload_preview(&msg.payload),
                    remaining: msg.remaining,
                    timestamp: timestamp.clone(),
                };
                print_json(&out);
            }
        }
        OutputFormat::Table => {
            if messages.is_empty() {
                return;
            }
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["#", "CHANNEL", "SIZE", "PAYLOAD"]);
            for (index, msg) in messages.iter().enumerate() {
                table.add_row(vec![
                    index.to_string(),
                    msg.channel.to_string(),
                    msg.payload.len().to_string(),
                    payload_preview(&msg.payload),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for msg in messages {
                print_message(msg, format);
            }
        }
        OutputFormat::Raw => {
            for msg in messages {
                print_raw(&msg.payload);
            }
        }
    }
}

/// Print a single message as it arrives. Tables degrade to pretty lines.
pub fn print_message(msg: &Received, format: OutputFormat) {
    match format {
        OutputFormat::Pretty | OutputFormat::Table => {
            println!(
                "channel={} size={} remaining={} payload={}",
                msg.channel,
                msg.payload.len(),
                msg.remaining,
                payload_preview(&msg.payload)
            );
        }
        OutputFormat::Json => print_messages(std::slice::from_ref(msg), format),
        OutputFormat::Raw => print_raw(&msg.payload),
    }
}

#[derive(Serialize)]
struct SnapshotOutput<'a> {
    schema_id: &'a str,
    #[serde(flatten)]
    snapshot: &'a QueueSnapshot,
}

pub fn print_snapshot(snapshot: &QueueSnapshot, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&SnapshotOutput {
            schema_id: SNAPSHOT_SCHEMA,
            snapshot,
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (field, value) in snapshot_fields(snapshot) {
                table.add_row(vec![field.to_string(), value]);
            }
            println!("{table}");

            if !snapshot.messages.is_empty() {
                let mut unread = Table::new();
                unread
                    .load_preset(UTF8_FULL)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(vec!["START", "SIZE", "PAYLOAD"]);
                for msg in &snapshot.messages {
                    unread.add_row(vec![
                        msg.start.to_string(),
                        msg.size.to_string(),
                        payload_preview(&msg.payload),
                    ]);
                }
                println!("{unread}");
            }
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            let line = snapshot_fields(snapshot)
                .into_iter()
                .map(|(field, value)| format!("{field}={value}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!("queue {line}");
            for msg in &snapshot.messages {
                println!(
                    "  unread start={} size={} payload={}",
                    msg.start,
                    msg.size,
                    payload_preview(&msg.payload)
                );
            }
        }
    }
}

fn snapshot_fields(snapshot: &QueueSnapshot) -> Vec<(&'static str, String)> {
    vec![
        ("capacity", snapshot.capacity.to_string()),
        ("index_read", snapshot.index_read.to_string()),
        ("index_write", snapshot.index_write.to_string()),
        ("current_msg_index", snapshot.current_msg_index.to_string()),
        ("current_msg_size", snapshot.current_msg_size.to_string()),
        ("free_bytes", snapshot.free_bytes.to_string()),
        ("unread", snapshot.unread.to_string()),
        ("paused", snapshot.paused.to_string()),
        ("partial", payload_preview(&snapshot.partial)),
    ]
}

#[derive(Serialize)]
struct StatsOutput<'a> {
    schema_id: &'a str,
    channel: &'a ChannelStats,
    device: &'a DeviceStats,
    undelivered: usize,
}

pub fn print_stats(
    channel: &ChannelStats,
    device: &DeviceStats,
    undelivered: usize,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => print_json(&StatsOutput {
            schema_id: STATS_SCHEMA,
            channel,
            device,
            undelivered,
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["STAT", "VALUE"]);
            for (stat, value) in stats_fields(channel, device, undelivered) {
                table.add_row(vec![stat.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            let line = stats_fields(channel, device, undelivered)
                .into_iter()
                .map(|(stat, value)| format!("{stat}={value}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!("stats {line}");
        }
    }
}

fn stats_fields(
    channel: &ChannelStats,
    device: &DeviceStats,
    undelivered: usize,
) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("channel", channel.id.to_string()),
        ("mode", channel.mode.to_string()),
        ("state", channel.state.to_string()),
    ];
    if let Some(queue) = &channel.queue {
        fields.extend([
            ("bytes_received", queue.bytes_received.to_string()),
            ("messages_completed", queue.messages_completed.to_string()),
            ("messages_consumed", queue.messages_consumed.to_string()),
            ("overruns", queue.overruns.to_string()),
            ("pauses", queue.pauses.to_string()),
        ]);
    }
    if let Some(stream) = &channel.stream {
        fields.extend([
            ("bytes_received", stream.total_received.to_string()),
            ("dropped", stream.dropped.to_string()),
        ]);
    }
    fields.extend([
        ("transport_faults", channel.transport_faults.to_string()),
        ("device_dropped", device.dropped.to_string()),
        ("device_stalls", device.stalls.to_string()),
        ("undelivered", undelivered.to_string()),
    ]);
    fields
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

/// Printable form of a payload: control characters and non-ASCII bytes are
/// escaped, so `AT\r` shows as `AT\r` rather than a bare carriage return.
pub fn payload_preview(payload: &[u8]) -> String {
    payload.escape_ascii().to_string()
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
