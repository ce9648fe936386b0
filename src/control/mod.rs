//! Text-frame control channel.
//!
//! A minimal string-oriented command protocol riding the transport's text
//! frames, beside the binary data plane. Commands carry no resource id.
//! The parser strips an optional leading `/` or `CMD ` prefix, splits on
//! whitespace, and uppercases the verb. Replies are JSON objects
//! `{success, message, data?}` sent back on the same text channel.
//!
//! # Example
//!
//! ```
//! use muxtun::control::{handle_line, ControlHost};
//! use std::time::Duration;
//!
//! struct Host;
//! impl ControlHost for Host {
//!     fn role(&self) -> &'static str { "egress" }
//!     fn uptime(&self) -> Duration { Duration::from_secs(1) }
//! }
//!
//! let reply = handle_line("PING", &Host).unwrap();
//! assert!(reply.contains("PONG"));
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::json;

use crate::config::PROTOCOL_VERSION;

/// JSON reply shape for every command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    /// Whether the command was understood and applied.
    pub success: bool,
    /// Human-readable outcome.
    pub message: String,
    /// Command-specific payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandResponse {
    /// Successful reply without payload.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    /// Successful reply with payload.
    pub fn ok_with(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Failure reply.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    /// Serialize to the wire string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("command response serializes")
    }
}

/// Peer-side state the command handlers read and mutate.
///
/// Both roles implement this; the default rejections cover verbs a role
/// does not support (`SET UUID` on the initiator, for instance).
pub trait ControlHost: Send + Sync {
    /// Role string reported by `GET INFO` (`"initiator"` or `"egress"`).
    fn role(&self) -> &'static str;

    /// Time since the host was constructed.
    fn uptime(&self) -> Duration;

    /// Record the peer's session identity. Returns false when unsupported.
    fn set_uuid(&self, _uuid: &str) -> bool {
        false
    }

    /// Record a requested log level. Returns false when unsupported.
    fn set_log_level(&self, _level: &str) -> bool {
        false
    }

    /// Live stream counts for `STATS`.
    fn stream_stats(&self) -> serde_json::Value {
        json!({})
    }
}

/// Handle one inbound text frame.
///
/// Returns the JSON reply to send back, or `None` for commands that take
/// no reply (`PONG`).
pub fn handle_line(line: &str, host: &dyn ControlHost) -> Option<String> {
    let response = dispatch(line, host)?;
    Some(response.to_json())
}

fn dispatch(line: &str, host: &dyn ControlHost) -> Option<CommandResponse> {
    let trimmed = line.trim();
    let stripped = trimmed
        .strip_prefix('/')
        .or_else(|| trimmed.strip_prefix("CMD "))
        .unwrap_or(trimmed);

    let mut parts = stripped.split_whitespace();
    let verb = parts.next().unwrap_or("").to_ascii_uppercase();
    let args: Vec<&str> = parts.collect();

    Some(match verb.as_str() {
        "SET" => set_command(&args, host),
        "GET" => get_command(&args, host),
        "STATS" => stats_command(host),
        "PING" => CommandResponse::ok_with("PONG", json!({ "timestamp": timestamp_ms() })),
        "PONG" => return None, // liveness ack, no reply
        "HELP" => CommandResponse::ok_with("Available commands", help_blob()),
        "" => CommandResponse::err("Empty command"),
        other => CommandResponse::err(format!("Unknown command: {other}")),
    })
}

fn set_command(args: &[&str], host: &dyn ControlHost) -> CommandResponse {
    match args {
        [key, value] if key.eq_ignore_ascii_case("uuid") => {
            if host.set_uuid(value) {
                CommandResponse::ok("UUID recorded")
            } else {
                CommandResponse::err("SET UUID is not accepted by this peer")
            }
        }
        [key, value] if key.eq_ignore_ascii_case("loglevel") => {
            if host.set_log_level(value) {
                CommandResponse::ok(format!("log level set to {value}"))
            } else {
                CommandResponse::err("SET LOGLEVEL is not accepted by this peer")
            }
        }
        [key, ..] => CommandResponse::err(format!("Unknown SET key: {key}")),
        [] => CommandResponse::err("SET requires a key and a value"),
    }
}

fn get_command(args: &[&str], host: &dyn ControlHost) -> CommandResponse {
    match args.first().map(|k| k.to_ascii_uppercase()).as_deref() {
        Some("STATUS") => {
            CommandResponse::ok_with("status", json!({ "status": "connected" }))
        }
        Some("INFO") => CommandResponse::ok_with(
            "info",
            json!({
                "role": host.role(),
                "timestamp": timestamp_ms(),
                "uptime": host.uptime().as_secs(),
            }),
        ),
        Some("VERSION") => CommandResponse::ok_with(
            "version",
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "protocol": PROTOCOL_VERSION,
            }),
        ),
        Some(other) => CommandResponse::err(format!("Unknown GET key: {other}")),
        None => CommandResponse::err("GET requires a key"),
    }
}

fn stats_command(host: &dyn ControlHost) -> CommandResponse {
    let mut data = json!({
        "uptime": host.uptime().as_secs(),
        "streams": host.stream_stats(),
    });
    if let Some(rss) = resident_memory_kb() {
        data["memory_kb"] = json!(rss);
    }
    CommandResponse::ok_with("stats", data)
}

fn help_blob() -> serde_json::Value {
    json!({
        "commands": [
            "SET UUID <uuid>",
            "SET LOGLEVEL <level>",
            "GET STATUS",
            "GET INFO",
            "GET VERSION",
            "STATS",
            "PING",
            "PONG",
            "HELP",
        ]
    })
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// VmRSS from procfs, where available.
#[cfg(target_os = "linux")]
fn resident_memory_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_kb() -> Option<u64> {
    None
}
