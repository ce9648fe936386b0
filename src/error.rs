//! Error types for muxtun.

use thiserror::Error;

/// Main error type for all tunnel operations.
///
/// Per-stream failures stay per-stream: the dispatcher and engines map
/// them onto `ERROR` frames or terminal close frames for the affected
/// stream. Only configuration and startup failures are fatal.
#[derive(Debug, Error)]
pub enum MuxError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol error on the transport.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization error (control channel only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Inbound binary message shorter than the 5-byte envelope.
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// Message type octet outside the closed protocol enum.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// Malformed sub-payload (truncated record, bad UTF-8, bad tag).
    #[error("codec error: {0}")]
    Codec(String),

    /// The remote peer reported a failure for this stream.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// A per-operation deadline elapsed.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The transport send queue is at capacity; the frame was dropped.
    #[error("send queue full, frame dropped")]
    QueueFull,

    /// The pending-request table is at capacity.
    #[error("too many in-flight requests")]
    PendingTableFull,

    /// Transport closed while the operation was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// URL failed to parse or has a scheme the tunnel does not carry.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Reattach requested for a session id the registry does not know.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// The egress refused a new session: capacity reached.
    #[error("session limit reached")]
    SessionLimit,

    /// Invalid construction parameters. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias using MuxError.
pub type Result<T> = std::result::Result<T, MuxError>;
