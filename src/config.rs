//! Tunable parameters for both tunnel roles.
//!
//! All defaults are the protocol's documented values; embedders override
//! individual fields and pass the struct at construction. No configuration
//! is read from the environment by the library itself.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{MuxError, Result};

/// Heartbeat send interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Liveness watchdog: no inbound traffic for this long disconnects the socket.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace window after a disconnect during which the session stays addressable.
pub const RECONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum frames buffered while the socket is not open.
pub const MAX_QUEUE_SIZE: usize = 1000;

/// Maximum in-flight requests on the initiator side.
pub const MAX_PENDING_REQUESTS: usize = 10_000;

/// Pending entries older than this are swept regardless of per-call timeouts.
pub const PENDING_SWEEP_MAX_AGE: Duration = Duration::from_secs(120);

/// Egress TCP connect deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Egress DNS resolution deadline.
pub const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Egress HTTP fetch deadline. Kept below the initiator's await deadline so
/// the egress surfaces the error first.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(25);

/// Initiator-side deadline awaiting an HTTP response.
pub const FETCH_AWAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Send-buffer depth above which TCP/UDP relays yield cooperatively.
pub const MAX_WS_BUFFERED: usize = 1024 * 1024;

/// Send-buffer depth above which the HTTP body relay yields cooperatively.
pub const MAX_WS_BUFFERED_HTTP: usize = 4 * 1024 * 1024;

/// Hard cap on a relayed HTTP response body.
pub const MAX_RESPONSE_SIZE: u64 = 100 * 1024 * 1024;

/// Fixed read buffer for the TCP relay loop.
pub const TCP_READ_BUFFER: usize = 64 * 1024;

/// Poll interval while waiting for the send buffer to drain.
pub const BACKPRESSURE_POLL: Duration = Duration::from_millis(5);

/// Largest datagram the UDP relay will carry.
pub const MAX_UDP_PACKET_SIZE: usize = 65_535;

/// Longest DNS name accepted in a query payload.
pub const MAX_DNS_NAME_LENGTH: usize = 253;

/// Protocol revision announced on `GET VERSION`.
pub const PROTOCOL_VERSION: &str = "1";

/// Parameters shared by both tunnel roles.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Heartbeat send interval.
    pub heartbeat_interval: Duration,
    /// Liveness watchdog deadline.
    pub heartbeat_timeout: Duration,
    /// Grace window before a disconnected session is destroyed.
    pub reconnect_timeout: Duration,
    /// Send-queue bound in frames.
    pub max_queue_size: usize,
    /// Initiator pending-table bound.
    pub max_pending_requests: usize,
    /// Stale-pending sweep age.
    pub pending_sweep_max_age: Duration,
    /// Egress TCP connect deadline.
    pub connect_timeout: Duration,
    /// Egress DNS resolution deadline.
    pub dns_query_timeout: Duration,
    /// Egress HTTP fetch deadline.
    pub fetch_timeout: Duration,
    /// Initiator HTTP await deadline.
    pub fetch_await_timeout: Duration,
    /// TCP/UDP backpressure threshold in bytes.
    pub max_ws_buffered: usize,
    /// HTTP backpressure threshold in bytes.
    pub max_ws_buffered_http: usize,
    /// HTTP response body cap in bytes.
    pub max_response_size: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            reconnect_timeout: RECONNECT_TIMEOUT,
            max_queue_size: MAX_QUEUE_SIZE,
            max_pending_requests: MAX_PENDING_REQUESTS,
            pending_sweep_max_age: PENDING_SWEEP_MAX_AGE,
            connect_timeout: CONNECT_TIMEOUT,
            dns_query_timeout: DNS_QUERY_TIMEOUT,
            fetch_timeout: FETCH_TIMEOUT,
            fetch_await_timeout: FETCH_AWAIT_TIMEOUT,
            max_ws_buffered: MAX_WS_BUFFERED,
            max_ws_buffered_http: MAX_WS_BUFFERED_HTTP,
            max_response_size: MAX_RESPONSE_SIZE,
        }
    }
}

impl TunnelConfig {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(MuxError::Config("max_queue_size must be > 0".into()));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(MuxError::Config(
                "heartbeat_timeout must exceed heartbeat_interval".into(),
            ));
        }
        Ok(())
    }
}

/// Egress server parameters on top of [`TunnelConfig`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for WebSocket upgrades.
    pub listen_addr: SocketAddr,
    /// Upgrade path clients must request (default `/`).
    pub connect_path: String,
    /// Maximum concurrent sessions; further upgrades are rejected.
    pub max_sessions: usize,
    /// Shared tunnel parameters.
    pub tunnel: TunnelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([127, 0, 0, 1], 8080).into(),
            connect_path: "/".to_string(),
            max_sessions: 64,
            tunnel: TunnelConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Validate the server parameters.
    pub fn validate(&self) -> Result<()> {
        if !self.connect_path.starts_with('/') {
            return Err(MuxError::Config("connect_path must start with '/'".into()));
        }
        if self.max_sessions == 0 {
            return Err(MuxError::Config("max_sessions must be > 0".into()));
        }
        self.tunnel.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = TunnelConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.reconnect_timeout, Duration::from_secs(60));
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.max_pending_requests, 10_000);
        assert_eq!(config.fetch_timeout, Duration::from_secs(25));
        assert_eq!(config.fetch_await_timeout, Duration::from_secs(30));
        assert_eq!(config.max_ws_buffered, 1024 * 1024);
        assert_eq!(config.max_ws_buffered_http, 4 * 1024 * 1024);
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let config = TunnelConfig {
            max_queue_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_heartbeat() {
        let config = TunnelConfig {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_config_path_must_be_absolute() {
        let config = ServerConfig {
            connect_path: "tunnel".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
