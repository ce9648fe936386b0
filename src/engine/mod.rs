//! Engine module - the egress-side demultiplexer and per-stream engines.
//!
//! The [`Demux`] routes every inbound binary frame to the engine owning
//! that stream class. Request types create per-stream handlers; data and
//! terminal types address existing ones. Frames for streams the egress
//! has never seen are answered with the matching terminal frame so a
//! leaked initiator-side stream gets cleaned up; late frames for recently
//! closed streams are dropped silently.
//!
//! The dispatcher never suspends before the owning engine has looked up
//! or updated its stream table for the frame at hand; suspension happens
//! only at the I/O boundaries inside the engines.

mod dns;
mod http;
mod tcp;
mod udp;

pub use dns::DnsEngine;
pub use http::HttpEngine;
pub use tcp::TcpEngine;
pub use udp::UdpEngine;

use serde_json::json;
use tracing::{debug, warn};

use crate::config::TunnelConfig;
use crate::protocol::{Frame, MessageType};
use crate::transport::Link;

/// Egress-side frame router over the four stream engines.
pub struct Demux {
    tcp: TcpEngine,
    udp: UdpEngine,
    dns: DnsEngine,
    http: HttpEngine,
}

impl Demux {
    /// Create the engines for one session's link.
    pub fn new(link: Link, config: TunnelConfig) -> Self {
        Self {
            tcp: TcpEngine::new(link.clone(), config.clone()),
            udp: UdpEngine::new(link.clone(), config.clone()),
            dns: DnsEngine::new(link.clone(), config.clone()),
            http: HttpEngine::new(link, config),
        }
    }

    /// Route one inbound frame.
    pub async fn handle_frame(&self, frame: Frame) {
        let id = frame.resource_id;
        match frame.msg_type {
            MessageType::TcpConnect => self.tcp.open(id, frame.payload).await,
            MessageType::TcpData => self.tcp.write(id, frame.payload).await,
            MessageType::TcpClose => self.tcp.close(id, true).await,

            MessageType::UdpBind => self.udp.bind(id, frame.payload).await,
            MessageType::UdpData => self.udp.send(id, frame.payload).await,
            MessageType::UdpClose => self.udp.close(id, true).await,

            MessageType::DnsQuery => self.dns.resolve(id, frame.payload),

            MessageType::HttpRequest => self.http.fetch(id, frame.payload).await,
            MessageType::HttpBodyChunk => self.http.push_body(id, frame.payload).await,
            MessageType::HttpBodyEnd => self.http.end_body(id),

            MessageType::Error => {
                let message = String::from_utf8_lossy(&frame.payload);
                debug!("stream {id}: peer error: {message}");
                // The stream class is not recoverable from the id alone;
                // every engine aborts its entry if it owns one.
                self.tcp.close(id, false).await;
                self.udp.close(id, false).await;
                self.http.abort(id);
            }

            // Replies are initiator-addressed; on this side they are a
            // protocol anomaly.
            MessageType::TcpConnectAck
            | MessageType::UdpBindAck
            | MessageType::DnsResponse
            | MessageType::HttpResponse => {
                warn!(
                    "stream {id}: dropping reply frame {:?} on egress side",
                    frame.msg_type
                );
            }

            // Heartbeats are consumed by the link and never reach here.
            MessageType::Heartbeat => {}
        }
    }

    /// Destroy every stream: grace window elapsed or session closed.
    pub async fn shutdown_all(&self) {
        self.tcp.close_all().await;
        self.udp.close_all().await;
        self.http.abort_all();
    }

    /// Live stream counts for the control channel's `STATS`.
    pub fn stats(&self) -> serde_json::Value {
        json!({
            "tcp": self.tcp.len(),
            "udp": self.udp.len(),
            "http": self.http.len(),
        })
    }
}
