//! UDP socket engine (egress side).
//!
//! Each stream owns one ephemeral datagram socket bound on all interfaces.
//! A receive loop frames every datagram with its sender's address and
//! forwards it as `UDP_DATA`; outbound frames decode a target address and
//! `send_to` it. UDP is lossy by contract: send failures are logged at
//! debug level and never tear the socket down.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::codec::{SocketEndpoint, UdpPacket};
use crate::config::{TunnelConfig, MAX_UDP_PACKET_SIZE};
use crate::protocol::MessageType;
use crate::transport::Link;

use super::tcp::MAX_TOMBSTONES;

struct UdpEntry {
    socket: Arc<UdpSocket>,
    cancel: Arc<Notify>,
}

struct UdpInner {
    link: Link,
    config: TunnelConfig,
    sockets: Mutex<HashMap<u32, UdpEntry>>,
    tombstones: Mutex<HashSet<u32>>,
}

/// Egress-side UDP relay.
#[derive(Clone)]
pub struct UdpEngine {
    inner: Arc<UdpInner>,
}

impl UdpEngine {
    /// Create the engine for one session's link.
    pub fn new(link: Link, config: TunnelConfig) -> Self {
        Self {
            inner: Arc::new(UdpInner {
                link,
                config,
                sockets: Mutex::new(HashMap::new()),
                tombstones: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Live socket count.
    pub fn len(&self) -> usize {
        self.inner.sockets.lock().unwrap().len()
    }

    /// Check whether no sockets are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle `UDP_BIND`: allocate a socket and report its bound address.
    ///
    /// The requested host/port in the payload are ignored by contract; the
    /// socket always binds an ephemeral port on all interfaces.
    pub async fn bind(&self, id: u32, payload: Bytes) {
        if let Err(e) = SocketEndpoint::decode(&payload) {
            warn!("stream {id}: bad bind payload: {e}");
            let _ = self.inner.link.send(
                MessageType::Error,
                id,
                Bytes::from(format!("bad bind payload: {e}")),
            );
            return;
        }
        if self.inner.sockets.lock().unwrap().contains_key(&id) {
            warn!("stream {id}: duplicate UDP_BIND ignored");
            return;
        }

        let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                let _ = self.inner.link.send(
                    MessageType::Error,
                    id,
                    Bytes::from(format!("UDP bind failed: {e}")),
                );
                return;
            }
        };
        let local = match socket.local_addr() {
            Ok(addr) => SocketEndpoint::new(addr.ip().to_string(), addr.port()),
            Err(e) => {
                let _ = self.inner.link.send(
                    MessageType::Error,
                    id,
                    Bytes::from(format!("UDP bind failed: {e}")),
                );
                return;
            }
        };

        let cancel = Arc::new(Notify::new());
        self.inner.sockets.lock().unwrap().insert(
            id,
            UdpEntry {
                socket: socket.clone(),
                cancel: cancel.clone(),
            },
        );
        let _ = self
            .inner
            .link
            .send(MessageType::UdpBindAck, id, local.encode());

        tokio::spawn(recv_loop(self.clone(), id, socket, cancel));
    }

    /// Handle `UDP_DATA`: decode the target and forward the datagram.
    pub async fn send(&self, id: u32, payload: Bytes) {
        let packet = match UdpPacket::decode(payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("stream {id}: dropping bad datagram frame: {e}");
                return;
            }
        };
        let socket = {
            let sockets = self.inner.sockets.lock().unwrap();
            sockets.get(&id).map(|entry| entry.socket.clone())
        };
        let Some(socket) = socket else {
            self.reply_close_for_unknown(id);
            return;
        };
        let target = (packet.endpoint.host.as_str(), packet.endpoint.port);
        if let Err(e) = socket.send_to(&packet.data, target).await {
            debug!(
                "stream {id}: send_to {}:{} failed: {e}",
                packet.endpoint.host, packet.endpoint.port
            );
        }
    }

    /// Handle `UDP_CLOSE` and local teardown. Idempotent.
    pub async fn close(&self, id: u32, notify_peer: bool) {
        let entry = {
            let mut sockets = self.inner.sockets.lock().unwrap();
            sockets.remove(&id)
        };
        let Some(entry) = entry else {
            self.tombstone(id);
            return;
        };
        self.tombstone(id);
        entry.cancel.notify_one();
        if notify_peer {
            let _ = self.inner.link.send(MessageType::UdpClose, id, Bytes::new());
        }
    }

    /// Release every socket without notifying the peer (grace expiry).
    pub async fn close_all(&self) {
        let ids: Vec<u32> = self.inner.sockets.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.close(id, false).await;
        }
    }

    fn reply_close_for_unknown(&self, id: u32) {
        if self.tombstoned(id) {
            return;
        }
        debug!("stream {id}: datagram for unknown UDP stream; replying close");
        self.tombstone(id);
        let _ = self.inner.link.send(MessageType::UdpClose, id, Bytes::new());
    }

    fn tombstone(&self, id: u32) {
        let mut tombstones = self.inner.tombstones.lock().unwrap();
        if tombstones.len() >= MAX_TOMBSTONES {
            tombstones.clear();
        }
        tombstones.insert(id);
    }

    fn tombstoned(&self, id: u32) -> bool {
        self.inner.tombstones.lock().unwrap().contains(&id)
    }
}

async fn recv_loop(engine: UdpEngine, id: u32, socket: Arc<UdpSocket>, cancel: Arc<Notify>) {
    let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
    let gauge = engine.inner.link.gauge();
    let limit = engine.inner.config.max_ws_buffered;
    loop {
        tokio::select! {
            _ = cancel.notified() => return,
            _ = gauge.wait_below(limit) => {}
        }
        tokio::select! {
            _ = cancel.notified() => return,
            result = socket.recv_from(&mut buf) => match result {
                Ok((n, from)) => {
                    let endpoint = SocketEndpoint::new(from.ip().to_string(), from.port());
                    let packet = match UdpPacket::new(endpoint, Bytes::copy_from_slice(&buf[..n])) {
                        Ok(packet) => packet,
                        Err(e) => {
                            debug!("stream {id}: dropping oversize datagram: {e}");
                            continue;
                        }
                    };
                    let _ = engine
                        .inner
                        .link
                        .send(MessageType::UdpData, id, packet.encode());
                }
                Err(e) => {
                    debug!("stream {id}: recv_from failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> UdpEngine {
        UdpEngine::new(Link::new(TunnelConfig::default()), TunnelConfig::default())
    }

    fn bind_payload() -> Bytes {
        SocketEndpoint::new("", 0).encode()
    }

    #[tokio::test]
    async fn test_bind_reports_local_address() {
        let engine = engine();
        engine.bind(1, bind_payload()).await;
        assert_eq!(engine.len(), 1);
        // One UDP_BIND_ACK queued on the link.
        assert_eq!(engine.inner.link.queued_len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_stream_gets_single_close_reply() {
        let engine = engine();
        let payload = UdpPacket::new(
            SocketEndpoint::new("127.0.0.1", 1000),
            Bytes::from_static(b"x"),
        )
        .unwrap()
        .encode();
        engine.send(5, payload.clone()).await;
        assert_eq!(engine.inner.link.queued_len(), 1);
        engine.send(5, payload).await;
        assert_eq!(engine.inner.link.queued_len(), 1);
    }

    #[tokio::test]
    async fn test_relay_roundtrip_via_loopback_echo() {
        use std::time::Duration;

        // Loopback echo peer.
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let engine = engine();
        engine.bind(1, bind_payload()).await;

        let payload = UdpPacket::new(
            SocketEndpoint::new("127.0.0.1".to_string(), echo_addr.port()),
            Bytes::from_static(b"ping"),
        )
        .unwrap()
        .encode();
        engine.send(1, payload).await;

        // ACK + echoed UDP_DATA eventually queue on the link.
        for _ in 0..200 {
            if engine.inner.link.queued_len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.inner.link.queued_len() >= 2);

        engine.close(1, true).await;
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let engine = engine();
        engine.bind(2, bind_payload()).await;
        let before = engine.inner.link.queued_len();
        engine.close(2, true).await;
        engine.close(2, true).await;
        engine.close(2, true).await;
        // Exactly one UDP_CLOSE added.
        assert_eq!(engine.inner.link.queued_len(), before + 1);
    }
}
