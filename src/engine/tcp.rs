//! TCP stream engine (egress side).
//!
//! One stream = one native TCP connection plus two tasks: a read loop
//! driving a fixed 64 KiB buffer into `TCP_DATA` frames, and a writer task
//! fed by an mpsc channel so inbound `TCP_DATA` never contends on the
//! socket. Close is idempotent; the first closer removes the table entry
//! and is the only one to emit `TCP_CLOSE`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

use crate::codec::ConnectTarget;
use crate::config::{TunnelConfig, TCP_READ_BUFFER};
use crate::protocol::MessageType;
use crate::transport::Link;

/// Tombstone sets are cleared wholesale past this size; a very late frame
/// then gets one extra idempotent close reply instead of silence.
pub(crate) const MAX_TOMBSTONES: usize = 4096;

/// Per-stream writer channel depth.
const WRITE_CHANNEL_CAPACITY: usize = 1024;

struct TcpEntry {
    tx: mpsc::Sender<Bytes>,
    cancel: Arc<Notify>,
}

struct TcpInner {
    link: Link,
    config: TunnelConfig,
    streams: Mutex<HashMap<u32, TcpEntry>>,
    tombstones: Mutex<HashSet<u32>>,
}

/// Egress-side TCP relay.
#[derive(Clone)]
pub struct TcpEngine {
    inner: Arc<TcpInner>,
}

impl TcpEngine {
    /// Create the engine for one session's link.
    pub fn new(link: Link, config: TunnelConfig) -> Self {
        Self {
            inner: Arc::new(TcpInner {
                link,
                config,
                streams: Mutex::new(HashMap::new()),
                tombstones: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Live stream count.
    pub fn len(&self) -> usize {
        self.inner.streams.lock().unwrap().len()
    }

    /// Check whether no streams are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle `TCP_CONNECT`: dial the target and start the relay.
    pub async fn open(&self, id: u32, payload: Bytes) {
        let target = match ConnectTarget::decode(&payload) {
            Ok(target) => target,
            Err(e) => {
                warn!("stream {id}: bad connect payload: {e}");
                let _ = self.inner.link.send(
                    MessageType::Error,
                    id,
                    Bytes::from(format!("bad connect payload: {e}")),
                );
                return;
            }
        };
        if self.inner.streams.lock().unwrap().contains_key(&id) {
            warn!("stream {id}: duplicate TCP_CONNECT ignored");
            return;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            engine.dial(id, target).await;
        });
    }

    async fn dial(&self, id: u32, target: ConnectTarget) {
        let connect = TcpStream::connect((target.host.as_str(), target.port));
        let stream = match tokio::time::timeout(self.inner.config.connect_timeout, connect).await {
            Err(_) => {
                let _ = self.inner.link.send(
                    MessageType::Error,
                    id,
                    Bytes::from_static(b"TCP connect timed out"),
                );
                return;
            }
            Ok(Err(e)) => {
                debug!("stream {id}: connect to {}:{} failed: {e}", target.host, target.port);
                let _ = self.inner.link.send(
                    MessageType::Error,
                    id,
                    Bytes::from(format!("TCP connect failed: {e}")),
                );
                return;
            }
            Ok(Ok(stream)) => stream,
        };

        // The peer may have torn the stream down while we were dialing.
        if self.tombstoned(id) {
            debug!("stream {id}: closed during connect");
            return;
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
        let cancel = Arc::new(Notify::new());
        self.inner.streams.lock().unwrap().insert(
            id,
            TcpEntry {
                tx,
                cancel: cancel.clone(),
            },
        );

        let _ = self.inner.link.send(MessageType::TcpConnectAck, id, Bytes::new());

        tokio::spawn(write_loop(self.clone(), id, write_half, rx));
        tokio::spawn(read_loop(self.clone(), id, read_half, cancel));
    }

    /// Handle `TCP_DATA`: forward bytes to the native socket.
    ///
    /// A frame for an unknown stream is either a late message after local
    /// close (dropped silently) or a leaked remote-side stream (answered
    /// with `TCP_CLOSE` so the sender cleans up).
    pub async fn write(&self, id: u32, data: Bytes) {
        let tx = {
            let streams = self.inner.streams.lock().unwrap();
            streams.get(&id).map(|entry| entry.tx.clone())
        };
        match tx {
            Some(tx) => {
                if tx.send(data).await.is_err() {
                    self.close(id, true).await;
                }
            }
            None => self.reply_close_for_unknown(id),
        }
    }

    /// Handle `TCP_CLOSE` and local teardown.
    ///
    /// Idempotent: only the call that removes the entry emits `TCP_CLOSE`
    /// to the peer, and only when `notify_peer` is set.
    pub async fn close(&self, id: u32, notify_peer: bool) {
        let entry = {
            let mut streams = self.inner.streams.lock().unwrap();
            streams.remove(&id)
        };
        let Some(entry) = entry else {
            self.tombstone(id);
            return;
        };
        self.tombstone(id);
        // notify_one stores a permit, so a read loop between selects still
        // observes the cancellation.
        entry.cancel.notify_one();
        drop(entry.tx); // ends the write loop, shutting the socket down
        if notify_peer {
            let _ = self.inner.link.send(MessageType::TcpClose, id, Bytes::new());
        }
    }

    /// Tear down every stream without notifying the peer (grace expiry).
    pub async fn close_all(&self) {
        let ids: Vec<u32> = self.inner.streams.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.close(id, false).await;
        }
    }

    fn reply_close_for_unknown(&self, id: u32) {
        if self.tombstoned(id) {
            return;
        }
        debug!("stream {id}: data for unknown TCP stream; replying close");
        self.tombstone(id);
        let _ = self.inner.link.send(MessageType::TcpClose, id, Bytes::new());
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

async fn write_loop(
    engine: TcpEngine,
    id: u32,
    mut half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = half.write_all(&chunk).await {
            if is_teardown_error(&e) {
                debug!("stream {id}: write after teardown: {e}");
            } else {
                warn!("stream {id}: write failed: {e}");
            }
            engine.close(id, true).await;
            return;
        }
    }
    // Channel closed by close(); release the socket.
    let _ = half.shutdown().await;
}

async fn read_loop(engine: TcpEngine, id: u32, mut half: OwnedReadHalf, cancel: Arc<Notify>) {
    let mut buf = vec![0u8; TCP_READ_BUFFER];
    let gauge = engine.inner.link.gauge();
    let limit = engine.inner.config.max_ws_buffered;
    loop {
        // Poll the gauge down before reading another burst.
        tokio::select! {
            _ = cancel.notified() => return,
            _ = gauge.wait_below(limit) => {}
        }
        tokio::select! {
            _ = cancel.notified() => return,
            result = half.read(&mut buf) => match result {
                Ok(0) => {
                    engine.close(id, true).await;
                    return;
                }
                Ok(n) => {
                    let _ = engine.inner.link.send(
                        MessageType::TcpData,
                        id,
                        Bytes::copy_from_slice(&buf[..n]),
                    );
                }
                Err(e) => {
                    if is_teardown_error(&e) {
                        debug!("stream {id}: read after teardown: {e}");
                    } else {
                        error!("stream {id}: read failed: {e}");
                    }
                    engine.close(id, true).await;
                    return;
                }
            }
        }
    }
}

/// Errors expected while a socket is being torn down concurrently.
pub(crate) fn is_teardown_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
    ) || e.to_string().contains("closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> TcpEngine {
        TcpEngine::new(Link::new(TunnelConfig::default()), TunnelConfig::default())
    }

    #[tokio::test]
    async fn test_unknown_stream_gets_single_close_reply() {
        let engine = engine();
        engine.write(42, Bytes::from_static(b"late")).await;
        // One TCP_CLOSE queued.
        assert_eq!(engine.inner.link.queued_len(), 1);

        // Further late frames for the same stream are dropped silently.
        engine.write(42, Bytes::from_static(b"later")).await;
        engine.write(42, Bytes::from_static(b"latest")).await;
        assert_eq!(engine.inner.link.queued_len(), 1);
    }

    #[tokio::test]
    async fn test_close_unknown_stream_is_quiet() {
        let engine = engine();
        engine.close(7, true).await;
        assert_eq!(engine.inner.link.queued_len(), 0);
        assert!(engine.tombstoned(7));
    }

    #[tokio::test]
    async fn test_bad_connect_payload_yields_error_frame() {
        let engine = engine();
        engine.open(3, Bytes::from_static(b"\xFF\xFF")).await;
        assert_eq!(engine.inner.link.queued_len(), 1);
    }

    #[tokio::test]
    async fn test_connect_refused_yields_error_frame() {
        let engine = engine();
        // Port 1 on localhost is almost certainly closed; expect an ERROR.
        let payload = ConnectTarget::new("127.0.0.1", 1).encode();
        engine.open(9, payload).await;
        for _ in 0..200 {
            if engine.inner.link.queued_len() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(engine.inner.link.queued_len(), 1);
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_echo_roundtrip_over_native_socket() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let engine = engine();
        engine
            .open(1, ConnectTarget::new("127.0.0.1", addr.port()).encode())
            .await;

        // Wait for the ACK to be queued, then push data through.
        for _ in 0..200 {
            if !engine.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(engine.len(), 1);
        engine.write(1, Bytes::from_static(b"hello")).await;

        // ACK + echoed TCP_DATA eventually queue on the link.
        for _ in 0..200 {
            if engine.inner.link.queued_len() >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(engine.inner.link.queued_len() >= 2);

        engine.close(1, true).await;
        assert!(engine.is_empty());
    }

    #[test]
    fn test_teardown_error_classification() {
        use std::io::{Error, ErrorKind};
        assert!(is_teardown_error(&Error::new(ErrorKind::BrokenPipe, "x")));
        assert!(is_teardown_error(&Error::new(ErrorKind::ConnectionReset, "x")));
        assert!(is_teardown_error(&Error::new(ErrorKind::Other, "socket closed")));
        assert!(!is_teardown_error(&Error::new(ErrorKind::PermissionDenied, "x")));
    }

    #[test]
    fn test_tombstone_set_clears_at_cap() {
        let engine = engine();
        for id in 0..MAX_TOMBSTONES as u32 {
            engine.tombstone(id);
        }
        assert!(engine.tombstoned(0));
        engine.tombstone(MAX_TOMBSTONES as u32);
        // The wholesale clear keeps only the newest entry.
        assert!(!engine.tombstoned(0));
        assert!(engine.tombstoned(MAX_TOMBSTONES as u32));
    }
}
