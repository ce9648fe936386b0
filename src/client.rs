//! Initiator-side tunnel client.
//!
//! The client owns the pending-handler table joining every in-flight
//! stream to its awaiter: one one-shot reply channel per operation, plus a
//! bounded data channel for stream classes with flowing bytes. Stream ids
//! are allocated monotonically from 1, wrapping at `2^32 - 1` back to 1;
//! 0 is reserved for heartbeats and control.
//!
//! Lifecycle safety nets: a reaper sweeps entries older than the hard age
//! bound regardless of per-call timeouts, every pending entry is rejected
//! with "Connection closed" when the transport drops, and a reconnect
//! loop re-dials `ws…?id=<uuid>` with capped exponential backoff so the
//! egress can re-bind the session inside its grace window.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::codec::{
    decode_dns_response, ConnectTarget, DnsQuery, HttpRequestMeta, HttpResponseMeta, RecordType,
    SocketEndpoint, UdpPacket,
};
use crate::config::TunnelConfig;
use crate::control;
use crate::error::{MuxError, Result};
use crate::protocol::{Frame, MessageType};
use crate::transport::{InboundHandler, Link, LinkEvent};

/// Consumer-side channel depth per stream.
const STREAM_CHANNEL_CAPACITY: usize = 256;

/// Slice size for whole-body uploads.
const UPLOAD_CHUNK: usize = 64 * 1024;

/// First reconnect delay; doubles up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect delay cap.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Monotonic stream-id allocator.
///
/// Ids live in `[1, 2^32 - 1]`; the wrap skips 0, which addresses
/// heartbeats and control traffic. By the time the allocator wraps, every
/// earlier stream has long been terminated by the pending reaper and the
/// session grace window.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    /// Start allocating at 1.
    pub fn new() -> Self {
        Self::with_start(1)
    }

    /// Start allocating at an arbitrary nonzero id.
    pub fn with_start(start: u32) -> Self {
        Self {
            next: AtomicU32::new(start.max(1)),
        }
    }

    /// Allocate the next id.
    pub fn alloc(&self) -> u32 {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(if n == u32::MAX { 1 } else { n + 1 })
            })
            .expect("fetch_update closure always returns Some")
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// One pending-table entry: the reply channel plus the optional data
/// channel, tagged by stream class.
enum PendingKind {
    Tcp {
        ack: Option<oneshot::Sender<Result<()>>>,
        data: mpsc::Sender<Result<Bytes>>,
    },
    Udp {
        ack: Option<oneshot::Sender<Result<SocketEndpoint>>>,
        data: mpsc::Sender<UdpPacket>,
    },
    Dns {
        reply: Option<oneshot::Sender<Result<Vec<String>>>>,
    },
    Http {
        reply: Option<oneshot::Sender<Result<HttpResponseMeta>>>,
        body: mpsc::Sender<Result<Bytes>>,
    },
}

struct Pending {
    kind: PendingKind,
    created_at: Instant,
}

struct ClientInner {
    link: Link,
    config: TunnelConfig,
    uuid: String,
    started_at: Instant,
    ids: IdAllocator,
    pending: Mutex<HashMap<u32, Pending>>,
    tombstones: Mutex<HashSet<u32>>,
    closed: AtomicBool,
}

/// Initiator peer over one transport session.
#[derive(Clone)]
pub struct TunnelClient {
    inner: Arc<ClientInner>,
}

impl TunnelClient {
    /// Dial `ws[s]://host:port/path` and start the session.
    pub async fn connect(url: &str, config: TunnelConfig) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| MuxError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(MuxError::InvalidUrl(format!(
                "transport URL must be ws or wss, got {}",
                parsed.scheme()
            )));
        }
        let (socket, _) = connect_async(url).await?;
        let client = Self::from_socket(socket, config)?;
        client.spawn_reconnect_loop(parsed);
        Ok(client)
    }

    /// Start a session over an already-established socket.
    ///
    /// No reconnect loop is installed; the embedder owns redial policy.
    pub fn from_socket<S>(socket: WebSocketStream<S>, config: TunnelConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;
        let inner = Arc::new(ClientInner {
            link: Link::new(config.clone()),
            config,
            uuid: Uuid::new_v4().simple().to_string(),
            started_at: Instant::now(),
            ids: IdAllocator::new(),
            pending: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });
        let handler: Arc<dyn InboundHandler> = Arc::new(ClientHandler(inner.clone()));
        inner.link.attach(socket, handler)?;
        let _ = inner.link.send_text(format!("SET UUID {}", inner.uuid));

        let client = Self { inner };
        client.spawn_reaper();
        client.spawn_event_watch();
        Ok(client)
    }

    /// The 32-character session identity announced to the egress.
    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    /// The underlying transport link.
    pub fn link(&self) -> &Link {
        &self.inner.link
    }

    /// In-flight stream count.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Open a tunneled TCP connection to `(host, port)` on the egress
    /// network.
    pub async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpTunnel> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (data_tx, data_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let id = self.inner.register(PendingKind::Tcp {
            ack: Some(ack_tx),
            data: data_tx,
        })?;
        if let Err(e) = self.inner.link.send(
            MessageType::TcpConnect,
            id,
            ConnectTarget::new(host, port).encode(),
        ) {
            self.inner.discard(id);
            return Err(e);
        }
        match tokio::time::timeout(self.inner.config.connect_timeout, ack_rx).await {
            Err(_) => {
                self.inner.close_stream(id, Some(MessageType::TcpClose));
                Err(MuxError::Timeout("TCP connect"))
            }
            Ok(Err(_)) => Err(MuxError::ConnectionClosed),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Ok(Ok(()))) => Ok(TcpTunnel {
                inner: self.inner.clone(),
                id,
                rx: data_rx,
            }),
        }
    }

    /// Allocate a tunneled UDP socket on the egress network.
    pub async fn bind_udp(&self) -> Result<UdpTunnel> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (data_tx, data_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let id = self.inner.register(PendingKind::Udp {
            ack: Some(ack_tx),
            data: data_tx,
        })?;
        // Host and port are ignored by the egress, which always binds an
        // ephemeral port on all interfaces.
        if let Err(e) = self.inner.link.send(
            MessageType::UdpBind,
            id,
            SocketEndpoint::new("", 0).encode(),
        ) {
            self.inner.discard(id);
            return Err(e);
        }
        match tokio::time::timeout(self.inner.config.connect_timeout, ack_rx).await {
            Err(_) => {
                self.inner.close_stream(id, Some(MessageType::UdpClose));
                Err(MuxError::Timeout("UDP bind"))
            }
            Ok(Err(_)) => Err(MuxError::ConnectionClosed),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Ok(Ok(local))) => Ok(UdpTunnel {
                inner: self.inner.clone(),
                id,
                local,
                rx: data_rx,
            }),
        }
    }

    /// Resolve a name on the egress network.
    pub async fn query_dns(&self, name: &str, record_type: RecordType) -> Result<Vec<String>> {
        let query = DnsQuery::new(name, record_type)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = self.inner.register(PendingKind::Dns {
            reply: Some(reply_tx),
        })?;
        if let Err(e) = self
            .inner
            .link
            .send(MessageType::DnsQuery, id, query.encode())
        {
            self.inner.discard(id);
            return Err(e);
        }
        match tokio::time::timeout(self.inner.config.dns_query_timeout, reply_rx).await {
            Err(_) => {
                // DNS has no close message; the egress reaps by its own
                // deadline.
                self.inner.discard(id);
                Err(MuxError::Timeout("DNS query"))
            }
            Ok(Err(_)) => Err(MuxError::ConnectionClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// Fetch an HTTP URL through the egress, streaming the response body.
    ///
    /// The body channel is installed before `HTTP_REQUEST` is sent, so
    /// chunks arriving concurrently with the response metadata are never
    /// lost. An optional whole request body is chunked onto the wire and
    /// terminated with `HTTP_BODY_END`.
    pub async fn fetch_http(
        &self,
        request: HttpRequestMeta,
        body: Option<Bytes>,
    ) -> Result<HttpFetch> {
        let url = Url::parse(&request.url).map_err(|e| MuxError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MuxError::InvalidUrl(format!(
                "fetch URL must be http or https, got {}",
                url.scheme()
            )));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let id = self.inner.register(PendingKind::Http {
            reply: Some(reply_tx),
            body: body_tx,
        })?;
        if let Err(e) = self
            .inner
            .link
            .send(MessageType::HttpRequest, id, request.encode())
        {
            self.inner.discard(id);
            return Err(e);
        }

        if let Some(data) = body {
            let gauge = self.inner.link.gauge();
            let limit = self.inner.config.max_ws_buffered_http;
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + UPLOAD_CHUNK).min(data.len());
                gauge.wait_below(limit).await;
                if let Err(e) =
                    self.inner
                        .link
                        .send(MessageType::HttpBodyChunk, id, data.slice(offset..end))
                {
                    self.inner.abort_http(id, "request body send failed");
                    return Err(e);
                }
                offset = end;
            }
            if let Err(e) = self.inner.link.send(MessageType::HttpBodyEnd, id, Bytes::new()) {
                self.inner.abort_http(id, "request body send failed");
                return Err(e);
            }
        }

        match tokio::time::timeout(self.inner.config.fetch_await_timeout, reply_rx).await {
            Err(_) => {
                self.inner.abort_http(id, "HTTP response await timed out");
                Err(MuxError::Timeout("HTTP fetch"))
            }
            Ok(Err(_)) => Err(MuxError::ConnectionClosed),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Ok(Ok(meta))) => Ok(HttpFetch {
                meta,
                rx: body_rx,
            }),
        }
    }

    /// Abort one in-flight stream, sending its terminal frame.
    pub fn abort(&self, id: u32) {
        let Some(pending) = self.inner.take_pending(id) else {
            return;
        };
        self.inner.tombstone(id);
        match &pending.kind {
            PendingKind::Tcp { .. } => {
                let _ = self.inner.link.send(MessageType::TcpClose, id, Bytes::new());
            }
            PendingKind::Udp { .. } => {
                let _ = self.inner.link.send(MessageType::UdpClose, id, Bytes::new());
            }
            PendingKind::Dns { .. } => {}
            PendingKind::Http { .. } => {
                let _ = self.inner.link.send_frame(Frame::error(id, "aborted"));
            }
        }
        fail_pending(pending, || MuxError::Upstream("aborted".into()));
    }

    /// Close the session: reject every pending stream and shut the link.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.reject_all();
        self.inner.link.close();
    }

    fn spawn_reaper(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let tick = inner
                .config
                .pending_sweep_max_age
                .min(Duration::from_secs(30))
                .max(Duration::from_millis(20));
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                if inner.closed.load(Ordering::Acquire) {
                    return;
                }
                inner.sweep_stale();
            }
        });
    }

    fn spawn_event_watch(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut events = inner.link.subscribe();
            loop {
                use tokio::sync::broadcast::error::RecvError;
                match events.recv().await {
                    Ok(LinkEvent::Disconnect) | Ok(LinkEvent::Timeout) => inner.reject_all(),
                    Ok(LinkEvent::Close) => {
                        inner.reject_all();
                        return;
                    }
                    Ok(LinkEvent::Connect) => {}
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                }
            }
        });
    }

    fn spawn_reconnect_loop(&self, url: Url) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut events = inner.link.subscribe();
            loop {
                use tokio::sync::broadcast::error::RecvError;
                match events.recv().await {
                    Ok(LinkEvent::Disconnect) => {
                        if !reconnect_with_backoff(&inner, &url).await {
                            return;
                        }
                    }
                    Ok(LinkEvent::Close) => return,
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                }
            }
        });
    }
}

async fn reconnect_with_backoff(inner: &Arc<ClientInner>, url: &Url) -> bool {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if inner.closed.load(Ordering::Acquire) {
            return false;
        }
        tokio::time::sleep(backoff).await;

        let mut target = url.clone();
        target.query_pairs_mut().append_pair("id", &inner.uuid);
        match connect_async(target.as_str()).await {
            Ok((socket, _)) => {
                let handler: Arc<dyn InboundHandler> = Arc::new(ClientHandler(inner.clone()));
                if inner.link.attach(socket, handler).is_err() {
                    return false;
                }
                let _ = inner.link.send_text(format!("SET UUID {}", inner.uuid));
                info!("transport reconnected");
                return true;
            }
            Err(e) => {
                warn!("reconnect attempt failed: {e}");
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

impl ClientInner {
    fn register(&self, kind: PendingKind) -> Result<u32> {
        let mut pending = self.pending.lock().unwrap();
        if pending.len() >= self.config.max_pending_requests {
            return Err(MuxError::PendingTableFull);
        }
        let id = self.ids.alloc();
        pending.insert(
            id,
            Pending {
                kind,
                created_at: Instant::now(),
            },
        );
        Ok(id)
    }

    fn take_pending(&self, id: u32) -> Option<Pending> {
        self.pending.lock().unwrap().remove(&id)
    }

    /// Drop an entry without emitting any frame (send never went out, or
    /// the protocol has no terminal for this class).
    fn discard(&self, id: u32) {
        self.take_pending(id);
        self.tombstone(id);
    }

    /// Remove an entry and emit its terminal frame, once.
    fn close_stream(&self, id: u32, terminal: Option<MessageType>) {
        if self.take_pending(id).is_none() {
            return;
        }
        self.tombstone(id);
        if let Some(msg_type) = terminal {
            let _ = self.link.send(msg_type, id, Bytes::new());
        }
    }

    fn abort_http(&self, id: u32, reason: &str) {
        if self.take_pending(id).is_none() {
            return;
        }
        self.tombstone(id);
        let _ = self.link.send_frame(Frame::error(id, reason));
    }

    fn reject_all(&self) {
        let drained: Vec<(u32, Pending)> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        warn!("rejecting {} pending streams: connection closed", drained.len());
        for (id, pending) in drained {
            self.tombstone(id);
            fail_pending(pending, || MuxError::ConnectionClosed);
        }
    }

    fn sweep_stale(&self) {
        let max_age = self.config.pending_sweep_max_age;
        let stale: Vec<(u32, Pending)> = {
            let mut pending = self.pending.lock().unwrap();
            let ids: Vec<u32> = pending
                .iter()
                .filter(|(_, p)| p.created_at.elapsed() > max_age)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        for (id, pending) in stale {
            warn!("reaping stale pending stream {id}");
            self.tombstone(id);
            match &pending.kind {
                PendingKind::Tcp { .. } => {
                    let _ = self.link.send(MessageType::TcpClose, id, Bytes::new());
                }
                PendingKind::Udp { .. } => {
                    let _ = self.link.send(MessageType::UdpClose, id, Bytes::new());
                }
                PendingKind::Dns { .. } => {}
                PendingKind::Http { .. } => {
                    let _ = self.link.send_frame(Frame::error(id, "request reaped"));
                }
            }
            fail_pending(pending, || MuxError::Timeout("pending request"));
        }
    }

    fn tombstone(&self, id: u32) {
        let mut tombstones = self.tombstones.lock().unwrap();
        if tombstones.len() >= 4096 {
            tombstones.clear();
        }
        tombstones.insert(id);
    }

    fn tombstoned(&self, id: u32) -> bool {
        self.tombstones.lock().unwrap().contains(&id)
    }

    /// A reply frame for a stream this client has never issued: make the
    /// peer clean up, once.
    fn reply_close_unknown(&self, id: u32, counterpart: Option<MessageType>) {
        if self.tombstoned(id) {
            return;
        }
        self.tombstone(id);
        if let Some(msg_type) = counterpart {
            debug!("stream {id}: reply for unknown stream; sending {msg_type:?}");
            let _ = self.link.send(msg_type, id, Bytes::new());
        }
    }
}

impl control::ControlHost for ClientInner {
    fn role(&self) -> &'static str {
        "initiator"
    }

    fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn stream_stats(&self) -> serde_json::Value {
        serde_json::json!({ "pending": self.pending.lock().unwrap().len() })
    }
}

fn fail_pending(pending: Pending, make_err: impl Fn() -> MuxError) {
    match pending.kind {
        PendingKind::Tcp { ack, data } => {
            if let Some(tx) = ack {
                let _ = tx.send(Err(make_err()));
            }
            let _ = data.try_send(Err(make_err()));
        }
        PendingKind::Udp { ack, data } => {
            if let Some(tx) = ack {
                let _ = tx.send(Err(make_err()));
            }
            drop(data); // receivers observe a clean end; UDP is lossy
        }
        PendingKind::Dns { reply } => {
            if let Some(tx) = reply {
                let _ = tx.send(Err(make_err()));
            }
        }
        PendingKind::Http { reply, body } => {
            if let Some(tx) = reply {
                let _ = tx.send(Err(make_err()));
            }
            let _ = body.try_send(Err(make_err()));
        }
    }
}

struct ClientHandler(Arc<ClientInner>);

#[async_trait]
impl InboundHandler for ClientHandler {
    async fn on_frame(&self, frame: Frame) {
        let inner = &self.0;
        let id = frame.resource_id;
        match frame.msg_type {
            MessageType::TcpConnectAck => {
                let ack = {
                    let mut pending = inner.pending.lock().unwrap();
                    match pending.get_mut(&id).map(|p| &mut p.kind) {
                        Some(PendingKind::Tcp { ack, .. }) => Some(ack.take()),
                        Some(_) => Some(None),
                        None => None,
                    }
                };
                match ack {
                    Some(Some(tx)) => {
                        let _ = tx.send(Ok(()));
                    }
                    Some(None) => debug!("stream {id}: duplicate TCP_CONNECT_ACK"),
                    None => inner.reply_close_unknown(id, Some(MessageType::TcpClose)),
                }
            }

            MessageType::TcpData => {
                let tx = {
                    let pending = inner.pending.lock().unwrap();
                    match pending.get(&id).map(|p| &p.kind) {
                        Some(PendingKind::Tcp { data, .. }) => Some(data.clone()),
                        _ => None,
                    }
                };
                match tx {
                    Some(tx) => {
                        if tx.send(Ok(frame.payload)).await.is_err() {
                            // Consumer dropped the stream; tear it down.
                            inner.close_stream(id, Some(MessageType::TcpClose));
                        }
                    }
                    None => inner.reply_close_unknown(id, Some(MessageType::TcpClose)),
                }
            }

            MessageType::TcpClose => {
                if let Some(pending) = inner.take_pending(id) {
                    inner.tombstone(id);
                    // An unresolved awaiter learns the stream died; the
                    // data channel closes cleanly.
                    if let PendingKind::Tcp { ack: Some(tx), .. } = pending.kind {
                        let _ = tx.send(Err(MuxError::ConnectionClosed));
                    }
                } else {
                    inner.tombstone(id);
                }
            }

            MessageType::UdpBindAck => {
                let ack = {
                    let mut pending = inner.pending.lock().unwrap();
                    match pending.get_mut(&id).map(|p| &mut p.kind) {
                        Some(PendingKind::Udp { ack, .. }) => Some(ack.take()),
                        Some(_) => Some(None),
                        None => None,
                    }
                };
                match ack {
                    Some(Some(tx)) => {
                        let _ = tx.send(SocketEndpoint::decode(&frame.payload));
                    }
                    Some(None) => debug!("stream {id}: duplicate UDP_BIND_ACK"),
                    None => inner.reply_close_unknown(id, Some(MessageType::UdpClose)),
                }
            }

            MessageType::UdpData => {
                let tx = {
                    let pending = inner.pending.lock().unwrap();
                    match pending.get(&id).map(|p| &p.kind) {
                        Some(PendingKind::Udp { data, .. }) => Some(data.clone()),
                        _ => None,
                    }
                };
                match tx {
                    Some(tx) => match UdpPacket::decode(frame.payload) {
                        Ok(packet) => {
                            if tx.send(packet).await.is_err() {
                                inner.close_stream(id, Some(MessageType::UdpClose));
                            }
                        }
                        Err(e) => debug!("stream {id}: dropping bad datagram frame: {e}"),
                    },
                    None => inner.reply_close_unknown(id, Some(MessageType::UdpClose)),
                }
            }

            MessageType::UdpClose => {
                if let Some(pending) = inner.take_pending(id) {
                    inner.tombstone(id);
                    if let PendingKind::Udp { ack: Some(tx), .. } = pending.kind {
                        let _ = tx.send(Err(MuxError::ConnectionClosed));
                    }
                } else {
                    inner.tombstone(id);
                }
            }

            MessageType::DnsResponse => {
                let reply = {
                    let mut pending = inner.pending.lock().unwrap();
                    match pending.remove(&id).map(|p| p.kind) {
                        Some(PendingKind::Dns { reply }) => reply,
                        Some(_) => None,
                        None => None,
                    }
                };
                match reply {
                    Some(tx) => {
                        inner.tombstone(id);
                        let _ = tx.send(decode_dns_response(&frame.payload));
                    }
                    // DNS has no close message; a stray response is dropped.
                    None => debug!("stream {id}: dropping stray DNS response"),
                }
            }

            MessageType::HttpResponse => {
                let reply = {
                    let mut pending = inner.pending.lock().unwrap();
                    match pending.get_mut(&id).map(|p| &mut p.kind) {
                        Some(PendingKind::Http { reply, .. }) => Some(reply.take()),
                        Some(_) => Some(None),
                        None => None,
                    }
                };
                match reply {
                    Some(Some(tx)) => match HttpResponseMeta::decode(&frame.payload) {
                        Ok(meta) => {
                            let _ = tx.send(Ok(meta));
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            inner.abort_http(id, "bad response metadata");
                        }
                    },
                    Some(None) => debug!("stream {id}: duplicate HTTP_RESPONSE"),
                    None => inner.reply_close_unknown(id, Some(MessageType::HttpBodyEnd)),
                }
            }

            MessageType::HttpBodyChunk => {
                let tx = {
                    let pending = inner.pending.lock().unwrap();
                    match pending.get(&id).map(|p| &p.kind) {
                        Some(PendingKind::Http { body, .. }) => Some(body.clone()),
                        _ => None,
                    }
                };
                match tx {
                    Some(tx) => {
                        if tx.send(Ok(frame.payload)).await.is_err() {
                            inner.abort_http(id, "response body consumer dropped");
                        }
                    }
                    None => inner.reply_close_unknown(id, Some(MessageType::HttpBodyEnd)),
                }
            }

            MessageType::HttpBodyEnd => {
                if let Some(pending) = inner.take_pending(id) {
                    inner.tombstone(id);
                    if let PendingKind::Http { reply: Some(tx), .. } = pending.kind {
                        let _ = tx.send(Err(MuxError::Upstream(
                            "body ended before response metadata".into(),
                        )));
                    }
                } else {
                    inner.tombstone(id);
                }
            }

            MessageType::Error => {
                let message = String::from_utf8_lossy(&frame.payload).to_string();
                if let Some(pending) = inner.take_pending(id) {
                    debug!("stream {id}: peer error: {message}");
                    inner.tombstone(id);
                    fail_pending(pending, || MuxError::Upstream(message.clone()));
                }
            }

            // Requests are egress-addressed; on this side they are a
            // protocol anomaly.
            MessageType::TcpConnect
            | MessageType::UdpBind
            | MessageType::DnsQuery
            | MessageType::HttpRequest => {
                warn!(
                    "stream {id}: dropping request frame {:?} on initiator side",
                    frame.msg_type
                );
            }

            // Heartbeats are consumed by the link and never reach here.
            MessageType::Heartbeat => {}
        }
    }

    async fn on_text(&self, text: String) {
        match serde_json::from_str::<serde_json::Value>(&text) {
            // Command replies from the egress; surface them to the logs.
            Ok(value) if value.get("success").is_some() => {
                debug!("control reply: {value}");
            }
            _ => {
                if let Some(reply) = control::handle_line(&text, &*self.0) {
                    let _ = self.0.link.send_text(reply);
                }
            }
        }
    }
}

/// A tunneled TCP connection.
pub struct TcpTunnel {
    inner: Arc<ClientInner>,
    id: u32,
    rx: mpsc::Receiver<Result<Bytes>>,
}

impl TcpTunnel {
    /// The stream id on the wire.
    pub fn resource_id(&self) -> u32 {
        self.id
    }

    /// Send bytes to the remote peer, yielding under backpressure.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        let gauge = self.inner.link.gauge();
        gauge.wait_below(self.inner.config.max_ws_buffered).await;
        self.inner.link.send(MessageType::TcpData, self.id, data)
    }

    /// Receive the next slice; `None` means the stream closed cleanly.
    pub async fn recv(&mut self) -> Option<Result<Bytes>> {
        self.rx.recv().await
    }

    /// Close the stream, notifying the egress.
    pub fn close(&self) {
        self.inner.close_stream(self.id, Some(MessageType::TcpClose));
    }
}

impl Drop for TcpTunnel {
    fn drop(&mut self) {
        self.inner.close_stream(self.id, Some(MessageType::TcpClose));
    }
}

/// A tunneled UDP socket.
pub struct UdpTunnel {
    inner: Arc<ClientInner>,
    id: u32,
    local: SocketEndpoint,
    rx: mpsc::Receiver<UdpPacket>,
}

impl UdpTunnel {
    /// The stream id on the wire.
    pub fn resource_id(&self) -> u32 {
        self.id
    }

    /// The address the egress bound for this socket.
    pub fn local_endpoint(&self) -> &SocketEndpoint {
        &self.local
    }

    /// Send one datagram to `(host, port)` on the egress network.
    pub async fn send_to(&self, data: Bytes, host: &str, port: u16) -> Result<()> {
        let packet = UdpPacket::new(SocketEndpoint::new(host, port), data)?;
        let gauge = self.inner.link.gauge();
        gauge.wait_below(self.inner.config.max_ws_buffered).await;
        self.inner
            .link
            .send(MessageType::UdpData, self.id, packet.encode())
    }

    /// Receive the next datagram with its sender address.
    pub async fn recv(&mut self) -> Option<UdpPacket> {
        self.rx.recv().await
    }

    /// Release the socket, notifying the egress.
    pub fn close(&self) {
        self.inner.close_stream(self.id, Some(MessageType::UdpClose));
    }
}

impl Drop for UdpTunnel {
    fn drop(&mut self) {
        self.inner.close_stream(self.id, Some(MessageType::UdpClose));
    }
}

/// A fetched HTTP response with a streaming body.
pub struct HttpFetch {
    /// Status, headers, final URL, and the body flag.
    pub meta: HttpResponseMeta,
    rx: mpsc::Receiver<Result<Bytes>>,
}

impl HttpFetch {
    /// Receive the next body slice; `None` means the body ended.
    pub async fn chunk(&mut self) -> Option<Result<Bytes>> {
        self.rx.recv().await
    }

    /// Drain the remaining body into one buffer.
    pub async fn read_to_end(mut self) -> Result<Bytes> {
        let mut out = Vec::new();
        while let Some(chunk) = self.chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(out))
    }
}
