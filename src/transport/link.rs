//! Transport link: socket ownership, send queue, heartbeat, reconnect.
//!
//! The link is the single owner of the WebSocket. Everyone else sends
//! through `send(type, id, payload)`, which enqueues onto a bounded FIFO
//! drained by a dedicated writer task; engines never touch the socket.
//! The queue survives socket loss, so frames enqueued during the
//! reconnect grace window drain in order once a fresh socket is attached.
//!
//! Lifecycle events (`connect`, `disconnect`, `timeout`, `close`) are
//! published on a broadcast channel. `timeout` fires when the grace
//! window elapses without a reattach and means "destroy all streams".
//!
//! Each attached socket gets an epoch number; tasks from a superseded
//! socket observe the epoch change and exit, so at most one live socket
//! serves the link at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, trace, warn};

use crate::backpressure::BufferGauge;
use crate::config::TunnelConfig;
use crate::error::{MuxError, Result};
use crate::protocol::{Frame, MessageType};

/// Consumer of inbound traffic: decoded binary frames and text commands.
///
/// The link holds the handler only for the duration of an attached socket;
/// handlers hold the link by value. This keeps ownership acyclic per the
/// send-entry-point rule.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// One decoded binary frame. Heartbeats are consumed by the link and
    /// never reach the handler.
    async fn on_frame(&self, frame: Frame);

    /// One inbound text frame (control channel).
    async fn on_text(&self, text: String);
}

/// Connection state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No socket has been attached yet.
    Connecting,
    /// A socket is attached and live.
    Connected,
    /// The socket dropped; the grace window may still be running.
    Disconnected,
}

/// State-transition events published by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A socket was attached.
    Connect,
    /// The socket dropped; the grace window starts.
    Disconnect,
    /// The grace window elapsed without a reattach.
    Timeout,
    /// The link was closed locally.
    Close,
}

/// Shared handle to one transport link. Cheap to clone.
#[derive(Clone)]
pub struct Link {
    shared: Arc<Shared>,
}

struct Shared {
    config: TunnelConfig,
    queue: Mutex<VecDeque<Message>>,
    queue_notify: Notify,
    shutdown_notify: Notify,
    gauge: BufferGauge,
    state: Mutex<LinkState>,
    last_seen: Mutex<Instant>,
    events: broadcast::Sender<LinkEvent>,
    epoch: AtomicU64,
    closed: AtomicBool,
}

impl Link {
    /// Create a link with no socket attached.
    pub fn new(config: TunnelConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                config,
                queue: Mutex::new(VecDeque::new()),
                queue_notify: Notify::new(),
                shutdown_notify: Notify::new(),
                gauge: BufferGauge::new(),
                state: Mutex::new(LinkState::Connecting),
                last_seen: Mutex::new(Instant::now()),
                events,
                epoch: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue one binary frame.
    ///
    /// FIFO order is preserved across disconnects. When the queue is at
    /// capacity the new frame is dropped and logged; earlier frames are
    /// never displaced or reordered.
    pub fn send(&self, msg_type: MessageType, resource_id: u32, payload: Bytes) -> Result<()> {
        self.send_frame(Frame::new(msg_type, resource_id, payload))
    }

    /// Enqueue one pre-built frame.
    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        self.shared.enqueue(Message::Binary(frame.encode().to_vec()))
    }

    /// Enqueue one text frame (control channel).
    pub fn send_text(&self, text: String) -> Result<()> {
        self.shared.enqueue(Message::Text(text))
    }

    /// Frames currently waiting in the send queue.
    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Bytes enqueued but not yet handed to the socket.
    pub fn buffered_amount(&self) -> usize {
        self.shared.gauge.level()
    }

    /// The send-buffer gauge, for the engines' cooperative yields.
    pub fn gauge(&self) -> BufferGauge {
        self.shared.gauge.clone()
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        *self.shared.state.lock().unwrap()
    }

    /// Check whether a socket is attached and live.
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Subscribe to state-transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    /// Attach a socket and start its writer, reader, and heartbeat tasks.
    ///
    /// Replaces any previously attached socket; tasks serving the old one
    /// observe the epoch change and exit. The send queue starts draining
    /// immediately.
    pub fn attach<S>(&self, socket: WebSocketStream<S>, handler: Arc<dyn InboundHandler>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(MuxError::ConnectionClosed);
        }
        let epoch = self.shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut state = self.shared.state.lock().unwrap();
            *state = LinkState::Connected;
        }
        self.shared.touch();

        let (sink, stream) = socket.split();
        tokio::spawn(writer_loop(self.shared.clone(), sink, epoch));
        tokio::spawn(reader_loop(self.shared.clone(), stream, handler, epoch));
        tokio::spawn(heartbeat_loop(self.shared.clone(), epoch));

        // Wake tasks parked on the previous socket so they see the epoch.
        self.shared.queue_notify.notify_one();
        self.shared.shutdown_notify.notify_waiters();
        let _ = self.shared.events.send(LinkEvent::Connect);
        Ok(())
    }

    /// Close the link permanently: no further sends or attaches.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        *self.shared.state.lock().unwrap() = LinkState::Disconnected;
        self.shared.queue_notify.notify_one();
        self.shared.shutdown_notify.notify_waiters();
        let _ = self.shared.events.send(LinkEvent::Close);
    }

    #[cfg(test)]
    pub(crate) fn force_disconnect(&self) {
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        mark_disconnected(&self.shared, epoch);
    }
}

impl Shared {
    fn enqueue(&self, msg: Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::ConnectionClosed);
        }
        let size = message_len(&msg);
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.config.max_queue_size {
                drop(queue);
                error!(
                    "send queue full ({} frames); dropping new frame",
                    self.config.max_queue_size
                );
                return Err(MuxError::QueueFull);
            }
            queue.push_back(msg);
        }
        self.gauge.add(size);
        self.queue_notify.notify_one();
        Ok(())
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }
}

fn message_len(msg: &Message) -> usize {
    match msg {
        Message::Binary(data) => data.len(),
        Message::Text(text) => text.len(),
        _ => 0,
    }
}

/// Transition to `Disconnected` and arm the grace-window timer.
///
/// No-op when the epoch is stale (a newer socket took over) or the state
/// already is `Disconnected`.
fn mark_disconnected(shared: &Arc<Shared>, epoch: u64) {
    if shared.epoch.load(Ordering::Acquire) != epoch || shared.closed.load(Ordering::Acquire) {
        return;
    }
    {
        let mut state = shared.state.lock().unwrap();
        if *state == LinkState::Disconnected {
            return;
        }
        *state = LinkState::Disconnected;
    }
    debug!("transport disconnected; grace window armed");
    let _ = shared.events.send(LinkEvent::Disconnect);
    shared.queue_notify.notify_one();
    shared.shutdown_notify.notify_waiters();

    let grace = shared.config.reconnect_timeout;
    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if shared.closed.load(Ordering::Acquire)
            || shared.epoch.load(Ordering::Acquire) != epoch
        {
            return;
        }
        if *shared.state.lock().unwrap() == LinkState::Disconnected {
            warn!("grace window elapsed without reconnect");
            let _ = shared.events.send(LinkEvent::Timeout);
        }
    });
}

async fn writer_loop<S>(
    shared: Arc<Shared>,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    epoch: u64,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        if shared.epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        let next = shared.queue.lock().unwrap().pop_front();
        match next {
            Some(msg) => {
                let size = message_len(&msg);
                let result = sink.send(msg).await;
                shared.gauge.sub(size);
                if let Err(e) = result {
                    debug!("socket write failed: {e}");
                    mark_disconnected(&shared, epoch);
                    return;
                }
            }
            None => {
                tokio::select! {
                    _ = shared.queue_notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                }
            }
        }
    }
}

async fn reader_loop<S>(
    shared: Arc<Shared>,
    mut stream: SplitStream<WebSocketStream<S>>,
    handler: Arc<dyn InboundHandler>,
    epoch: u64,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        if shared.epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        let msg = tokio::select! {
            _ = shared.shutdown_notify.notified() => continue,
            // Periodic wake so a superseded reader on a silent socket
            // still observes the epoch change.
            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
            msg = stream.next() => msg,
        };
        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!("socket read failed: {e}");
                break;
            }
            None => break,
        };
        shared.touch();
        match msg {
            Message::Binary(data) => match Frame::decode(Bytes::from(data)) {
                Ok(frame) if frame.is_heartbeat() => {
                    // Liveness only. Never echoed, so two peers cannot
                    // enter a heartbeat ping-pong storm.
                    trace!("heartbeat received");
                }
                Ok(frame) => handler.on_frame(frame).await,
                Err(e) => warn!("dropping undecodable frame: {e}"),
            },
            Message::Text(text) => handler.on_text(text).await,
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
            Message::Frame(_) => {}
        }
    }
    mark_disconnected(&shared, epoch);
}

async fn heartbeat_loop(shared: Arc<Shared>, epoch: u64) {
    let tick = shared
        .config
        .heartbeat_interval
        .min(shared.config.heartbeat_timeout / 2)
        .max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // first tick completes immediately
    let mut last_beat = Instant::now();

    loop {
        interval.tick().await;
        if shared.epoch.load(Ordering::Acquire) != epoch
            || *shared.state.lock().unwrap() != LinkState::Connected
        {
            return;
        }
        if shared.idle_for() > shared.config.heartbeat_timeout {
            warn!("liveness watchdog expired; disconnecting socket");
            mark_disconnected(&shared, epoch);
            return;
        }
        if last_beat.elapsed() >= shared.config.heartbeat_interval {
            last_beat = Instant::now();
            let _ = shared.enqueue(Message::Binary(Frame::heartbeat().encode().to_vec()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_queue_link(max: usize) -> Link {
        Link::new(TunnelConfig {
            max_queue_size: max,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_new_link_is_connecting() {
        let link = Link::new(TunnelConfig::default());
        assert_eq!(link.state(), LinkState::Connecting);
        assert!(!link.is_connected());
        assert_eq!(link.queued_len(), 0);
    }

    #[tokio::test]
    async fn test_send_queues_while_unattached() {
        let link = Link::new(TunnelConfig::default());
        link.send(MessageType::TcpData, 1, Bytes::from_static(b"abc"))
            .unwrap();
        assert_eq!(link.queued_len(), 1);
        // Envelope (5) + payload (3) bytes are counted by the gauge.
        assert_eq!(link.buffered_amount(), 8);
    }

    #[tokio::test]
    async fn test_queue_bound_drops_new_frames_keeps_order() {
        let link = small_queue_link(5);
        for i in 0u32..5 {
            link.send(MessageType::TcpData, i + 1, Bytes::new()).unwrap();
        }
        // The overflowing frames are dropped, not the queued ones.
        for i in 0u32..3 {
            let result = link.send(MessageType::TcpData, 100 + i, Bytes::new());
            assert!(matches!(result, Err(MuxError::QueueFull)));
        }
        assert_eq!(link.queued_len(), 5);

        let queued: Vec<u32> = link
            .shared
            .queue
            .lock()
            .unwrap()
            .iter()
            .map(|msg| match msg {
                Message::Binary(data) => u32::from_be_bytes([data[1], data[2], data[3], data[4]]),
                _ => panic!("binary expected"),
            })
            .collect();
        assert_eq!(queued, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let link = Link::new(TunnelConfig::default());
        link.close();
        let result = link.send(MessageType::TcpData, 1, Bytes::new());
        assert!(matches!(result, Err(MuxError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_emits_close_event_once() {
        let link = Link::new(TunnelConfig::default());
        let mut events = link.subscribe();
        link.close();
        link.close();
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Close);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_grace_window_fires_timeout() {
        let link = Link::new(TunnelConfig {
            reconnect_timeout: Duration::from_millis(30),
            ..Default::default()
        });
        let mut events = link.subscribe();
        // Simulate an attached socket dropping.
        link.shared.epoch.fetch_add(1, Ordering::AcqRel);
        *link.shared.state.lock().unwrap() = LinkState::Connected;
        link.force_disconnect();

        assert_eq!(events.recv().await.unwrap(), LinkEvent::Disconnect);
        let event = tokio::time::timeout(Duration::from_millis(500), events.recv())
            .await
            .expect("timeout event expected")
            .unwrap();
        assert_eq!(event, LinkEvent::Timeout);
    }

    #[tokio::test]
    async fn test_text_frames_share_the_queue() {
        let link = Link::new(TunnelConfig::default());
        link.send_text("PING".to_string()).unwrap();
        link.send(MessageType::TcpData, 1, Bytes::new()).unwrap();
        assert_eq!(link.queued_len(), 2);
    }
}
