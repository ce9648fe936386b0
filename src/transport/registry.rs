//! Egress session registry.
//!
//! A session binds one transport link to one set of stream engines and
//! stays alive across socket drops for the grace window. The initiator
//! publishes its identity with `SET UUID`; from then on a fresh socket
//! whose upgrade URL carries `?id=<uuid>` re-binds the same session and
//! its live streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::control;
use crate::engine::Demux;
use crate::error::{MuxError, Result};
use crate::protocol::Frame;

use super::link::{InboundHandler, Link, LinkEvent};

/// One egress-side tunnel session.
pub struct Session {
    link: Link,
    demux: Demux,
    uuid: Mutex<Option<String>>,
    log_level: Mutex<Option<String>>,
    reconnects: AtomicU32,
    started_at: Instant,
    registry: Weak<SessionRegistry>,
    self_weak: Weak<Session>,
}

impl Session {
    fn new(config: TunnelConfig, registry: Weak<SessionRegistry>) -> Arc<Self> {
        let link = Link::new(config.clone());
        Arc::new_cyclic(|self_weak| Session {
            demux: Demux::new(link.clone(), config),
            link,
            uuid: Mutex::new(None),
            log_level: Mutex::new(None),
            reconnects: AtomicU32::new(0),
            started_at: Instant::now(),
            registry,
            self_weak: self_weak.clone(),
        })
    }

    /// The session's transport link.
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Identity published by the initiator, once `SET UUID` has arrived.
    pub fn uuid(&self) -> Option<String> {
        self.uuid.lock().unwrap().clone()
    }

    /// How many times a fresh socket re-bound this session.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::Acquire)
    }

    /// Last log level requested over the control channel, if any.
    pub fn requested_log_level(&self) -> Option<String> {
        self.log_level.lock().unwrap().clone()
    }
}

fn handler_for(session: &Arc<Session>) -> Arc<dyn InboundHandler> {
    Arc::new(SessionHandler {
        session: session.clone(),
    })
}

impl control::ControlHost for Session {
    fn role(&self) -> &'static str {
        "egress"
    }

    fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn set_uuid(&self, uuid: &str) -> bool {
        *self.uuid.lock().unwrap() = Some(uuid.to_string());
        if let (Some(registry), Some(me)) = (self.registry.upgrade(), self.self_weak.upgrade()) {
            registry.index_uuid(uuid, me);
        }
        true
    }

    fn set_log_level(&self, level: &str) -> bool {
        *self.log_level.lock().unwrap() = Some(level.to_string());
        info!("control channel requested log level {level}");
        true
    }

    fn stream_stats(&self) -> serde_json::Value {
        self.demux.stats()
    }
}

struct SessionHandler {
    session: Arc<Session>,
}

#[async_trait]
impl InboundHandler for SessionHandler {
    async fn on_frame(&self, frame: Frame) {
        self.session.demux.handle_frame(frame).await;
    }

    async fn on_text(&self, text: String) {
        if let Some(reply) = control::handle_line(&text, &*self.session) {
            let _ = self.session.link.send_text(reply);
        }
    }
}

/// Keeps disconnected sessions addressable for the grace window and
/// routes `?id=<uuid>` reattaches back to them.
pub struct SessionRegistry {
    config: TunnelConfig,
    max_sessions: usize,
    by_uuid: Mutex<HashMap<String, Arc<Session>>>,
    active: AtomicUsize,
    self_weak: Weak<SessionRegistry>,
}

impl SessionRegistry {
    /// Create a registry.
    pub fn new(config: TunnelConfig, max_sessions: usize) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            config,
            max_sessions,
            by_uuid: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            self_weak: self_weak.clone(),
        })
    }

    /// Sessions currently alive (attached or inside their grace window).
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Look up a session by its published identity.
    pub fn get(&self, uuid: &str) -> Option<Arc<Session>> {
        self.by_uuid.lock().unwrap().get(uuid).cloned()
    }

    /// Bind an upgraded socket to a session.
    ///
    /// With `session_id` present this is a reattach and fails for unknown
    /// ids; otherwise a new session is created, subject to the capacity
    /// limit.
    pub async fn attach_socket<S>(
        &self,
        session_id: Option<&str>,
        socket: WebSocketStream<S>,
    ) -> Result<Arc<Session>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match session_id {
            Some(id) => self.reconnect(id, socket),
            None => self.new_session(socket),
        }
    }

    /// Re-bind an existing session to a fresh socket.
    pub fn reconnect<S>(&self, session_id: &str, socket: WebSocketStream<S>) -> Result<Arc<Session>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = self
            .get(session_id)
            .ok_or_else(|| MuxError::UnknownSession(session_id.to_string()))?;
        session.link.attach(socket, handler_for(&session))?;
        let count = session.reconnects.fetch_add(1, Ordering::AcqRel) + 1;
        info!("session {session_id} reattached (reconnect #{count})");
        Ok(session)
    }

    fn new_session<S>(&self, socket: WebSocketStream<S>) -> Result<Arc<Session>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.active.load(Ordering::Acquire) >= self.max_sessions {
            warn!("rejecting session: limit of {} reached", self.max_sessions);
            return Err(MuxError::SessionLimit);
        }
        let registry = self
            .self_weak
            .upgrade()
            .expect("registry outlives its borrows");
        self.active.fetch_add(1, Ordering::AcqRel);

        let session = Session::new(self.config.clone(), self.self_weak.clone());
        session.link.attach(socket, handler_for(&session))?;
        tokio::spawn(session_lifecycle(registry, session.clone()));
        Ok(session)
    }

    fn index_uuid(&self, uuid: &str, session: Arc<Session>) {
        self.by_uuid
            .lock()
            .unwrap()
            .insert(uuid.to_string(), session);
    }

    fn forget(&self, session: &Session) {
        if let Some(uuid) = session.uuid() {
            self.by_uuid.lock().unwrap().remove(&uuid);
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Watches one session's link and destroys its streams when the grace
/// window elapses or the link closes.
async fn session_lifecycle(registry: Arc<SessionRegistry>, session: Arc<Session>) {
    let mut events = session.link.subscribe();
    loop {
        match events.recv().await {
            Ok(LinkEvent::Timeout) | Ok(LinkEvent::Close) => break,
            Ok(LinkEvent::Connect) | Ok(LinkEvent::Disconnect) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(
        "session {} destroyed after {:?}",
        session.uuid().unwrap_or_else(|| "<anonymous>".into()),
        session.started_at.elapsed()
    );
    session.demux.shutdown_all().await;
    session.link.close();
    registry.forget(&session);
}
