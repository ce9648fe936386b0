//! Egress-side WebSocket server.
//!
//! Accepts upgrades on the configured listen address, enforces the
//! connect path, pulls an optional `?id=<uuid>` out of the upgrade URL,
//! and hands the socket to the session registry: absence of `id` means a
//! new session, presence means a reattach that fails for unknown ids.
//!
//! Fatal startup failures (bind error, invalid config) surface as `Err`
//! from [`TunnelServer::run`]; callers exit non-zero on them.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::transport::SessionRegistry;

/// Egress peer: listener plus session registry.
pub struct TunnelServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    listener: TcpListener,
}

impl TunnelServer {
    /// Validate the configuration and bind the listener.
    ///
    /// Bind failure here is the fatal-startup case; nothing is retried.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let registry = SessionRegistry::new(config.tunnel.clone(), config.max_sessions);
        let listener = TcpListener::bind(config.listen_addr).await?;
        Ok(Self {
            config,
            registry,
            listener,
        })
    }

    /// The session registry, for introspection and tests.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// The bound listen address (useful when configured with port 0).
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve upgrades until the listener fails.
    pub async fn run(&self) -> Result<()> {
        info!(
            "listening on ws://{}{}",
            self.local_addr()?,
            self.config.connect_path
        );

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            debug!("connection from {peer}");
            let registry = self.registry.clone();
            let connect_path = self.config.connect_path.clone();
            tokio::spawn(async move {
                handle_upgrade(registry, connect_path, stream).await;
            });
        }
    }
}

async fn handle_upgrade(registry: Arc<SessionRegistry>, connect_path: String, stream: TcpStream) {
    let mut session_id: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        if req.uri().path() != connect_path {
            let mut not_found = ErrorResponse::new(Some("not found".to_string()));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        session_id = req
            .uri()
            .query()
            .and_then(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == "id")
                    .map(|(_, value)| value.into_owned())
            });
        Ok(resp)
    };

    let socket = match accept_hdr_async(stream, callback).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("WebSocket handshake failed: {e}");
            return;
        }
    };

    match registry.attach_socket(session_id.as_deref(), socket).await {
        Ok(session) => {
            if let Some(uuid) = session.uuid() {
                debug!("socket bound to session {uuid}");
            }
        }
        Err(e) => {
            // Reject-by-drop: unknown ids and capacity overruns close the
            // fresh socket without touching existing sessions.
            warn!("rejecting socket: {e}");
        }
    }
}
