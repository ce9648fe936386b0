//! HTTP engine (egress side).
//!
//! Each `HTTP_REQUEST` spawns one fetch task holding a cancellation
//! handle. Streamed uploads arrive as `HTTP_BODY_CHUNK` frames and feed a
//! channel wrapped into the outgoing request body; the response streams
//! back as `HTTP_RESPONSE` metadata followed by body chunk frames and
//! exactly one `HTTP_BODY_END`. Transfer framing never crosses the
//! tunnel: chunks are opaque slices and `transfer-encoding` is stripped
//! from the metadata record.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::channel::mpsc as body_channel;
use futures::{SinkExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::Notify;
use tracing::{debug, warn};
use url::Url;

use crate::codec::{HttpRequestMeta, HttpResponseMeta};
use crate::config::TunnelConfig;
use crate::protocol::MessageType;
use crate::transport::Link;

use super::tcp::MAX_TOMBSTONES;

/// Buffered request-body chunks per stream.
const BODY_CHANNEL_CAPACITY: usize = 64;

type BodySink = body_channel::Sender<std::io::Result<Bytes>>;

struct HttpInner {
    link: Link,
    config: TunnelConfig,
    client: reqwest::Client,
    requests: Mutex<HashMap<u32, Arc<Notify>>>,
    body_sinks: Mutex<HashMap<u32, BodySink>>,
    tombstones: Mutex<HashSet<u32>>,
}

/// Egress-side HTTP fetcher.
#[derive(Clone)]
pub struct HttpEngine {
    inner: Arc<HttpInner>,
}

impl HttpEngine {
    /// Create the engine for one session's link.
    ///
    /// The client never decompresses: content-encoding is forwarded as-is
    /// so the initiator sees exactly what the origin sent.
    pub fn new(link: Link, config: TunnelConfig) -> Self {
        let client = reqwest::Client::builder()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .no_zstd()
            .build()
            .unwrap_or_else(|e| {
                warn!("HTTP client builder failed ({e}); using defaults");
                reqwest::Client::default()
            });
        Self {
            inner: Arc::new(HttpInner {
                link,
                config,
                client,
                requests: Mutex::new(HashMap::new()),
                body_sinks: Mutex::new(HashMap::new()),
                tombstones: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Live request count.
    pub fn len(&self) -> usize {
        self.inner.requests.lock().unwrap().len()
    }

    /// Check whether no requests are in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle `HTTP_REQUEST`: validate, register, and start the fetch.
    pub async fn fetch(&self, id: u32, payload: Bytes) {
        let meta = match HttpRequestMeta::decode(&payload) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("stream {id}: bad request payload: {e}");
                let _ = self.inner.link.send(
                    MessageType::Error,
                    id,
                    Bytes::from(format!("bad request payload: {e}")),
                );
                return;
            }
        };
        let url = match Url::parse(&meta.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            Ok(url) => {
                let _ = self.inner.link.send(
                    MessageType::Error,
                    id,
                    Bytes::from(format!("unsupported URL scheme: {}", url.scheme())),
                );
                return;
            }
            Err(e) => {
                let _ = self.inner.link.send(
                    MessageType::Error,
                    id,
                    Bytes::from(format!("invalid URL: {e}")),
                );
                return;
            }
        };
        if self.inner.requests.lock().unwrap().contains_key(&id) {
            warn!("stream {id}: duplicate HTTP_REQUEST ignored");
            return;
        }

        let cancel = Arc::new(Notify::new());
        self.inner.requests.lock().unwrap().insert(id, cancel.clone());

        // The body sink must exist before any HTTP_BODY_CHUNK can arrive.
        let body = if meta.has_body() {
            let (tx, rx) = body_channel::channel::<std::io::Result<Bytes>>(BODY_CHANNEL_CAPACITY);
            self.inner.body_sinks.lock().unwrap().insert(id, tx);
            Some(reqwest::Body::wrap_stream(rx))
        } else {
            None
        };

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_fetch(id, meta, url, body, cancel).await;
            engine.cleanup(id);
        });
    }

    async fn run_fetch(
        &self,
        id: u32,
        meta: HttpRequestMeta,
        url: Url,
        body: Option<reqwest::Body>,
        cancel: Arc<Notify>,
    ) {
        let method = match reqwest::Method::from_bytes(meta.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                let _ = self.inner.link.send(
                    MessageType::Error,
                    id,
                    Bytes::from(format!("invalid HTTP method: {}", meta.method)),
                );
                return;
            }
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &meta.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }

        let mut request = self
            .inner
            .client
            .request(method.clone(), url)
            .headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }

        let send = tokio::time::timeout(self.inner.config.fetch_timeout, request.send());
        let response = tokio::select! {
            _ = cancel.notified() => {
                debug!("stream {id}: fetch aborted");
                return;
            }
            result = send => match result {
                Err(_) => {
                    let _ = self.inner.link.send(
                        MessageType::Error,
                        id,
                        Bytes::from_static(b"HTTP fetch timed out"),
                    );
                    return;
                }
                Ok(Err(e)) => {
                    debug!("stream {id}: fetch failed: {e}");
                    let _ = self.inner.link.send(
                        MessageType::Error,
                        id,
                        Bytes::from(format!("HTTP fetch failed: {e}")),
                    );
                    return;
                }
                Ok(Ok(response)) => response,
            }
        };

        let status = response.status();
        let has_body = response_has_body(&method, status.as_u16());
        let response_meta = HttpResponseMeta {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers: response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        value.to_str().unwrap_or("").to_string(),
                    )
                })
                .collect(),
            url: response.url().to_string(),
            has_body,
        };
        let _ = self
            .inner
            .link
            .send(MessageType::HttpResponse, id, response_meta.encode());

        let clean = if has_body {
            self.stream_body(id, response, &cancel).await
        } else {
            true
        };
        if clean {
            let _ = self.inner.link.send(MessageType::HttpBodyEnd, id, Bytes::new());
        }
    }

    /// Relay the response body. Returns false when the stream ended with
    /// an `ERROR` frame or an abort, in which case no `HTTP_BODY_END`
    /// follows (the error is the terminal message).
    async fn stream_body(&self, id: u32, response: reqwest::Response, cancel: &Notify) -> bool {
        let mut stream = response.bytes_stream();
        let mut total: u64 = 0;
        let gauge = self.inner.link.gauge();
        let limit = self.inner.config.max_ws_buffered_http;

        loop {
            let chunk = tokio::select! {
                _ = cancel.notified() => return false,
                chunk = stream.next() => chunk,
            };
            match chunk {
                None => return true,
                Some(Err(e)) => {
                    let _ = self.inner.link.send(
                        MessageType::Error,
                        id,
                        Bytes::from(format!("HTTP body read failed: {e}")),
                    );
                    return false;
                }
                Some(Ok(chunk)) => {
                    total += chunk.len() as u64;
                    if total > self.inner.config.max_response_size {
                        let _ = self.inner.link.send(
                            MessageType::Error,
                            id,
                            Bytes::from_static(b"HTTP response exceeds size limit"),
                        );
                        return false;
                    }
                    tokio::select! {
                        _ = cancel.notified() => return false,
                        _ = gauge.wait_below(limit) => {}
                    }
                    let _ = self.inner.link.send(MessageType::HttpBodyChunk, id, chunk);
                }
            }
        }
    }

    /// Handle `HTTP_BODY_CHUNK`: append to the stream's upload sink.
    pub async fn push_body(&self, id: u32, chunk: Bytes) {
        let tx = { self.inner.body_sinks.lock().unwrap().get(&id).cloned() };
        match tx {
            Some(mut tx) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    debug!("stream {id}: request body sink dropped");
                    self.inner.body_sinks.lock().unwrap().remove(&id);
                }
            }
            None => {
                if self.inner.requests.lock().unwrap().contains_key(&id) {
                    debug!("stream {id}: body chunk for bodiless request dropped");
                    return;
                }
                if self.tombstoned(id) {
                    return;
                }
                debug!("stream {id}: body chunk for unknown request; replying body end");
                self.tombstone(id);
                let _ = self.inner.link.send(MessageType::HttpBodyEnd, id, Bytes::new());
            }
        }
    }

    /// Handle `HTTP_BODY_END`: close the stream's upload sink.
    pub fn end_body(&self, id: u32) {
        // Dropping the sender completes the wrapped request body stream.
        self.inner.body_sinks.lock().unwrap().remove(&id);
    }

    /// Abort one request (peer sent `ERROR` or tore the session down).
    pub fn abort(&self, id: u32) {
        if let Some(cancel) = self.inner.requests.lock().unwrap().get(&id) {
            // notify_one stores a permit for a fetch task between selects.
            cancel.notify_one();
        }
        self.inner.body_sinks.lock().unwrap().remove(&id);
    }

    /// Abort every in-flight request (grace expiry).
    pub fn abort_all(&self) {
        let cancels: Vec<Arc<Notify>> = self
            .inner
            .requests
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for cancel in cancels {
            cancel.notify_one();
        }
        self.inner.body_sinks.lock().unwrap().clear();
    }

    fn cleanup(&self, id: u32) {
        self.inner.requests.lock().unwrap().remove(&id);
        self.inner.body_sinks.lock().unwrap().remove(&id);
        self.tombstone(id);
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

/// Headers that never cross the tunnel; the transport frames bodies
/// itself and connection management is per-hop.
fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("upgrade")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("accept-encoding")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
}

fn response_has_body(method: &reqwest::Method, status: u16) -> bool {
    *method != reqwest::Method::HEAD && status != 204 && status != 304
}
