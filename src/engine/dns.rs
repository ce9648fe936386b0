//! DNS engine (egress side).
//!
//! Stateless: each query spawns one task that resolves with the mapped
//! record type under a 10 s deadline, encodes the textual address list,
//! and replies with `DNS_RESPONSE`. Failures and the deadline firing both
//! produce an `ERROR` frame for the stream.

use std::sync::Arc;

use bytes::Bytes;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::RecordType as DnsRecordType;
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, warn};

use crate::codec::{encode_dns_response, DnsQuery, RecordType};
use crate::config::TunnelConfig;
use crate::error::{MuxError, Result};
use crate::protocol::MessageType;
use crate::transport::Link;

struct DnsInner {
    link: Link,
    config: TunnelConfig,
    resolver: TokioAsyncResolver,
}

/// Egress-side resolver.
#[derive(Clone)]
pub struct DnsEngine {
    inner: Arc<DnsInner>,
}

impl DnsEngine {
    /// Create the engine, preferring the system resolver configuration.
    pub fn new(link: Link, config: TunnelConfig) -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            debug!("system resolver config unavailable ({e}); using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self {
            inner: Arc::new(DnsInner {
                link,
                config,
                resolver,
            }),
        }
    }

    /// Handle `DNS_QUERY`: resolve and reply asynchronously.
    pub fn resolve(&self, id: u32, payload: Bytes) {
        let query = match DnsQuery::decode(&payload) {
            Ok(query) => query,
            Err(e) => {
                warn!("stream {id}: bad DNS query payload: {e}");
                let _ = self.inner.link.send(
                    MessageType::Error,
                    id,
                    Bytes::from(format!("bad DNS query: {e}")),
                );
                return;
            }
        };

        let engine = self.clone();
        tokio::spawn(async move {
            let deadline = engine.inner.config.dns_query_timeout;
            match tokio::time::timeout(deadline, engine.lookup(&query)).await {
                Err(_) => {
                    let _ = engine.inner.link.send(
                        MessageType::Error,
                        id,
                        Bytes::from_static(b"DNS query timeout"),
                    );
                }
                Ok(Err(e)) => {
                    debug!("stream {id}: DNS lookup for {} failed: {e}", query.name);
                    let _ = engine
                        .inner
                        .link
                        .send(MessageType::Error, id, Bytes::from(e.to_string()));
                }
                Ok(Ok(addresses)) => {
                    let _ = engine.inner.link.send(
                        MessageType::DnsResponse,
                        id,
                        encode_dns_response(&addresses),
                    );
                }
            }
        });
    }

    async fn lookup(&self, query: &DnsQuery) -> Result<Vec<String>> {
        let record_type = map_record_type(query.record_type);
        let lookup = self
            .inner
            .resolver
            .lookup(query.name.as_str(), record_type)
            .await
            .map_err(|e| MuxError::Upstream(e.to_string()))?;
        Ok(lookup.iter().map(|rdata| rdata.to_string()).collect())
    }
}

fn map_record_type(record_type: RecordType) -> DnsRecordType {
    match record_type {
        RecordType::A => DnsRecordType::A,
        RecordType::Aaaa => DnsRecordType::AAAA,
        RecordType::Aname => DnsRecordType::ANAME,
        RecordType::Cname => DnsRecordType::CNAME,
        RecordType::Ns => DnsRecordType::NS,
        RecordType::Ptr => DnsRecordType::PTR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_mapping() {
        assert_eq!(map_record_type(RecordType::A), DnsRecordType::A);
        assert_eq!(map_record_type(RecordType::Aaaa), DnsRecordType::AAAA);
        assert_eq!(map_record_type(RecordType::Aname), DnsRecordType::ANAME);
        assert_eq!(map_record_type(RecordType::Cname), DnsRecordType::CNAME);
        assert_eq!(map_record_type(RecordType::Ns), DnsRecordType::NS);
        assert_eq!(map_record_type(RecordType::Ptr), DnsRecordType::PTR);
    }

    #[tokio::test]
    async fn test_bad_payload_yields_error_frame() {
        let engine = DnsEngine::new(Link::new(TunnelConfig::default()), TunnelConfig::default());
        engine.resolve(1, Bytes::from_static(&[0xFF]));
        assert_eq!(engine.inner.link.queued_len(), 1);
    }
}
