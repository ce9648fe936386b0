//! Codec module - serialization for frame sub-payloads.
//!
//! Two wire dialects live under the envelope:
//!
//! - [`object::ObjectCodec`] - the self-describing tagged binary format
//!   used for the TCP connect target and HTTP metadata records
//! - [`records`] - flat little-endian length-prefixed records for the
//!   DNS and UDP payloads
//!
//! Codecs are structs with static methods rather than trait objects, so
//! selection happens at compile time.

pub mod object;
pub mod records;

pub use object::{ObjectCodec, Value};
pub use records::{
    decode_dns_response, encode_dns_response, header_get, ConnectTarget, DnsQuery,
    HttpRequestMeta, HttpResponseMeta, RecordType, SocketEndpoint, UdpPacket,
};
