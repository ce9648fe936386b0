//! Length-prefixed sub-payload records.
//!
//! DNS, UDP bind, and UDP datagram payloads are flat little-endian records;
//! the TCP connect target and HTTP metadata ride the tagged object codec.
//! Note the deliberate asymmetry: every multi-byte integer here is Little
//! Endian while the outer envelope's resource id is Big Endian.

use bytes::{BufMut, Bytes, BytesMut};

use super::object::{ObjectCodec, Value};
use crate::config::{MAX_DNS_NAME_LENGTH, MAX_UDP_PACKET_SIZE};
use crate::error::{MuxError, Result};

/// DNS record types carried in a query payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    A = 0,
    Aaaa = 1,
    Aname = 2,
    Cname = 3,
    Ns = 4,
    Ptr = 5,
}

impl RecordType {
    /// Decode a record type octet.
    pub fn from_u8(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => Self::A,
            1 => Self::Aaaa,
            2 => Self::Aname,
            3 => Self::Cname,
            4 => Self::Ns,
            5 => Self::Ptr,
            other => return Err(MuxError::Codec(format!("unknown record type {other}"))),
        })
    }

    /// Get the wire octet.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// `DNS_QUERY` payload: `nameLen u16 LE, name, recordType u8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub name: String,
    pub record_type: RecordType,
}

impl DnsQuery {
    /// Build a query, enforcing the name length cap.
    pub fn new(name: impl Into<String>, record_type: RecordType) -> Result<Self> {
        let name = name.into();
        if name.len() > MAX_DNS_NAME_LENGTH {
            return Err(MuxError::Codec(format!(
                "DNS name length {} exceeds {MAX_DNS_NAME_LENGTH}",
                name.len()
            )));
        }
        Ok(Self { name, record_type })
    }

    /// Encode to the wire record.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.name.len());
        buf.put_u16_le(self.name.len() as u16);
        buf.extend_from_slice(self.name.as_bytes());
        buf.put_u8(self.record_type.as_u8());
        buf.freeze()
    }

    /// Decode from the wire record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = LeReader::new(data);
        let name = reader.read_string()?;
        if name.len() > MAX_DNS_NAME_LENGTH {
            return Err(MuxError::Codec(format!(
                "DNS name length {} exceeds {MAX_DNS_NAME_LENGTH}",
                name.len()
            )));
        }
        let record_type = RecordType::from_u8(reader.read_u8()?)?;
        reader.finish()?;
        Ok(Self { name, record_type })
    }
}

/// Encode a `DNS_RESPONSE` payload: `count u16 LE, (ipLen u16 LE, ip)…`.
///
/// Addresses are peer-native textual form (IPv4 dotted, IPv6 canonical).
pub fn encode_dns_response(addresses: &[String]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16_le(addresses.len() as u16);
    for addr in addresses {
        buf.put_u16_le(addr.len() as u16);
        buf.extend_from_slice(addr.as_bytes());
    }
    buf.freeze()
}

/// Decode a `DNS_RESPONSE` payload.
pub fn decode_dns_response(data: &[u8]) -> Result<Vec<String>> {
    let mut reader = LeReader::new(data);
    let count = reader.read_u16()? as usize;
    let mut addresses = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        addresses.push(reader.read_string()?);
    }
    reader.finish()?;
    Ok(addresses)
}

/// A `(host, port)` pair as carried in UDP payloads:
/// `hostLen u16 LE, host, port u16 LE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEndpoint {
    pub host: String,
    pub port: u16,
}

impl SocketEndpoint {
    /// Build an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Encode to the wire record.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.host.len());
        self.write(&mut buf);
        buf.freeze()
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.host.len() as u16);
        buf.extend_from_slice(self.host.as_bytes());
        buf.put_u16_le(self.port);
    }

    /// Decode a standalone endpoint record (no trailing bytes allowed).
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = LeReader::new(data);
        let endpoint = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(endpoint)
    }

    fn read(reader: &mut LeReader<'_>) -> Result<Self> {
        let host = reader.read_string()?;
        let port = reader.read_u16()?;
        Ok(Self { host, port })
    }
}

/// `UDP_DATA` payload: endpoint record followed by the datagram bytes.
///
/// Initiator→egress the endpoint is the target; egress→initiator it is the
/// sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub endpoint: SocketEndpoint,
    pub data: Bytes,
}

impl UdpPacket {
    /// Build a packet, enforcing the datagram size cap.
    pub fn new(endpoint: SocketEndpoint, data: Bytes) -> Result<Self> {
        if data.len() > MAX_UDP_PACKET_SIZE {
            return Err(MuxError::Codec(format!(
                "datagram of {} bytes exceeds {MAX_UDP_PACKET_SIZE}",
                data.len()
            )));
        }
        Ok(Self { endpoint, data })
    }

    /// Encode to the wire record.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.endpoint.host.len() + self.data.len());
        self.endpoint.write(&mut buf);
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }

    /// Decode from a `UDP_DATA` payload; the datagram is the remainder.
    pub fn decode(data: Bytes) -> Result<Self> {
        let mut reader = LeReader::new(&data);
        let endpoint = SocketEndpoint::read(&mut reader)?;
        let datagram = data.slice(reader.pos..);
        if datagram.len() > MAX_UDP_PACKET_SIZE {
            return Err(MuxError::Codec(format!(
                "datagram of {} bytes exceeds {MAX_UDP_PACKET_SIZE}",
                datagram.len()
            )));
        }
        Ok(Self {
            endpoint,
            data: datagram,
        })
    }
}

/// `TCP_CONNECT` payload: object-codec pair `(host, port)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// Build a connect target.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Encode to the tagged-object wire form.
    pub fn encode(&self) -> Bytes {
        ObjectCodec::encode(&Value::Array(vec![
            Value::string(self.host.clone()),
            Value::Integer(i64::from(self.port)),
        ]))
    }

    /// Decode from the tagged-object wire form.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let value = ObjectCodec::decode(data)?;
        let items = value
            .as_array()
            .ok_or_else(|| MuxError::Codec("connect target is not a pair".into()))?;
        let [host, port] = items else {
            return Err(MuxError::Codec("connect target is not a pair".into()));
        };
        let host = host
            .as_str()
            .ok_or_else(|| MuxError::Codec("connect host is not a string".into()))?;
        let port = port
            .as_i64()
            .filter(|p| (0..=65_535).contains(p))
            .ok_or_else(|| MuxError::Codec("connect port out of range".into()))?;
        Ok(Self::new(host, port as u16))
    }
}

/// `HTTP_REQUEST` payload: object-codec record `{method, url, headers}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestMeta {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequestMeta {
    /// Build request metadata.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Encode to the tagged-object wire form.
    pub fn encode(&self) -> Bytes {
        ObjectCodec::encode(&Value::Object(vec![
            ("method".into(), Value::string(self.method.clone())),
            ("url".into(), Value::string(self.url.clone())),
            ("headers".into(), headers_to_value(&self.headers)),
        ]))
    }

    /// Decode from the tagged-object wire form.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let value = ObjectCodec::decode(data)?;
        Ok(Self {
            method: require_string(&value, "method")?,
            url: require_string(&value, "url")?,
            headers: headers_from_value(value.get("headers"))?,
        })
    }

    /// Whether the request announces a body (`content-length` or
    /// `transfer-encoding` present).
    pub fn has_body(&self) -> bool {
        if let Some(len) = header_get(&self.headers, "content-length") {
            return len.trim().parse::<u64>().map(|n| n > 0).unwrap_or(false);
        }
        header_get(&self.headers, "transfer-encoding").is_some()
    }
}

/// `HTTP_RESPONSE` payload: object-codec record
/// `{status, statusText, headers, url, body}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseMeta {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub url: String,
    pub has_body: bool,
}

impl HttpResponseMeta {
    /// Encode to the tagged-object wire form.
    ///
    /// `transfer-encoding` is stripped: the tunnel frames body chunks
    /// itself and the receiving proxy re-synthesizes transfer framing if
    /// it needs to expose an HTTP/1.1 stream.
    pub fn encode(&self) -> Bytes {
        let headers: Vec<(String, String)> = self
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("transfer-encoding"))
            .cloned()
            .collect();
        ObjectCodec::encode(&Value::Object(vec![
            ("status".into(), Value::Integer(i64::from(self.status))),
            ("statusText".into(), Value::string(self.status_text.clone())),
            ("headers".into(), headers_to_value(&headers)),
            ("url".into(), Value::string(self.url.clone())),
            ("body".into(), Value::bool(self.has_body)),
        ]))
    }

    /// Decode from the tagged-object wire form.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let value = ObjectCodec::decode(data)?;
        let status = value
            .get("status")
            .and_then(Value::as_i64)
            .filter(|s| (0..=999).contains(s))
            .ok_or_else(|| MuxError::Codec("response status missing or out of range".into()))?;
        Ok(Self {
            status: status as u16,
            status_text: require_string(&value, "statusText")?,
            headers: headers_from_value(value.get("headers"))?,
            url: require_string(&value, "url")?,
            has_body: value.get("body").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

/// Case-insensitive header lookup.
pub fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn headers_to_value(headers: &[(String, String)]) -> Value {
    Value::Object(
        headers
            .iter()
            .map(|(name, value)| (name.clone(), Value::string(value.clone())))
            .collect(),
    )
}

fn headers_from_value(value: Option<&Value>) -> Result<Vec<(String, String)>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let entries = value
        .as_object()
        .ok_or_else(|| MuxError::Codec("headers is not an object".into()))?;
    entries
        .iter()
        .map(|(name, val)| {
            let val = val
                .as_str()
                .ok_or_else(|| MuxError::Codec(format!("header {name} is not a string")))?;
            Ok((name.clone(), val.to_string()))
        })
        .collect()
}

fn require_string(value: &Value, key: &str) -> Result<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MuxError::Codec(format!("missing string field {key}")))
}

/// Little-endian record reader shared by the flat payloads.
struct LeReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> LeReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| MuxError::Codec("truncated record".into()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.data.len() - self.pos < 2 {
            return Err(MuxError::Codec("truncated record".into()));
        }
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        if self.data.len() - self.pos < len {
            return Err(MuxError::Codec("truncated record".into()));
        }
        let raw = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(std::str::from_utf8(raw)
            .map_err(|e| MuxError::Codec(format!("invalid UTF-8 in record: {e}")))?
            .to_string())
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(MuxError::Codec(format!(
                "{} trailing bytes in record",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}
