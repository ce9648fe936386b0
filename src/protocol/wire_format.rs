//! Wire format for the frame envelope.
//!
//! Every binary transport message starts with a 5-byte header:
//! ```text
//! ┌────────┬─────────────┬─────────────┐
//! │ Type   │ Resource ID │ Payload     │
//! │ 1 byte │ 4 bytes BE  │ rest of msg │
//! └────────┴─────────────┴─────────────┘
//! ```
//! There is no payload length field; the transport message carries the
//! boundary. The resource id is Big Endian; sub-payload integers are
//! Little Endian (see `codec::records`) and the asymmetry is load-bearing
//! for interoperability.

use crate::error::{MuxError, Result};

/// Envelope header size in bytes (fixed, exactly 5).
pub const HEADER_SIZE: usize = 5;

/// Resource id reserved for heartbeats and control traffic.
pub const CONTROL_RESOURCE_ID: u32 = 0;

/// Message taxonomy. All other octets are reserved: decoders report them
/// as `UnknownMessageType` and the link drops the frame after logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// init → egress: open TCP to `(host, port)`.
    TcpConnect = 0x01,
    /// egress → init: connect succeeded.
    TcpConnectAck = 0x02,
    /// Both directions: opaque byte slice for this stream.
    TcpData = 0x03,
    /// Both directions: tear down this stream.
    TcpClose = 0x04,
    /// init → egress: allocate a UDP socket.
    UdpBind = 0x11,
    /// egress → init: locally bound address.
    UdpBindAck = 0x12,
    /// Both directions: one datagram framed with its peer address.
    UdpData = 0x13,
    /// Both directions: release the UDP socket.
    UdpClose = 0x14,
    /// init → egress: resolve a name to addresses.
    DnsQuery = 0x21,
    /// egress → init: resolved address list.
    DnsResponse = 0x22,
    /// init → egress: method/url/headers.
    HttpRequest = 0x31,
    /// egress → init: status/headers/url/has-body.
    HttpResponse = 0x32,
    /// Both directions: one slice of request or response body.
    HttpBodyChunk = 0x33,
    /// Both directions: close the body stream for this stream.
    HttpBodyEnd = 0x34,
    /// Any direction: UTF-8 error string for this stream.
    Error = 0xFE,
    /// Liveness ping, resource id 0. Never echoed on receive.
    Heartbeat = 0xFF,
}

impl MessageType {
    /// Decode a type octet, rejecting reserved values.
    pub fn from_u8(byte: u8) -> Result<Self> {
        Ok(match byte {
            0x01 => Self::TcpConnect,
            0x02 => Self::TcpConnectAck,
            0x03 => Self::TcpData,
            0x04 => Self::TcpClose,
            0x11 => Self::UdpBind,
            0x12 => Self::UdpBindAck,
            0x13 => Self::UdpData,
            0x14 => Self::UdpClose,
            0x21 => Self::DnsQuery,
            0x22 => Self::DnsResponse,
            0x31 => Self::HttpRequest,
            0x32 => Self::HttpResponse,
            0x33 => Self::HttpBodyChunk,
            0x34 => Self::HttpBodyEnd,
            0xFE => Self::Error,
            0xFF => Self::Heartbeat,
            other => return Err(MuxError::UnknownMessageType(other)),
        })
    }

    /// Get the wire octet.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if this message ends its stream's lifetime.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::TcpClose | Self::UdpClose | Self::HttpBodyEnd | Self::Error
        )
    }

    /// Check if this is a request that creates a stream on the egress side.
    #[inline]
    pub fn opens_stream(self) -> bool {
        matches!(
            self,
            Self::TcpConnect | Self::UdpBind | Self::DnsQuery | Self::HttpRequest
        )
    }

    /// Terminal message to reply with when a non-terminal frame arrives for
    /// a stream the recipient has never seen (forces the sender to clean
    /// up a leaked stream). `None` for classes with no close message and
    /// for terminals themselves.
    pub fn close_counterpart(self) -> Option<MessageType> {
        match self {
            Self::TcpConnectAck | Self::TcpData => Some(Self::TcpClose),
            Self::UdpBindAck | Self::UdpData => Some(Self::UdpClose),
            Self::HttpResponse | Self::HttpBodyChunk => Some(Self::HttpBodyEnd),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_known_octets_roundtrip() {
        let octets = [
            0x01, 0x02, 0x03, 0x04, 0x11, 0x12, 0x13, 0x14, 0x21, 0x22, 0x31, 0x32, 0x33, 0x34,
            0xFE, 0xFF,
        ];
        for byte in octets {
            let ty = MessageType::from_u8(byte).unwrap();
            assert_eq!(ty.as_u8(), byte);
        }
    }

    #[test]
    fn test_reserved_octets_rejected() {
        for byte in [0x00u8, 0x05, 0x10, 0x15, 0x20, 0x23, 0x30, 0x35, 0x80, 0xFD] {
            let result = MessageType::from_u8(byte);
            assert!(
                matches!(result, Err(MuxError::UnknownMessageType(b)) if b == byte),
                "0x{byte:02X} should be reserved"
            );
        }
    }

    #[test]
    fn test_terminal_classification() {
        assert!(MessageType::TcpClose.is_terminal());
        assert!(MessageType::UdpClose.is_terminal());
        assert!(MessageType::HttpBodyEnd.is_terminal());
        assert!(MessageType::Error.is_terminal());
        assert!(!MessageType::TcpData.is_terminal());
        assert!(!MessageType::Heartbeat.is_terminal());
    }

    #[test]
    fn test_close_counterpart_per_stream_class() {
        assert_eq!(
            MessageType::TcpData.close_counterpart(),
            Some(MessageType::TcpClose)
        );
        assert_eq!(
            MessageType::UdpData.close_counterpart(),
            Some(MessageType::UdpClose)
        );
        assert_eq!(
            MessageType::HttpBodyChunk.close_counterpart(),
            Some(MessageType::HttpBodyEnd)
        );
        // DNS has no close message; terminals and requests map to nothing.
        assert_eq!(MessageType::DnsResponse.close_counterpart(), None);
        assert_eq!(MessageType::TcpClose.close_counterpart(), None);
        assert_eq!(MessageType::TcpConnect.close_counterpart(), None);
    }

    #[test]
    fn test_opens_stream() {
        assert!(MessageType::TcpConnect.opens_stream());
        assert!(MessageType::UdpBind.opens_stream());
        assert!(MessageType::DnsQuery.opens_stream());
        assert!(MessageType::HttpRequest.opens_stream());
        assert!(!MessageType::TcpData.opens_stream());
    }
}
