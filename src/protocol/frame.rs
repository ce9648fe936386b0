//! Frame struct with envelope encode/decode.
//!
//! Uses `bytes::Bytes` for the payload so per-stream handlers can retain
//! it past the lifetime of the transport buffer without copying.
//!
//! # Example
//!
//! ```
//! use muxtun::protocol::{Frame, MessageType};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(MessageType::TcpData, 42, Bytes::from_static(b"hello"));
//! let encoded = frame.encode();
//! let decoded = Frame::decode(encoded).unwrap();
//! assert_eq!(decoded.resource_id, 42);
//! assert_eq!(decoded.payload(), b"hello");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{MessageType, HEADER_SIZE};
use crate::error::{MuxError, Result};

/// One protocol frame: type, stream id, opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type octet.
    pub msg_type: MessageType,
    /// Stream identifier (0 is reserved for heartbeats and control).
    pub resource_id: u32,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(msg_type: MessageType, resource_id: u32, payload: Bytes) -> Self {
        Self {
            msg_type,
            resource_id,
            payload,
        }
    }

    /// Create a frame with an empty payload.
    pub fn empty(msg_type: MessageType, resource_id: u32) -> Self {
        Self::new(msg_type, resource_id, Bytes::new())
    }

    /// Create a heartbeat frame (resource id 0).
    pub fn heartbeat() -> Self {
        Self::empty(MessageType::Heartbeat, super::wire_format::CONTROL_RESOURCE_ID)
    }

    /// Create an error frame carrying a UTF-8 message.
    pub fn error(resource_id: u32, message: &str) -> Self {
        Self::new(
            MessageType::Error,
            resource_id,
            Bytes::copy_from_slice(message.as_bytes()),
        )
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Check if this is a heartbeat.
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.msg_type == MessageType::Heartbeat
    }

    /// Total encoded size (header + payload).
    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode into a contiguous buffer: type, resource id Big Endian,
    /// payload bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.msg_type.as_u8());
        buf.put_u32(self.resource_id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode one transport message.
    ///
    /// The payload is sliced out of the input without copying. Fails with
    /// `FrameTooShort` below 5 bytes and `UnknownMessageType` for reserved
    /// type octets; both are drop-and-log conditions, never fatal to the
    /// transport.
    pub fn decode(data: Bytes) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(MuxError::FrameTooShort(data.len()));
        }
        let msg_type = MessageType::from_u8(data[0])?;
        let resource_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        Ok(Self {
            msg_type,
            resource_id,
            payload: data.slice(HEADER_SIZE..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let original = Frame::new(MessageType::TcpData, 42, Bytes::from_static(b"hello"));
        let decoded = Frame::decode(original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_envelope_big_endian_byte_order() {
        let frame = Frame::empty(MessageType::HttpRequest, 0x01020304);
        let bytes = frame.encode();
        assert_eq!(&bytes[..], &[0x31, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_header_size_is_exactly_5() {
        assert_eq!(HEADER_SIZE, 5);
        assert_eq!(Frame::empty(MessageType::TcpClose, 1).encode().len(), 5);
    }

    #[test]
    fn test_decode_too_short() {
        let result = Frame::decode(Bytes::from_static(&[0x03, 0x00, 0x00, 0x00]));
        assert!(matches!(result, Err(MuxError::FrameTooShort(4))));
    }

    #[test]
    fn test_decode_reserved_type() {
        let result = Frame::decode(Bytes::from_static(&[0x7F, 0, 0, 0, 1]));
        assert!(matches!(result, Err(MuxError::UnknownMessageType(0x7F))));
    }

    #[test]
    fn test_decode_payload_zero_copy() {
        let wire = Frame::new(MessageType::TcpData, 7, Bytes::from_static(b"payload")).encode();
        let wire_ptr = wire.as_ptr();
        let frame = Frame::decode(wire).unwrap();
        // The payload is a slice of the same allocation, offset by the header.
        assert_eq!(frame.payload.as_ptr(), unsafe { wire_ptr.add(HEADER_SIZE) });
    }

    #[test]
    fn test_empty_payload() {
        let frame = Frame::decode(Frame::empty(MessageType::TcpClose, 9).encode()).unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(frame.resource_id, 9);
    }

    #[test]
    fn test_heartbeat_uses_control_id() {
        let frame = Frame::heartbeat();
        assert!(frame.is_heartbeat());
        assert_eq!(frame.resource_id, 0);
        assert_eq!(&frame.encode()[..], &[0xFF, 0, 0, 0, 0]);
    }

    #[test]
    fn test_error_frame_carries_utf8() {
        let frame = Frame::error(3, "connection refused");
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Error);
        assert_eq!(decoded.payload(), b"connection refused");
    }

    #[test]
    fn test_max_resource_id() {
        let frame = Frame::empty(MessageType::TcpData, u32::MAX);
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.resource_id, u32::MAX);
    }
}
