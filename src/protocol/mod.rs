//! Protocol module - the framed multiplexing envelope.
//!
//! Implements the binary envelope shared by both peers:
//! - 5-byte header (type octet + Big Endian resource id)
//! - closed message taxonomy over the protocol octets
//! - `Frame` with zero-copy payload
//!
//! The underlying transport is message-framed, so there is no length field
//! and no reassembly: one transport message is exactly one frame.

mod frame;
mod wire_format;

pub use frame::Frame;
pub use wire_format::{MessageType, CONTROL_RESOURCE_ID, HEADER_SIZE};
