//! Transport module - the WebSocket link and the egress session registry.
//!
//! The link owns the socket and the send queue; the registry keeps
//! sessions addressable across socket drops for the reconnect grace
//! window.

mod link;
mod registry;

pub use link::{InboundHandler, Link, LinkEvent, LinkState};
pub use registry::{Session, SessionRegistry};
