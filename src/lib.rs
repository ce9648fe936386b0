//! # muxtun
//!
//! Multiplexes many independent logical streams (TCP connections, UDP
//! sockets, DNS lookups, and HTTP exchanges) over one ordered,
//! bidirectional WebSocket. The initiator peer issues operations; the
//! egress peer performs the real network I/O on its own network. Both
//! ends speak the same framed protocol: a 5-byte envelope (type octet +
//! Big Endian stream id) over the transport's binary frames, and a
//! JSON-replying command channel over its text frames.
//!
//! ## Architecture
//!
//! - **Protocol** (`protocol`): the envelope codec and message taxonomy
//! - **Codecs** (`codec`): tagged object payloads and little-endian
//!   length-prefixed records
//! - **Transport** (`transport`): socket ownership, bounded send queue,
//!   heartbeat/watchdog, reconnect grace window, session registry
//! - **Engines** (`engine`): egress-side per-stream state machines
//! - **Client** (`client`): initiator pending table and operations
//! - **Server** (`server`): egress accept loop
//!
//! ## Example
//!
//! ```ignore
//! use muxtun::{TunnelClient, TunnelConfig};
//!
//! #[tokio::main]
//! async fn main() -> muxtun::Result<()> {
//!     let client = TunnelClient::connect("ws://proxy:8080/", TunnelConfig::default()).await?;
//!     let mut stream = client.connect_tcp("example.com", 80).await?;
//!     stream.send(bytes::Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n")).await?;
//!     while let Some(chunk) = stream.recv().await {
//!         println!("{} bytes", chunk?.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod backpressure;
pub mod codec;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

mod client;

pub use client::{HttpFetch, IdAllocator, TcpTunnel, TunnelClient, UdpTunnel};
pub use config::{ServerConfig, TunnelConfig};
pub use error::{MuxError, Result};
pub use server::TunnelServer;
