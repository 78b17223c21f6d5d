//! Network-host abstraction consumed by peercall.
//!
//! A [`Host`] owns a peer identity and hands out byte streams:
//! - `open_stream(peer, protocol)` dials a peer under a protocol ID
//! - `set_stream_handler(protocol, handler)` accepts streams under a protocol ID
//!
//! Real transports (connection security, addressing, discovery) live outside
//! this crate. [`MemoryNetwork`] wires hosts together inside one process and is
//! what the tests and demos run on.

mod host;
mod memory;
mod peer;

pub use host::{AsyncStream, Host, HostError, IncomingStream, Stream, StreamHandler};
pub use memory::{MemoryHost, MemoryNetwork, MemoryStream, DEFAULT_BUFFER_SIZE};
pub use peer::{PeerId, ProtocolId};
