//! Peer-addressed RPC.
//!
//! Callers invoke `service.method` on a peer and get a typed reply or an
//! error, whether the peer is this process or a remote host:
//! - [`Server`] owns a [`Registry`] of services and answers streams opened
//!   under its protocol ID
//! - [`Client::call`] dispatches straight into an attached local server when
//!   the destination is the empty identity or the host itself, and otherwise
//!   multiplexes the call over one stream per peer
//!
//! Both routes go through [`Registry::invoke`], so their results cannot drift.

mod client;
pub mod config;
mod connection;
mod error;
mod payload;
mod registry;
mod server;
mod service;

pub use client::Client;
pub use config::{ClientConfig, RpcConfig, ServerConfig};
pub use error::{ConnectionError, ProtocolError, RegistrationError, Result, RpcError};
pub use payload::{Payload, ReplyPayload, ReplyTarget};
pub use registry::Registry;
pub use server::{Server, ServerState};
pub use service::{ArgConvention, MethodDescriptor, MethodTable, Receiver, Service};

pub use peercall_host::{Host, HostError, MemoryHost, MemoryNetwork, PeerId, ProtocolId};
pub use peercall_protocol::RemoteError;
