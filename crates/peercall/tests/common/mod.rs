//! Shared fixtures for the integration tests

#![allow(dead_code)]

use anyhow::{bail, Result};
use peercall::{Client, Host, MemoryHost, MemoryNetwork, ProtocolId, Server};
use peercall_host::IncomingStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const PROTOCOL: &str = "rpc";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Args {
    pub a: i64,
    pub b: i64,
}

impl Args {
    pub fn new(a: i64, b: i64) -> Self {
        Self { a, b }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Quotient {
    pub quo: i64,
    pub rem: i64,
}

pub struct Arith;

impl Arith {
    fn multiply(&self, args: &Args, reply: &mut i64) -> Result<()> {
        *reply = args.a * args.b;
        Ok(())
    }

    fn add(&self, args: Args, reply: &mut i64) -> Result<()> {
        *reply = args.a + args.b;
        Ok(())
    }

    fn divide(&self, args: &Args, quo: &mut Quotient) -> Result<()> {
        if args.b == 0 {
            bail!("divide by zero");
        }
        quo.quo = args.a / args.b;
        quo.rem = args.a % args.b;
        Ok(())
    }

    fn gimme_error(&self, _args: &Args, reply: &mut i64) -> Result<()> {
        *reply = 42;
        bail!("an error")
    }
}

impl peercall::Service for Arith {
    fn methods(table: &mut peercall::MethodTable<Self>) {
        table
            .method("Multiply", Arith::multiply)
            .method_owned("Add", Arith::add)
            .method("Divide", Arith::divide)
            .method("GimmeError", Arith::gimme_error);
    }
}

/// Two hosts on one in-memory network, with an Arith server on the first
pub struct TestPair {
    pub network: MemoryNetwork,
    pub server_host: Arc<MemoryHost>,
    pub client_host: Arc<MemoryHost>,
    pub server: Arc<Server>,
}

impl TestPair {
    pub fn start() -> Self {
        let network = MemoryNetwork::new();
        let server_host = network.host();
        let client_host = network.host();
        let server = Server::new(server_host.clone(), PROTOCOL);
        server
            .register(Arc::new(Arith))
            .expect("Failed to register Arith");

        Self {
            network,
            server_host,
            client_host,
            server,
        }
    }

    /// Client on the second host; calls to the first travel the network
    pub fn remote_client(&self) -> Client {
        Client::with_server(self.client_host.clone(), PROTOCOL, self.server.clone())
    }

    /// Client co-located with the server
    pub fn local_client(&self) -> Client {
        Client::with_server(self.server_host.clone(), PROTOCOL, self.server.clone())
    }
}

/// A host whose accepted streams are handed to the test to drive by hand
pub fn scripted_peer(network: &MemoryNetwork) -> (Arc<MemoryHost>, mpsc::UnboundedReceiver<IncomingStream>) {
    let host = network.host();
    let (tx, rx) = mpsc::unbounded_channel();
    host.set_stream_handler(
        ProtocolId::from(PROTOCOL),
        Arc::new(move |incoming: IncomingStream| {
            let _ = tx.send(incoming);
        }),
    );
    (host, rx)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
