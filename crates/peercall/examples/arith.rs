// Arith demo
//
// Two hosts on an in-memory network. The first serves an `Arith` service;
// the second calls it remotely, then the first calls it through the local
// fast path.
//
// Run with `RUST_LOG=peercall=debug` to see the stream traffic.

use anyhow::{bail, Result};
use peercall::{Client, Host, MemoryNetwork, MethodTable, PeerId, Server, Service};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Args {
    a: i64,
    b: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Quotient {
    quo: i64,
    rem: i64,
}

struct Arith;

impl Arith {
    fn multiply(&self, args: &Args, reply: &mut i64) -> Result<()> {
        *reply = args.a * args.b;
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
}

impl Service for Arith {
    fn methods(table: &mut MethodTable<Self>) {
        table
            .method("Multiply", Arith::multiply)
            .method("Divide", Arith::divide);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let network = MemoryNetwork::new();
    let server_host = network.host();
    let client_host = network.host();

    let server = Server::new(server_host.clone(), "rpc");
    server.register(Arc::new(Arith))?;
    for method in server.methods("Arith").unwrap_or_default() {
        info!(
            "Arith.{} ({} -> {})",
            method.name, method.arg_type, method.reply_type
        );
    }

    let remote = Client::new(client_host.clone(), "rpc");
    let mut product = 0i64;
    remote
        .call(&server_host.id(), "Arith", "Multiply", &Args { a: 7, b: 6 }, &mut product)
        .await?;
    info!("remote 7 * 6 = {}", product);

    let mut quotient = Quotient::default();
    remote
        .call(&server_host.id(), "Arith", "Divide", &Args { a: 20, b: 6 }, &mut quotient)
        .await?;
    info!("remote 20 / 6 = {} rem {}", quotient.quo, quotient.rem);

    let local = Client::with_server(server_host.clone(), "rpc", server.clone());
    let err = local
        .call(&PeerId::local(), "Arith", "Divide", &Args { a: 1, b: 0 }, &mut quotient)
        .await
        .err();
    info!("local 1 / 0 -> {:?}", err.map(|e| e.to_string()));

    server.close();
    Ok(())
}
