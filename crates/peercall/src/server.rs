//! RPC server: answers streams opened under one protocol ID.
//!
//! Each accepted stream gets its own task that reads requests in arrival
//! order, dispatches them through the [`Registry`] and writes one response
//! per request. Streams never share state beyond the registry.

use crate::config::ServerConfig;
use crate::error::RegistrationError;
use crate::payload::ReplyTarget;
use crate::registry::Registry;
use crate::service::{MethodDescriptor, Receiver, Service};
use parking_lot::Mutex;
use peercall_host::{Host, IncomingStream, PeerId, ProtocolId, Stream, StreamHandler};
use peercall_protocol::{
    CodecError, FrameReader, FrameWriter, RemoteError, RequestEnvelope, ResponseEnvelope,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::WriteHalf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Created,
    Listening,
    Closed,
}

pub struct Server {
    host: Arc<dyn Host>,
    protocol: ProtocolId,
    registry: Arc<Registry>,
    config: ServerConfig,
    state: Mutex<ServerState>,
    /// Parent of every stream task's token
    shutdown: CancellationToken,
}

impl Server {
    /// Create a server on `host` and start listening under `protocol`
    pub fn new(host: Arc<dyn Host>, protocol: impl Into<ProtocolId>) -> Arc<Self> {
        Self::with_config(host, protocol, ServerConfig::default())
    }

    pub fn with_config(
        host: Arc<dyn Host>,
        protocol: impl Into<ProtocolId>,
        config: ServerConfig,
    ) -> Arc<Self> {
        let server = Arc::new(Self {
            host,
            protocol: protocol.into(),
            registry: Arc::new(Registry::new()),
            config,
            state: Mutex::new(ServerState::Created),
            shutdown: CancellationToken::new(),
        });
        server.listen();
        server
    }

    fn listen(self: &Arc<Self>) {
        let server = Arc::downgrade(self);
        let handler: StreamHandler = Arc::new(move |incoming: IncomingStream| {
            if let Some(server) = server.upgrade() {
                server.accept(incoming);
            }
        });
        self.host.set_stream_handler(self.protocol.clone(), handler);
        *self.state.lock() = ServerState::Listening;
        info!(peer = %self.host.id(), protocol = %self.protocol, "RPC server listening");
    }

    fn accept(&self, incoming: IncomingStream) {
        let IncomingStream {
            remote,
            protocol,
            stream,
        } = incoming;
        if self.shutdown.is_cancelled() {
            debug!(peer = %remote, %protocol, "Refusing stream on closed server");
            return;
        }

        debug!(peer = %remote, %protocol, "Accepted stream");
        let token = self.shutdown.child_token();
        let registry = Arc::clone(&self.registry);
        let max_frame_bytes = self.config.max_frame_bytes;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(peer = %remote, "Abandoning stream on server close");
                }
                _ = serve_stream(&registry, &remote, stream, max_frame_bytes) => {}
            }
        });
    }

    /// Register `receiver` under its type name
    pub fn register<S: Service>(
        &self,
        receiver: impl Into<Receiver<S>>,
    ) -> Result<(), RegistrationError> {
        self.registry.register(receiver)
    }

    /// Register `receiver` under an explicit name
    pub fn register_name<S: Service>(
        &self,
        name: impl Into<String>,
        receiver: impl Into<Receiver<S>>,
    ) -> Result<(), RegistrationError> {
        self.registry.register_name(name, receiver)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Identity of the host the server listens on
    pub fn id(&self) -> PeerId {
        self.host.id()
    }

    pub fn protocol(&self) -> &ProtocolId {
        &self.protocol
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.registry.service_names()
    }

    pub fn methods(&self, service: &str) -> Option<Vec<MethodDescriptor>> {
        self.registry.methods(service)
    }

    /// Stop accepting streams and abandon the ones in flight.
    ///
    /// The registry stays usable for local calls.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ServerState::Closed {
                return;
            }
            *state = ServerState::Closed;
        }
        self.host.remove_stream_handler(&self.protocol);
        self.shutdown.cancel();
        info!(peer = %self.host.id(), protocol = %self.protocol, "RPC server closed");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

async fn serve_stream(registry: &Registry, remote: &PeerId, stream: Stream, max_frame_bytes: usize) {
    let (read, write) = tokio::io::split(stream);
    let mut reader = FrameReader::with_max_frame_bytes(read, max_frame_bytes);
    let mut writer = FrameWriter::with_max_frame_bytes(write, max_frame_bytes);

    loop {
        let request = match reader.read_request().await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(peer = %remote, "Stream closed by peer");
                break;
            }
            Err(e) => {
                warn!(peer = %remote, error = %e, "Failed to decode request, closing stream");
                break;
            }
        };

        debug!(
            peer = %remote,
            seq = request.seq,
            service = %request.service,
            method = %request.method,
            "Handling request"
        );
        if let Err(e) = respond(registry, &mut writer, request).await {
            warn!(peer = %remote, error = %e, "Failed to write response, closing stream");
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn respond(
    registry: &Registry,
    writer: &mut FrameWriter<WriteHalf<Stream>>,
    request: RequestEnvelope,
) -> Result<(), CodecError> {
    let RequestEnvelope {
        service,
        method,
        seq,
        args,
    } = request;

    let mut reply = None;
    let outcome = registry.invoke(&service, &method, &args, ReplyTarget::Encoded(&mut reply));
    let response = match outcome {
        Ok(()) => ResponseEnvelope {
            seq,
            error: None,
            reply,
        },
        Err(error) => ResponseEnvelope::failure(seq, error, reply),
    };

    match writer.write_response(&response).await {
        // Nothing was written; the caller still needs an answer for `seq`
        Err(CodecError::FrameTooLarge { limit }) => {
            let error = RemoteError::invalid_reply(
                &service,
                &method,
                format!("encoded response exceeds {limit} bytes"),
            );
            writer
                .write_response(&ResponseEnvelope::failure(seq, error, None))
                .await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MethodTable;
    use peercall_host::MemoryNetwork;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    struct Echo;

    impl Echo {
        fn echo(&self, args: &String, reply: &mut String) -> Result<(), String> {
            reply.push_str(args);
            Ok(())
        }

        fn repeat(&self, count: usize, reply: &mut String) -> Result<(), String> {
            *reply = "x".repeat(count);
            Ok(())
        }
    }

    impl Service for Echo {
        fn methods(table: &mut MethodTable<Self>) {
            table
                .method("Echo", Echo::echo)
                .method_owned("Repeat", Echo::repeat);
        }
    }

    #[tokio::test]
    async fn test_new_server_is_listening() {
        let network = MemoryNetwork::new();
        let host = network.host();
        let server = Server::new(host.clone(), "rpc");
        assert_eq!(server.state(), ServerState::Listening);
        assert_eq!(server.id(), host.id());

        server.close();
        server.close();
        assert_eq!(server.state(), ServerState::Closed);
    }

    #[tokio::test]
    async fn test_requests_on_one_stream_answered_in_order() {
        let network = MemoryNetwork::new();
        let server_host = network.host();
        let client_host = network.host();
        let server = Server::new(server_host.clone(), "rpc");
        server.register(Arc::new(Echo)).unwrap();

        let stream = client_host
            .open_stream(&server_host.id(), &ProtocolId::from("rpc"))
            .await
            .unwrap();
        let (read, write) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read);
        let mut writer = FrameWriter::new(write);

        for (seq, word) in ["one", "two", "three"].iter().enumerate() {
            writer
                .write_request(&RequestEnvelope {
                    service: "Echo".into(),
                    method: "Echo".into(),
                    seq: seq as u64,
                    args: json!(word),
                })
                .await
                .unwrap();
        }

        for (seq, word) in ["one", "two", "three"].iter().enumerate() {
            let response = reader.read_response().await.unwrap().unwrap();
            assert_eq!(response.seq, seq as u64);
            assert!(response.is_success());
            assert_eq!(response.reply, Some(json!(word)));
        }
    }

    #[tokio::test]
    async fn test_dispatch_failure_has_no_reply() {
        let network = MemoryNetwork::new();
        let server_host = network.host();
        let client_host = network.host();
        let _server = Server::new(server_host.clone(), "rpc");

        let stream = client_host
            .open_stream(&server_host.id(), &ProtocolId::from("rpc"))
            .await
            .unwrap();
        let (read, write) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read);
        let mut writer = FrameWriter::new(write);

        writer
            .write_request(&RequestEnvelope {
                service: "Missing".into(),
                method: "Echo".into(),
                seq: 0,
                args: json!(null),
            })
            .await
            .unwrap();

        let response = reader.read_response().await.unwrap().unwrap();
        assert_eq!(response.error_message(), "rpc: can't find service Missing");
        assert_eq!(response.reply, None);
    }

    #[tokio::test]
    async fn test_malformed_request_closes_only_that_stream() {
        let network = MemoryNetwork::new();
        let server_host = network.host();
        let client_host = network.host();
        let server = Server::new(server_host.clone(), "rpc");
        server.register(Arc::new(Echo)).unwrap();
        let protocol = ProtocolId::from("rpc");

        let mut broken = client_host
            .open_stream(&server_host.id(), &protocol)
            .await
            .unwrap();
        let healthy = client_host
            .open_stream(&server_host.id(), &protocol)
            .await
            .unwrap();

        broken.write_all(b"{not json}\n").await.unwrap();
        let (read, _write) = tokio::io::split(broken);
        let mut reader = FrameReader::new(read);
        assert!(reader.read_response().await.unwrap().is_none());

        let (read, write) = tokio::io::split(healthy);
        let mut reader = FrameReader::new(read);
        let mut writer = FrameWriter::new(write);
        writer
            .write_request(&RequestEnvelope {
                service: "Echo".into(),
                method: "Echo".into(),
                seq: 9,
                args: json!("still here"),
            })
            .await
            .unwrap();
        let response = reader.read_response().await.unwrap().unwrap();
        assert_eq!(response.reply, Some(json!("still here")));
    }

    #[tokio::test]
    async fn test_oversized_response_becomes_invalid_reply() {
        let network = MemoryNetwork::new();
        let server_host = network.host();
        let client_host = network.host();
        let server = Server::with_config(
            server_host.clone(),
            "rpc",
            ServerConfig { max_frame_bytes: 256 },
        );
        server.register(Arc::new(Echo)).unwrap();

        let stream = client_host
            .open_stream(&server_host.id(), &ProtocolId::from("rpc"))
            .await
            .unwrap();
        let (read, write) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read);
        let mut writer = FrameWriter::new(write);

        writer
            .write_request(&RequestEnvelope {
                service: "Echo".into(),
                method: "Repeat".into(),
                seq: 1,
                args: json!(1000),
            })
            .await
            .unwrap();

        let response = reader.read_response().await.unwrap().unwrap();
        assert_eq!(response.seq, 1);
        assert!(matches!(response.error, Some(RemoteError::InvalidReply { .. })));
        assert_eq!(response.reply, None);
    }
}
