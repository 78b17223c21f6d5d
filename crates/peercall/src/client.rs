//! RPC client: one `call` entry point for local and remote peers.

use crate::config::ClientConfig;
use crate::connection::{ConnectionMap, ConnectionSlot, PeerConnection};
use crate::error::{ConnectionError, Result, RpcError};
use crate::payload::ReplyTarget;
use crate::server::Server;
use crate::service::deliver_reply;
use peercall_host::{Host, PeerId, ProtocolId};
use peercall_protocol::RemoteError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, info};

pub struct Client {
    host: Arc<dyn Host>,
    protocol: ProtocolId,
    server: Option<Arc<Server>>,
    config: ClientConfig,
    connections: Arc<ConnectionMap>,
}

impl Client {
    /// Client without a local server; calls to this host fail
    pub fn new(host: Arc<dyn Host>, protocol: impl Into<ProtocolId>) -> Self {
        Self::with_config(host, protocol, None, ClientConfig::default())
    }

    /// Client that dispatches calls to this host straight into `server`
    pub fn with_server(
        host: Arc<dyn Host>,
        protocol: impl Into<ProtocolId>,
        server: Arc<Server>,
    ) -> Self {
        Self::with_config(host, protocol, Some(server), ClientConfig::default())
    }

    pub fn with_config(
        host: Arc<dyn Host>,
        protocol: impl Into<ProtocolId>,
        server: Option<Arc<Server>>,
        config: ClientConfig,
    ) -> Self {
        Self {
            host,
            protocol: protocol.into(),
            server,
            config,
            connections: Arc::new(ConnectionMap::new()),
        }
    }

    pub fn id(&self) -> PeerId {
        self.host.id()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Call `service.method` on `peer`.
    ///
    /// The empty peer and the host's own identity are served by the attached
    /// server without touching the network. On error `reply` may still hold
    /// whatever the method wrote before failing.
    pub async fn call<A, R>(
        &self,
        peer: &PeerId,
        service: &str,
        method: &str,
        args: &A,
        reply: &mut R,
    ) -> Result<()>
    where
        A: Serialize + Any + Send + Sync,
        R: DeserializeOwned + Any + Send,
    {
        if self.is_local(peer) {
            let server = self.server.as_ref().ok_or(ConnectionError::NoLocalServer)?;
            debug!(service, method, "Dispatching call locally");
            return server
                .registry()
                .invoke(service, method, args, ReplyTarget::Typed(reply))
                .map_err(RpcError::from);
        }

        let args = serde_json::to_value(args)
            .map_err(|e| RemoteError::invalid_argument(service, method, e))?;
        let conn = self.connection(peer).await?;

        let response = match self.config.call_timeout {
            Some(limit) => tokio::time::timeout(limit, conn.call(service, method, args))
                .await
                .map_err(|_| RpcError::Timeout {
                    service: service.to_string(),
                    method: method.to_string(),
                    elapsed: limit,
                })??,
            None => conn.call(service, method, args).await?,
        };

        if let Some(value) = response.reply {
            deliver_reply(reply, value, service, method)?;
        }
        match response.error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn is_local(&self, peer: &PeerId) -> bool {
        peer.is_local() || *peer == self.host.id()
    }

    /// Existing live connection to `peer`, or a freshly opened one.
    ///
    /// The map is never locked across a dial, so a slow peer only holds up
    /// callers of that peer.
    async fn connection(&self, peer: &PeerId) -> std::result::Result<Arc<PeerConnection>, ConnectionError> {
        let slot = self.slot(peer);
        let conn = slot.get_or_try_init(|| self.dial(peer)).await?;
        Ok(Arc::clone(conn))
    }

    /// Slot for `peer`, replacing one that holds a failed connection
    fn slot(&self, peer: &PeerId) -> Arc<ConnectionSlot> {
        let mut slot = self.connections.entry(peer.clone()).or_default();
        if slot.value().get().is_some_and(|conn| conn.is_closed()) {
            *slot.value_mut() = Arc::default();
        }
        Arc::clone(slot.value())
    }

    async fn dial(&self, peer: &PeerId) -> std::result::Result<Arc<PeerConnection>, ConnectionError> {
        let stream = self
            .host
            .open_stream(peer, &self.protocol)
            .await
            .map_err(|source| ConnectionError::Open {
                peer: peer.clone(),
                source,
            })?;
        let conn = PeerConnection::spawn(
            peer.clone(),
            stream,
            &self.config,
            Arc::downgrade(&self.connections),
        );
        info!(peer = %peer, protocol = %self.protocol, "Opened peer connection");
        Ok(conn)
    }

    /// Close the connection to `peer`, failing its pending calls.
    ///
    /// Returns false when no connection was open.
    pub async fn close_connection(&self, peer: &PeerId) -> bool {
        let conn = self
            .connections
            .remove(peer)
            .and_then(|(_, slot)| slot.get().cloned());
        match conn {
            Some(conn) => {
                conn.close().await;
                info!(peer = %conn.peer(), "Closed peer connection");
                true
            }
            None => false,
        }
    }

    /// Peers with a live connection
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self
            .connections
            .iter()
            .filter_map(|entry| {
                let conn = entry.value().get()?;
                (!conn.is_closed()).then(|| conn.peer().clone())
            })
            .collect();
        peers.sort();
        peers
    }
}
