//! In-process network of hosts connected by `tokio::io::duplex` pipes.
//!
//! Every stream pair shares a [`CancellationToken`]; disconnecting or closing
//! a host cancels the tokens of its links, which makes reads on both ends
//! return EOF and writes fail with `BrokenPipe`.

use crate::host::{Host, HostError, IncomingStream, Stream, StreamHandler};
use crate::peer::{PeerId, ProtocolId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info};

/// Pipe capacity per direction
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

struct Link {
    remote: PeerId,
    token: CancellationToken,
}

#[derive(Default)]
struct Endpoint {
    handlers: RwLock<HashMap<ProtocolId, StreamHandler>>,
    links: Mutex<Vec<Link>>,
}

impl Endpoint {
    fn track(&self, remote: PeerId, token: CancellationToken) {
        let mut links = self.links.lock();
        links.retain(|link| !link.token.is_cancelled());
        links.push(Link { remote, token });
    }

    fn cut(&self, remote: Option<&PeerId>) -> usize {
        let mut links = self.links.lock();
        let mut cut = 0;
        links.retain(|link| {
            let matches = remote.map_or(true, |peer| &link.remote == peer);
            if matches && !link.token.is_cancelled() {
                link.token.cancel();
                cut += 1;
            }
            !matches && !link.token.is_cancelled()
        });
        cut
    }
}

/// Registry of in-process hosts reachable from each other.
#[derive(Clone)]
pub struct MemoryNetwork {
    endpoints: Arc<DashMap<PeerId, Arc<Endpoint>>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            endpoints: Arc::new(DashMap::new()),
        }
    }

    /// Add a host with a random identity
    pub fn host(&self) -> Arc<MemoryHost> {
        self.host_with_id(PeerId::random())
    }

    /// Add a host with a chosen identity, replacing any host already using it
    pub fn host_with_id(&self, id: PeerId) -> Arc<MemoryHost> {
        let endpoint = Arc::new(Endpoint::default());
        self.endpoints.insert(id.clone(), endpoint.clone());
        debug!(peer = %id, "Memory host joined network");
        Arc::new(MemoryHost {
            id,
            endpoint,
            network: self.clone(),
            closed: CancellationToken::new(),
        })
    }
}

/// A host on a [`MemoryNetwork`].
pub struct MemoryHost {
    id: PeerId,
    endpoint: Arc<Endpoint>,
    network: MemoryNetwork,
    closed: CancellationToken,
}

impl MemoryHost {
    /// Break every open stream between this host and `peer`.
    ///
    /// Returns the number of links cut.
    pub fn disconnect(&self, peer: &PeerId) -> usize {
        let cut = self.endpoint.cut(Some(peer));
        if let Some(remote) = self.network.endpoints.get(peer) {
            remote.cut(Some(&self.id));
        }
        info!(peer = %self.id, remote = %peer, links = cut, "Disconnected");
        cut
    }

    /// Leave the network, breaking all open streams and dropping handlers.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.network
            .endpoints
            .remove_if(&self.id, |_, endpoint| Arc::ptr_eq(endpoint, &self.endpoint));
        self.endpoint.handlers.write().clear();
        let cut = self.endpoint.cut(None);
        info!(peer = %self.id, links = cut, "Memory host closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for MemoryHost {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn id(&self) -> PeerId {
        self.id.clone()
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &ProtocolId,
    ) -> Result<Stream, HostError> {
        if self.closed.is_cancelled() {
            return Err(HostError::Closed);
        }

        let remote = self
            .network
            .endpoints
            .get(peer)
            .map(|e| e.value().clone())
            .ok_or_else(|| HostError::UnknownPeer(peer.clone()))?;

        let handler = remote
            .handlers
            .read()
            .get(protocol)
            .cloned()
            .ok_or_else(|| HostError::ProtocolNotSupported {
                peer: peer.clone(),
                protocol: protocol.clone(),
            })?;

        let (local_end, remote_end) = tokio::io::duplex(DEFAULT_BUFFER_SIZE);
        let token = CancellationToken::new();
        self.endpoint.track(peer.clone(), token.clone());
        remote.track(self.id.clone(), token.clone());

        debug!(peer = %self.id, remote = %peer, protocol = %protocol, "Opened memory stream");

        handler(IncomingStream {
            remote: self.id.clone(),
            protocol: protocol.clone(),
            stream: Box::new(MemoryStream::new(remote_end, token.clone())),
        });

        Ok(Box::new(MemoryStream::new(local_end, token)))
    }

    fn set_stream_handler(&self, protocol: ProtocolId, handler: StreamHandler) {
        self.endpoint.handlers.write().insert(protocol, handler);
    }

    fn remove_stream_handler(&self, protocol: &ProtocolId) {
        self.endpoint.handlers.write().remove(protocol);
    }
}

/// One end of an in-memory stream that can be cut from outside.
pub struct MemoryStream {
    inner: DuplexStream,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl MemoryStream {
    fn new(inner: DuplexStream, token: CancellationToken) -> Self {
        let cancelled = Box::pin(token.clone().cancelled_owned());
        Self {
            inner,
            token,
            cancelled,
        }
    }

    fn broken() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "memory stream disconnected")
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        // A cut link reads as EOF
        if this.token.is_cancelled() || this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(Self::broken()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(Self::broken()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
