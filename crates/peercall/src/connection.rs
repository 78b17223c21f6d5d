//! Per-peer connection multiplexer.
//!
//! One stream per destination peer. Callers serialize only on the
//! "allocate sequence number + write request" step; a single reader task
//! routes each response to the caller waiting on its sequence number.

use crate::config::ClientConfig;
use crate::error::{ConnectionError, ProtocolError, RpcError};
use dashmap::DashMap;
use parking_lot::Mutex;
use peercall_host::{PeerId, Stream};
use peercall_protocol::{
    FrameReader, FrameWriter, RequestEnvelope, ResponseEnvelope, SequenceNumber,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{oneshot, OnceCell};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// At most one connection per peer. A slot is filled by the first caller to
/// dial; concurrent first calls wait on that dial instead of opening their own.
pub(crate) type ConnectionSlot = OnceCell<Arc<PeerConnection>>;

pub(crate) type ConnectionMap = DashMap<PeerId, Arc<ConnectionSlot>>;

type Delivery = Result<ResponseEnvelope, ConnectionError>;

#[derive(Default)]
struct PendingTable {
    calls: HashMap<SequenceNumber, oneshot::Sender<Delivery>>,
    /// Calls whose caller stopped waiting; their responses are dropped
    abandoned: HashSet<SequenceNumber>,
    /// Set once the connection failed; no call may be added afterwards
    closed: Option<String>,
}

pub(crate) struct PeerConnection {
    peer: PeerId,
    writer: tokio::sync::Mutex<FrameWriter<WriteHalf<Stream>>>,
    next_seq: AtomicU64,
    pending: Mutex<PendingTable>,
    reader: Mutex<Option<AbortHandle>>,
}

impl PeerConnection {
    /// Wrap an opened stream and start its response reader
    pub(crate) fn spawn(
        peer: PeerId,
        stream: Stream,
        config: &ClientConfig,
        connections: Weak<ConnectionMap>,
    ) -> Arc<Self> {
        let (read, write) = tokio::io::split(stream);
        let conn = Arc::new(Self {
            peer,
            writer: tokio::sync::Mutex::new(FrameWriter::with_max_frame_bytes(
                write,
                config.max_frame_bytes,
            )),
            next_seq: AtomicU64::new(0),
            pending: Mutex::new(PendingTable::default()),
            reader: Mutex::new(None),
        });

        let reader = FrameReader::with_max_frame_bytes(read, config.max_frame_bytes);
        let task = tokio::spawn(read_loop(Arc::downgrade(&conn), reader, connections));
        *conn.reader.lock() = Some(task.abort_handle());
        conn
    }

    pub(crate) fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.pending.lock().closed.is_some()
    }

    /// Send one request and wait for its response.
    ///
    /// Dropping the returned future abandons the call; if it is dropped
    /// mid-write the stream can no longer be framed and the connection fails.
    pub(crate) async fn call(
        &self,
        service: &str,
        method: &str,
        args: Value,
    ) -> Result<ResponseEnvelope, RpcError> {
        let (tx, rx) = oneshot::channel();

        let mut guard = {
            let mut writer = self.writer.lock().await;
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            self.register(seq, tx)?;

            let mut guard = CallGuard {
                conn: self,
                seq,
                stage: CallStage::Writing,
            };
            let request = RequestEnvelope {
                service: service.to_string(),
                method: method.to_string(),
                seq,
                args,
            };

            if let Err(e) = writer.write_request(&request).await {
                guard.stage = CallStage::Done;
                self.pending.lock().calls.remove(&seq);
                if e.is_recoverable_on_write() {
                    return Err(ProtocolError::Codec {
                        peer: self.peer.clone(),
                        source: e,
                    }
                    .into());
                }
                drop(writer);
                let reason = format!("failed to write request: {e}");
                self.fail(&reason);
                return Err(ConnectionError::Lost {
                    peer: self.peer.clone(),
                    reason,
                }
                .into());
            }
            guard.stage = CallStage::Waiting;
            debug!(peer = %self.peer, seq, service, method, "Request sent");
            guard
        };

        let delivery = rx.await;
        guard.stage = CallStage::Done;
        match delivery {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ConnectionError::Lost {
                peer: self.peer.clone(),
                reason: "connection dropped".to_string(),
            }
            .into()),
        }
    }

    fn register(&self, seq: SequenceNumber, tx: oneshot::Sender<Delivery>) -> Result<(), ConnectionError> {
        let mut pending = self.pending.lock();
        if let Some(reason) = &pending.closed {
            return Err(ConnectionError::Lost {
                peer: self.peer.clone(),
                reason: reason.clone(),
            });
        }
        pending.calls.insert(seq, tx);
        Ok(())
    }

    /// Hand a response to its waiting caller
    fn deliver(&self, response: ResponseEnvelope) -> Result<(), ProtocolError> {
        let seq = response.seq;
        let mut pending = self.pending.lock();
        if let Some(tx) = pending.calls.remove(&seq) {
            drop(pending);
            // The caller may have given up between lookup and send
            let _ = tx.send(Ok(response));
            return Ok(());
        }
        if pending.abandoned.remove(&seq) {
            debug!(peer = %self.peer, seq, "Dropping response for abandoned call");
            return Ok(());
        }
        Err(ProtocolError::UnexpectedSequence {
            peer: self.peer.clone(),
            seq,
        })
    }

    fn abandon(&self, seq: SequenceNumber) {
        let mut pending = self.pending.lock();
        if pending.calls.remove(&seq).is_some() && pending.closed.is_none() {
            pending.abandoned.insert(seq);
        }
    }

    /// Fail every pending call and refuse new ones. Returns the number of
    /// callers woken.
    pub(crate) fn fail(&self, reason: &str) -> usize {
        let drained = {
            let mut pending = self.pending.lock();
            if pending.closed.is_some() {
                return 0;
            }
            pending.closed = Some(reason.to_string());
            pending.abandoned.clear();
            std::mem::take(&mut pending.calls)
        };

        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(ConnectionError::Lost {
                peer: self.peer.clone(),
                reason: reason.to_string(),
            }));
        }
        warn!(peer = %self.peer, pending = count, reason, "Peer connection failed");
        count
    }

    /// Tear the connection down from the client side
    pub(crate) async fn close(&self) {
        self.fail("closed by client");
        self.abort_reader();
        let _ = self.writer.lock().await.shutdown().await;
    }

    fn abort_reader(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CallStage {
    Writing,
    Waiting,
    Done,
}

/// Cleans up after a caller that stops waiting before its response arrives
struct CallGuard<'a> {
    conn: &'a PeerConnection,
    seq: SequenceNumber,
    stage: CallStage,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        match self.stage {
            CallStage::Writing => {
                self.conn.fail("request write cancelled");
            }
            CallStage::Waiting => self.conn.abandon(self.seq),
            CallStage::Done => {}
        }
    }
}

async fn read_loop(
    conn: Weak<PeerConnection>,
    mut reader: FrameReader<ReadHalf<Stream>>,
    connections: Weak<ConnectionMap>,
) {
    let reason = loop {
        let frame = reader.read_response().await;
        let Some(live) = conn.upgrade() else {
            return;
        };
        match frame {
            Ok(Some(response)) => {
                if let Err(e) = live.deliver(response) {
                    break e.to_string();
                }
            }
            Ok(None) => break "stream closed by peer".to_string(),
            Err(source) => {
                break ProtocolError::Codec {
                    peer: live.peer.clone(),
                    source,
                }
                .to_string()
            }
        }
    };

    let Some(live) = conn.upgrade() else {
        return;
    };
    live.fail(&reason);

    if let Some(connections) = connections.upgrade() {
        let discarded = connections.remove_if(live.peer(), |_, slot| {
            slot.get().is_some_and(|c| Arc::ptr_eq(c, &live))
        });
        if discarded.is_some() {
            info!(peer = %live.peer(), "Discarded failed peer connection");
        }
    }
}
