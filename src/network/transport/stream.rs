//! Persistent streaming transport over WebSocket
//!
//! Each connection multiplexes many requests: every outbound frame carries an
//! id and replies are routed back to the waiting caller by that id. Streamed
//! transfers arrive as a run of chunk frames closed by `End`.
//!
//! Connections are pooled per peer. A pool holds at most
//! `max_connections_per_peer` sockets; when all of them are busy new calls
//! share the least loaded one. Connections left idle are closed by
//! [`Transport::close_idle`].

use super::{unexpected, ChunkStream, Transport, TransportError, TransportKind};
use crate::network::message::{
    Frame, FrameBody, PeerAdvert, PeerId, PeerRequest, PeerResponse, TransactionChunk,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type PendingMap = Arc<Mutex<HashMap<u64, Pending>>>;

/// Chunks buffered per open stream before the reader waits on the consumer
const STREAM_BUFFER_CHUNKS: usize = 4;

/// A caller waiting on a connection
enum Pending {
    Call(oneshot::Sender<Result<PeerResponse, TransportError>>),
    Stream(mpsc::Sender<Result<TransactionChunk, TransportError>>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Connection
// =============================================================================

/// One WebSocket to one peer
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    next_id: AtomicU64,
    in_use: AtomicUsize,
    last_used: Mutex<Instant>,
    closed: CancellationToken,
}

impl Connection {
    async fn open(url: &str) -> Result<Arc<Self>, TransportError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut source) = socket.split();

        let (outbound, mut rx) = mpsc::unbounded_channel::<Message>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        // Writer task
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_closed.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            writer_closed.cancel();
        });

        // Reader task
        let reader_closed = closed.clone();
        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    msg = source.next() => msg,
                };
                match msg {
                    Some(Ok(Message::Text(text))) => tokio::select! {
                        _ = reader_closed.cancelled() => break,
                        _ = route(&reader_pending, text.as_bytes()) => {}
                    },
                    Some(Ok(Message::Binary(data))) => tokio::select! {
                        _ = reader_closed.cancelled() => break,
                        _ = route(&reader_pending, &data) => {}
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }
            reader_closed.cancel();
            // Dropping the senders wakes every waiter with `Closed`
            lock(&reader_pending).clear();
        });

        Ok(Arc::new(Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            in_use: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
            closed,
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    fn idle_for(&self) -> Duration {
        lock(&self.last_used).elapsed()
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn register(self: &Arc<Self>, pending: Pending) -> (u64, InUse) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.pending).insert(id, pending);
        self.in_use.fetch_add(1, Ordering::SeqCst);
        (
            id,
            InUse {
                connection: Arc::clone(self),
                id,
            },
        )
    }

    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let json = serde_json::to_string(&frame)?;
        self.outbound
            .send(Message::Text(json.into()))
            .map_err(|_| TransportError::Closed)
    }

    async fn call(self: &Arc<Self>, request: PeerRequest) -> Result<PeerResponse, TransportError> {
        let (tx, rx) = oneshot::channel();
        let (id, _in_use) = self.register(Pending::Call(tx));

        self.send(Frame::new(id, FrameBody::Request(request)))?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    fn stream(self: &Arc<Self>, hash: &str) -> Result<ChunkStream, TransportError> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER_CHUNKS);
        let (id, in_use) = self.register(Pending::Stream(tx));

        self.send(Frame::new(
            id,
            FrameBody::Request(PeerRequest::StreamTransaction {
                hash: hash.to_string(),
            }),
        ))?;

        // The in-use marker lives as long as the stream
        let chunks = futures::stream::unfold((rx, in_use), |(mut rx, in_use)| async move {
            rx.recv().await.map(|item| (item, (rx, in_use)))
        });
        Ok(chunks.boxed())
    }
}

/// Marks a connection busy for one request; unregisters the request on drop
struct InUse {
    connection: Arc<Connection>,
    id: u64,
}

impl Drop for InUse {
    fn drop(&mut self) {
        lock(&self.connection.pending).remove(&self.id);
        *lock(&self.connection.last_used) = Instant::now();
        self.connection.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Deliver an inbound frame to whoever is waiting on its id. A stream
/// consumer that falls behind holds up the reader.
async fn route(pending: &PendingMap, data: &[u8]) {
    let frame = match Frame::from_bytes(data) {
        Ok(frame) => frame,
        Err(e) => {
            log::debug!("Dropping malformed stream frame: {}", e);
            return;
        }
    };

    let id = frame.id;
    let (stream, item) = {
        let mut pending = lock(pending);
        match frame.body {
            FrameBody::Response(response) => match pending.remove(&id) {
                Some(Pending::Call(tx)) => {
                    let _ = tx.send(Ok(response));
                    return;
                }
                Some(Pending::Stream(tx)) => (tx, Err(unexpected(&response))),
                None => return,
            },
            FrameBody::Chunk(chunk) => match pending.get(&id) {
                Some(Pending::Stream(tx)) => (tx.clone(), Ok(chunk)),
                _ => return,
            },
            FrameBody::End => {
                pending.remove(&id);
                return;
            }
            FrameBody::Failed { reason } => match pending.remove(&id) {
                Some(Pending::Call(tx)) => {
                    let _ = tx.send(Err(TransportError::Protocol(reason)));
                    return;
                }
                Some(Pending::Stream(tx)) => (tx, Err(TransportError::Protocol(reason))),
                None => return,
            },
            FrameBody::Request(request) => {
                log::debug!("Ignoring pushed {} on client stream", request.type_name());
                return;
            }
        }
    };

    if stream.send(item).await.is_err() {
        lock(pending).remove(&id);
    }
}

// =============================================================================
// Transport
// =============================================================================

#[derive(Default)]
struct PeerPool {
    connections: tokio::sync::Mutex<Vec<Arc<Connection>>>,
}

/// Pooled WebSocket transport
pub struct StreamTransport {
    pools: Mutex<HashMap<PeerId, Arc<PeerPool>>>,
    max_per_peer: usize,
}

impl StreamTransport {
    pub fn new(max_per_peer: usize) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            max_per_peer: max_per_peer.max(1),
        }
    }

    /// Open connections to `peer_id`
    pub async fn connection_count(&self, peer_id: &str) -> usize {
        let pool = lock(&self.pools).get(peer_id).cloned();
        match pool {
            Some(pool) => pool.connections.lock().await.len(),
            None => 0,
        }
    }

    async fn connection(&self, peer: &PeerAdvert) -> Result<Arc<Connection>, TransportError> {
        let pool = Arc::clone(lock(&self.pools).entry(peer.id.clone()).or_default());
        let mut connections = pool.connections.lock().await;
        connections.retain(|c| !c.is_closed());

        if let Some(idle) = connections.iter().find(|c| c.in_use() == 0) {
            return Ok(Arc::clone(idle));
        }

        if connections.len() < self.max_per_peer {
            let connection = Connection::open(&peer.ws_url()).await?;
            log::debug!(
                "Opened stream connection {} to {}",
                connections.len() + 1,
                peer.id
            );
            connections.push(Arc::clone(&connection));
            return Ok(connection);
        }

        connections
            .iter()
            .min_by_key(|c| c.in_use())
            .cloned()
            .ok_or(TransportError::Closed)
    }

    /// Peers with a pool entry
    pub fn pool_count(&self) -> usize {
        lock(&self.pools).len()
    }

    fn pools(&self) -> Vec<(PeerId, Arc<PeerPool>)> {
        lock(&self.pools)
            .iter()
            .map(|(id, pool)| (id.clone(), Arc::clone(pool)))
            .collect()
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn call(
        &self,
        peer: &PeerAdvert,
        request: PeerRequest,
    ) -> Result<PeerResponse, TransportError> {
        if matches!(request, PeerRequest::StreamTransaction { .. }) {
            return Err(TransportError::Unsupported("StreamTransaction as a call"));
        }
        self.connection(peer).await?.call(request).await
    }

    async fn open_stream(
        &self,
        peer: &PeerAdvert,
        hash: &str,
    ) -> Result<ChunkStream, TransportError> {
        self.connection(peer).await?.stream(hash)
    }

    async fn close_idle(&self, idle: Duration) -> usize {
        let mut closed = 0;
        let mut empty = Vec::new();

        for (peer_id, pool) in self.pools() {
            let mut connections = pool.connections.lock().await;
            connections.retain(|c| {
                let stale = c.is_closed() || (c.in_use() == 0 && c.idle_for() >= idle);
                if stale {
                    c.close();
                    closed += 1;
                }
                !stale
            });
            if connections.is_empty() {
                empty.push(peer_id);
            }
        }

        if !empty.is_empty() {
            let mut pools = lock(&self.pools);
            for peer_id in empty {
                // Keep pools a concurrent call has just connected through
                let unused = pools.get(&peer_id).is_some_and(|pool| {
                    pool.connections
                        .try_lock()
                        .is_ok_and(|connections| connections.is_empty())
                });
                if unused {
                    pools.remove(&peer_id);
                }
            }
        }

        if closed > 0 {
            log::debug!("Recycled {} idle stream connections", closed);
        }
        closed
    }

    async fn shutdown(&self) {
        for (_, pool) in self.pools() {
            for connection in pool.connections.lock().await.drain(..) {
                connection.close();
            }
        }
        lock(&self.pools).clear();
    }
}
