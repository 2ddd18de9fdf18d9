//! Gossip distributor
//!
//! Outbound, a transaction is announced to `ceil(sqrt(N))` randomly chosen
//! healthy peers, skipping peers already known to hold it. Inbound, a
//! notification is checked against the Bloom filter; a new hash is fetched
//! from the notifying peer (streamed above the stream threshold), verified,
//! handed to the ledger and re-gossiped with one more hop.
//!
//! Check-and-claim of a hash happens under one lock, so concurrent
//! notifications for the same transaction reach the ledger at most once.

use crate::config::GossipConfig;
use crate::gossip::bloom::BloomFilter;
use crate::gossip::cache::PayloadCache;
use crate::gossip::ledger::{AcceptOutcome, LedgerEngine};
use crate::network::message::{PeerRequest, PeerResponse, TransactionNotification, TxHash};
use crate::network::negotiator::{NegotiationError, Negotiator};
use crate::network::peer::{LocalPeer, PeerNode};
use crate::network::registry::PeerRegistry;
use crate::network::transport::TransportError;
use crate::queue::{DistributionTarget, OfflineQueue, QueueError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use rand::seq::SliceRandom;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Gossip errors
#[derive(Error, Debug)]
pub enum GossipError {
    #[error("Transaction of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },
    #[error("Invalid notification: {0}")]
    InvalidNotification(String),
    #[error("Payload does not match hash {0}")]
    HashMismatch(TxHash),
    #[error("Payload is {actual} bytes, notification declared {declared}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("Transaction {0} not found on peer")]
    NotFound(TxHash),
    #[error("Peer refused: {0}")]
    Remote(String),
    #[error("Stream stalled or was cut short: {0}")]
    Stream(String),
    #[error("Only {healthy} healthy peers, need {required}")]
    InsufficientPeers { healthy: usize, required: usize },
    #[error("No peer accepted the notification")]
    NoPeersReached,
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Answer to `submit_for_distribution`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Held in the offline queue until enough peers are healthy
    Queued,
    Distributing { notified: usize },
}

/// What happened to an inbound notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// Seen before; acknowledged without action
    AlreadyKnown,
    /// Another notification for this hash is being fetched
    InFlight,
    Accepted { forwarded: usize },
    /// Ledger refused it; not re-gossiped
    Rejected(String),
}

/// Lowercase hex SHA-256 of a payload
pub fn transaction_hash(payload: &[u8]) -> TxHash {
    hex::encode(Sha256::digest(payload))
}

/// `ceil(sqrt(n))` peers per round
pub fn fanout_size(healthy: usize) -> usize {
    let mut root = (healthy as f64).sqrt() as usize;
    while root * root < healthy {
        root += 1;
    }
    while root > 0 && (root - 1) * (root - 1) >= healthy {
        root -= 1;
    }
    root
}

fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Bloom key recording that `peer` holds `hash`
fn knowledge_key(peer: &str, hash: &str) -> String {
    format!("{}:{}", peer, hash)
}

/// Dedup state. The bloom holds settled hashes and (peer, hash) knowledge;
/// `pending` holds hashes currently being fetched.
struct SeenState {
    bloom: BloomFilter,
    pending: HashSet<TxHash>,
}

pub struct GossipDistributor {
    local: Arc<LocalPeer>,
    registry: Arc<PeerRegistry>,
    negotiator: Arc<Negotiator>,
    ledger: Arc<dyn LedgerEngine>,
    queue: Arc<OfflineQueue>,
    seen: Mutex<SeenState>,
    cache: RwLock<PayloadCache>,
    config: GossipConfig,
    min_healthy_peers: usize,
}

impl GossipDistributor {
    pub fn new(
        local: Arc<LocalPeer>,
        registry: Arc<PeerRegistry>,
        negotiator: Arc<Negotiator>,
        ledger: Arc<dyn LedgerEngine>,
        queue: Arc<OfflineQueue>,
        config: GossipConfig,
        min_healthy_peers: usize,
    ) -> Self {
        Self {
            local,
            registry,
            negotiator,
            ledger,
            queue,
            seen: Mutex::new(SeenState {
                bloom: BloomFilter::new(config.bloom_bits, config.bloom_hashes),
                pending: HashSet::new(),
            }),
            cache: RwLock::new(PayloadCache::new(config.payload_cache_entries)),
            config,
            min_healthy_peers,
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Entry point for the ledger: push a new transaction into the network
    pub async fn submit_for_distribution(
        &self,
        payload: Vec<u8>,
    ) -> Result<(TxHash, SubmitOutcome), GossipError> {
        if payload.len() > self.config.max_transaction_size {
            return Err(GossipError::TooLarge {
                size: payload.len(),
                max: self.config.max_transaction_size,
            });
        }

        let (hash, payload) = self.cache(payload).await;
        self.seen.lock().await.bloom.insert(hash.as_bytes());

        let outcome = self.distribute(&hash, &payload).await?;
        Ok((hash, outcome))
    }

    /// Announce a transaction to a fanout set, or queue it when too few peers
    /// are healthy, older transactions are still queued, or nobody could be
    /// reached
    pub async fn distribute(
        &self,
        hash: &str,
        payload: &[u8],
    ) -> Result<SubmitOutcome, GossipError> {
        let healthy = self.registry.healthy_count().await;
        if !self.queue.is_empty().await {
            // Submissions leave in order: go behind the backlog
            log::info!("Offline queue not drained yet, queueing {}", hash);
            self.queue.enqueue(hash, payload).await?;
            if healthy >= self.min_healthy_peers {
                self.queue.wake();
            }
            return Ok(SubmitOutcome::Queued);
        }
        if healthy < self.min_healthy_peers {
            log::info!(
                "{} healthy peers (minimum {}), queueing {}",
                healthy,
                self.min_healthy_peers,
                hash
            );
            self.queue.enqueue(hash, payload).await?;
            return Ok(SubmitOutcome::Queued);
        }

        let notified = self.fanout(self.origin_notification(hash, payload).await, None).await;
        if notified == 0 {
            log::warn!("No peer reachable for {}, queueing", hash);
            self.queue.enqueue(hash, payload).await?;
            return Ok(SubmitOutcome::Queued);
        }

        Ok(SubmitOutcome::Distributing { notified })
    }

    /// Notify a random `ceil(sqrt(healthy))` subset of healthy peers that do
    /// not already hold the transaction. Returns how many acknowledged.
    pub async fn fanout(
        &self,
        notification: TransactionNotification,
        exclude: Option<&str>,
    ) -> usize {
        let healthy = self.registry.list_healthy().await;
        let size = fanout_size(healthy.len());

        let candidates: Vec<PeerNode> = {
            let seen = self.seen.lock().await;
            healthy
                .into_iter()
                .filter(|p| Some(p.id.as_str()) != exclude && p.id != notification.origin)
                .filter(|p| {
                    !seen
                        .bloom
                        .contains(knowledge_key(&p.id, &notification.hash).as_bytes())
                })
                .collect()
        };

        let targets: Vec<PeerNode> = {
            let mut rng = rand::thread_rng();
            candidates.choose_multiple(&mut rng, size).cloned().collect()
        };
        if targets.is_empty() {
            return 0;
        }

        let sender = self.local.id().await;
        let sends = targets.iter().map(|peer| {
            let request = PeerRequest::NotifyTransaction {
                sender: sender.clone(),
                notification: notification.clone(),
            };
            async move { (peer, self.negotiator.send(&peer.id, request).await) }
        });
        let results = futures::future::join_all(sends).await;

        let mut notified = 0;
        let mut seen = self.seen.lock().await;
        for (peer, result) in results {
            match result {
                Ok(PeerResponse::Ack) => {
                    seen.bloom
                        .insert(knowledge_key(&peer.id, &notification.hash).as_bytes());
                    notified += 1;
                }
                Ok(other) => {
                    log::debug!("{} answered notification with {}", peer.id, other.type_name());
                }
                Err(e) => log::debug!("Notification to {} failed: {}", peer.id, e),
            }
        }

        log::debug!(
            "Gossiped {} (hop {}) to {}/{} peers",
            notification.hash,
            notification.hop_count,
            notified,
            targets.len()
        );
        notified
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Handle a notification from `sender`. Idempotent per hash.
    pub async fn on_notification(
        &self,
        sender: &str,
        notification: TransactionNotification,
    ) -> Result<NotificationOutcome, GossipError> {
        if let Err(e) = self.validate(&notification) {
            self.penalize(sender, &e).await;
            return Err(e);
        }

        let hash = notification.hash.clone();
        {
            let mut seen = self.seen.lock().await;
            seen.bloom.insert(knowledge_key(sender, &hash).as_bytes());
            if seen.bloom.contains(hash.as_bytes()) {
                return Ok(NotificationOutcome::AlreadyKnown);
            }
            if !seen.pending.insert(hash.clone()) {
                return Ok(NotificationOutcome::InFlight);
            }
        }

        let payload = match notification.inline_payload.clone() {
            Some(inline) => Ok(Bytes::from(inline)),
            None => self.fetch(sender, &notification).await,
        };
        let payload = payload.and_then(|p| verify(&notification, p));

        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                // Release the hash so another notification can retry
                self.seen.lock().await.pending.remove(&hash);
                if matches!(
                    e,
                    GossipError::HashMismatch(_)
                        | GossipError::SizeMismatch { .. }
                        | GossipError::Stream(_)
                ) {
                    self.penalize(sender, &e).await;
                }
                return Err(e);
            }
        };

        {
            let mut seen = self.seen.lock().await;
            seen.pending.remove(&hash);
            seen.bloom.insert(hash.as_bytes());
        }
        self.cache.write().await.insert(hash.clone(), payload.clone());

        match self.ledger.accept_transaction(&payload).await {
            AcceptOutcome::Accepted => {
                let forwarded = if notification.hop_count.saturating_add(1) < self.config.max_hops {
                    let onward = TransactionNotification {
                        hop_count: notification.hop_count + 1,
                        inline_payload: self.inline(&payload),
                        ..notification
                    };
                    self.fanout(onward, Some(sender)).await
                } else {
                    log::debug!("{} reached the hop limit", hash);
                    0
                };
                log::info!("Accepted transaction {} from {}", hash, sender);
                Ok(NotificationOutcome::Accepted { forwarded })
            }
            AcceptOutcome::Rejected(reason) => {
                log::info!("Ledger rejected {}: {}", hash, reason);
                Ok(NotificationOutcome::Rejected(reason))
            }
        }
    }

    /// Pull a payload from the peer that announced it
    pub async fn fetch(
        &self,
        sender: &str,
        notification: &TransactionNotification,
    ) -> Result<Bytes, GossipError> {
        if notification.size > self.config.stream_threshold as u64 {
            return self.fetch_streamed(sender, notification).await;
        }

        let request = PeerRequest::GetTransaction {
            hash: notification.hash.clone(),
        };
        match self.negotiator.send(sender, request).await? {
            PeerResponse::Transaction { payload } => Ok(Bytes::from(payload)),
            PeerResponse::NotFound => Err(GossipError::NotFound(notification.hash.clone())),
            PeerResponse::Error { reason } => Err(GossipError::Remote(reason)),
            other => Err(GossipError::Remote(format!(
                "unexpected {}",
                other.type_name()
            ))),
        }
    }

    /// Look up a payload this node holds
    pub async fn lookup(&self, hash: &str) -> Option<Bytes> {
        self.cache.read().await.get(hash)
    }

    /// Whether the hash is settled in the filter
    pub async fn is_known(&self, hash: &str) -> bool {
        self.seen.lock().await.bloom.contains(hash.as_bytes())
    }

    /// Forget everything seen so far
    pub async fn reset_bloom(&self) {
        let mut seen = self.seen.lock().await;
        log::info!(
            "Resetting gossip filter after {} entries (est. false positives {:.5})",
            seen.bloom.len(),
            seen.bloom.estimated_false_positive_rate()
        );
        seen.bloom.clear();
    }

    /// Clear the Bloom filter on a timer until shutdown
    pub async fn run_bloom_reset(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.bloom_reset_interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.reset_bloom().await,
            }
        }
    }

    /// Store a payload so peers can fetch it; returns its hash
    pub async fn cache_payload(&self, payload: Vec<u8>) -> TxHash {
        self.cache(payload).await.0
    }

    // =========================================================================
    // Private helpers
    // =========================================================================

    async fn cache(&self, payload: Vec<u8>) -> (TxHash, Bytes) {
        let hash = transaction_hash(&payload);
        let payload = Bytes::from(payload);
        self.cache.write().await.insert(hash.clone(), payload.clone());
        (hash, payload)
    }

    async fn origin_notification(&self, hash: &str, payload: &[u8]) -> TransactionNotification {
        TransactionNotification {
            hash: hash.to_string(),
            size: payload.len() as u64,
            origin: self.local.id().await,
            hop_count: 0,
            inline_payload: self.inline(payload),
        }
    }

    fn inline(&self, payload: &[u8]) -> Option<Vec<u8>> {
        (payload.len() <= self.config.inline_threshold).then(|| payload.to_vec())
    }

    fn validate(&self, notification: &TransactionNotification) -> Result<(), GossipError> {
        if !is_valid_hash(&notification.hash) {
            return Err(GossipError::InvalidNotification(format!(
                "malformed hash '{}'",
                notification.hash
            )));
        }
        if notification.size > self.config.max_transaction_size as u64 {
            return Err(GossipError::InvalidNotification(format!(
                "declared size {} exceeds limit",
                notification.size
            )));
        }
        if let Some(inline) = &notification.inline_payload {
            if inline.len() > self.config.inline_threshold {
                return Err(GossipError::InvalidNotification(format!(
                    "inline payload of {} bytes exceeds limit",
                    inline.len()
                )));
            }
        }
        Ok(())
    }

    async fn penalize(&self, sender: &str, error: &GossipError) {
        log::warn!("Dropping notification from {}: {}", sender, error);
        if self.registry.get(sender).await.is_some() {
            let _ = self.registry.record_failure(sender).await;
        }
    }

    async fn fetch_streamed(
        &self,
        sender: &str,
        notification: &TransactionNotification,
    ) -> Result<Bytes, GossipError> {
        let declared = notification.size;
        let mut stream = self.negotiator.open_stream(sender, &notification.hash).await?;
        let mut buf = BytesMut::with_capacity(declared as usize);
        let mut expected_index = 0u32;

        loop {
            let next = timeout(self.config.chunk_timeout(), stream.next())
                .await
                .map_err(|_| {
                    GossipError::Stream(format!(
                        "no chunk within {:?}",
                        self.config.chunk_timeout()
                    ))
                })?;

            let chunk = match next {
                Some(chunk) => chunk?,
                None => break,
            };

            if chunk.index != expected_index || chunk.index >= chunk.total {
                return Err(GossipError::Stream(format!(
                    "chunk {} of {} out of order",
                    chunk.index, chunk.total
                )));
            }
            if buf.len() as u64 + chunk.data.len() as u64 > declared {
                return Err(GossipError::SizeMismatch {
                    declared,
                    actual: buf.len() as u64 + chunk.data.len() as u64,
                });
            }

            buf.extend_from_slice(&chunk.data);
            expected_index += 1;
            if expected_index == chunk.total {
                break;
            }
        }

        log::debug!(
            "Streamed {} ({} bytes, {} chunks) from {}",
            notification.hash,
            buf.len(),
            expected_index,
            sender
        );
        Ok(buf.freeze())
    }
}

/// Payload must hash to the announced hash and have the announced size
fn verify(notification: &TransactionNotification, payload: Bytes) -> Result<Bytes, GossipError> {
    if payload.len() as u64 != notification.size {
        return Err(GossipError::SizeMismatch {
            declared: notification.size,
            actual: payload.len() as u64,
        });
    }
    if transaction_hash(&payload) != notification.hash {
        return Err(GossipError::HashMismatch(notification.hash.clone()));
    }
    Ok(payload)
}

#[async_trait]
impl DistributionTarget for GossipDistributor {
    async fn ready(&self) -> bool {
        self.registry.healthy_count().await >= self.min_healthy_peers
    }

    async fn redistribute(&self, hash: &str, payload: &[u8]) -> Result<usize, GossipError> {
        let healthy = self.registry.healthy_count().await;
        if healthy < self.min_healthy_peers {
            return Err(GossipError::InsufficientPeers {
                healthy,
                required: self.min_healthy_peers,
            });
        }

        if self.lookup(hash).await.is_none() {
            self.cache.write().await.insert(hash.to_string(), Bytes::copy_from_slice(payload));
        }
        self.seen.lock().await.bloom.insert(hash.as_bytes());

        match self.fanout(self.origin_notification(hash, payload).await, None).await {
            0 => Err(GossipError::NoPeersReached),
            notified => Ok(notified),
        }
    }
}
