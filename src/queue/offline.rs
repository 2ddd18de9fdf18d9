//! Durable offline queue
//!
//! Outbound transactions land here when the node cannot reach enough healthy
//! peers. Items keep their enqueue order; every drain pass walks the whole
//! queue oldest first, so a failing item never lets a later one overtake it.
//! The queue file is rewritten atomically after every change.

use crate::config::QueueConfig;
use crate::gossip::GossipError;
use crate::network::message::{serde_hex, TxHash};
use crate::queue::dead_letter::{DeadLetter, DeadLetterSink};
use crate::storage::{Storage, StorageError, QUEUE_FILE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// One queued outbound transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Insertion order
    pub seq: u64,
    pub hash: TxHash,
    #[serde(with = "serde_hex")]
    pub payload: Vec<u8>,
    pub queued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
}

/// On-disk form of the queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub next_seq: u64,
    pub pending: Vec<QueueItem>,
    pub dead_letters: Vec<DeadLetter>,
}

/// Where drained items are sent
#[async_trait]
pub trait DistributionTarget: Send + Sync {
    /// Whether a drain pass has any chance of succeeding
    async fn ready(&self) -> bool;

    /// Distribute one queued item; returns peers reached. Must not enqueue.
    async fn redistribute(&self, hash: &str, payload: &[u8]) -> Result<usize, GossipError>;
}

/// Result of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Hashes in the order they were attempted
    pub attempted: Vec<TxHash>,
    pub delivered: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Skipped because the target was not ready
    pub skipped: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    pending: BTreeMap<u64, QueueItem>,
    dead_letters: Vec<DeadLetter>,
}

impl QueueState {
    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            next_seq: self.next_seq,
            pending: self.pending.values().cloned().collect(),
            dead_letters: self.dead_letters.clone(),
        }
    }
}

pub struct OfflineQueue {
    state: Mutex<QueueState>,
    /// One drain pass at a time
    draining: Mutex<()>,
    storage: Storage,
    sink: Arc<dyn DeadLetterSink>,
    config: QueueConfig,
    wake: Notify,
}

impl OfflineQueue {
    /// Load the queue from `queue.json`. An unreadable file is fatal.
    pub fn open(
        storage: Storage,
        config: QueueConfig,
        sink: Arc<dyn DeadLetterSink>,
    ) -> Result<Self, QueueError> {
        let snapshot: QueueSnapshot = storage.load(QUEUE_FILE)?.unwrap_or_default();

        let mut state = QueueState {
            next_seq: snapshot.next_seq,
            pending: BTreeMap::new(),
            dead_letters: snapshot.dead_letters,
        };
        for item in snapshot.pending {
            state.next_seq = state.next_seq.max(item.seq + 1);
            state.pending.insert(item.seq, item);
        }

        if !state.pending.is_empty() {
            log::info!("Loaded {} queued transactions", state.pending.len());
        }

        Ok(Self {
            state: Mutex::new(state),
            draining: Mutex::new(()),
            storage,
            sink,
            config,
            wake: Notify::new(),
        })
    }

    /// Queue a transaction. Returns false if the hash is already pending.
    pub async fn enqueue(&self, hash: &str, payload: &[u8]) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if state.pending.values().any(|item| item.hash == hash) {
            return Ok(false);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.insert(
            seq,
            QueueItem {
                seq,
                hash: hash.to_string(),
                payload: payload.to_vec(),
                queued_at: Utc::now(),
                retry_count: 0,
                last_attempt: None,
            },
        );
        self.persist(&state)?;

        log::info!(
            "Queued transaction {} for later distribution ({} pending)",
            hash,
            state.pending.len()
        );
        Ok(true)
    }

    /// Attempt every pending item, oldest first
    pub async fn drain(&self, target: &dyn DistributionTarget) -> Result<DrainReport, QueueError> {
        let _draining = self.draining.lock().await;
        let mut report = DrainReport::default();

        let items: Vec<QueueItem> = self.state.lock().await.pending.values().cloned().collect();
        if items.is_empty() {
            return Ok(report);
        }

        if !target.ready().await {
            log::debug!("Drain skipped, {} items waiting for peers", items.len());
            report.skipped = true;
            return Ok(report);
        }

        for item in items {
            report.attempted.push(item.hash.clone());
            let result = target.redistribute(&item.hash, &item.payload).await;

            let mut state = self.state.lock().await;
            match result {
                Ok(peers) => {
                    state.pending.remove(&item.seq);
                    report.delivered += 1;
                    log::info!("Queued transaction {} distributed to {} peers", item.hash, peers);
                }
                Err(e) => {
                    report.failed += 1;
                    let Some(entry) = state.pending.get_mut(&item.seq) else {
                        continue;
                    };
                    entry.retry_count += 1;
                    entry.last_attempt = Some(Utc::now());

                    if entry.retry_count > self.config.max_retries {
                        if let Some(item) = state.pending.remove(&item.seq) {
                            let letter = DeadLetter {
                                item,
                                reason: e.to_string(),
                                dead_at: Utc::now(),
                            };
                            self.sink.report(&letter);
                            state.dead_letters.push(letter);
                            report.dead_lettered += 1;
                        }
                    } else {
                        log::debug!(
                            "Queued transaction {} failed attempt {}: {}",
                            item.hash,
                            entry.retry_count,
                            e
                        );
                    }
                }
            }
            self.persist(&state)?;
        }

        Ok(report)
    }

    /// Drain on a timer until shutdown. Failed passes back off exponentially;
    /// [`wake`](Self::wake) forces an immediate pass.
    pub async fn run(
        self: Arc<Self>,
        target: Arc<dyn DistributionTarget>,
        shutdown: CancellationToken,
    ) {
        // Immediate pass for anything loaded from disk
        let mut delay = Duration::ZERO;
        let mut failed_passes: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {
                    failed_passes = 0;
                }
            }

            match self.drain(target.as_ref()).await {
                Ok(report) if report.failed > 0 => {
                    failed_passes = failed_passes.saturating_add(1);
                    delay = self.backoff(failed_passes);
                    log::info!(
                        "Drain pass: {} delivered, {} failed, next pass in {:?}",
                        report.delivered,
                        report.failed,
                        delay
                    );
                }
                Ok(report) => {
                    if report.delivered > 0 {
                        log::info!("Drain pass delivered {} transactions", report.delivered);
                    }
                    failed_passes = 0;
                    delay = self.config.drain_interval();
                }
                Err(e) => {
                    log::error!("Drain pass failed: {}", e);
                    delay = self.config.drain_interval();
                }
            }
        }

        if let Err(e) = self.flush().await {
            log::error!("Failed to flush offline queue: {}", e);
        }
    }

    /// Request a drain pass now
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Delay before the next pass after `failed_passes` consecutive failures
    pub fn backoff(&self, failed_passes: u32) -> Duration {
        let exponent = failed_passes.min(16);
        self.config
            .drain_interval()
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_backoff())
    }

    pub async fn pending(&self) -> Vec<QueueItem> {
        self.state.lock().await.pending.values().cloned().collect()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    /// Write the current state to disk
    pub async fn flush(&self) -> Result<(), QueueError> {
        let state = self.state.lock().await;
        self.persist(&state)
    }

    fn persist(&self, state: &QueueState) -> Result<(), QueueError> {
        self.storage.save(QUEUE_FILE, &state.snapshot())?;
        Ok(())
    }
}

/// Read a queue file without opening the queue (used by the CLI)
pub fn read_snapshot(storage: &Storage) -> Result<QueueSnapshot, QueueError> {
    Ok(storage.load(QUEUE_FILE)?.unwrap_or_default())
}
