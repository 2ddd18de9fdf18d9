//! Health monitor
//!
//! Every heartbeat, pings a random sample of known peers and lets the
//! registry move them through the health state machine. Evicted peers past
//! their retention are purged. Below the healthy-peer minimum the monitor
//! asks discovery for an early bootstrap; crossing back above it wakes the
//! offline queue.

use crate::config::HealthConfig;
use crate::network::discovery::PeerDiscovery;
use crate::network::message::{PeerRequest, PeerResponse};
use crate::network::negotiator::{NegotiationError, Negotiator};
use crate::network::peer::PeerState;
use crate::network::registry::PeerRegistry;
use crate::queue::OfflineQueue;
use crate::storage::{Storage, PEERS_FILE};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Pings in flight at once
const PROBE_CONCURRENCY: usize = 32;

/// Outcome of one heartbeat
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub probed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Probed peers that ended the round evicted
    pub evicted: usize,
    /// Skipped because their circuit is open
    pub skipped: usize,
    pub purged: usize,
    pub healthy: usize,
    pub bootstrap_triggered: bool,
    pub drain_triggered: bool,
}

enum Probe {
    Alive,
    Failed,
    Skipped,
}

pub struct HealthMonitor {
    registry: Arc<PeerRegistry>,
    negotiator: Arc<Negotiator>,
    discovery: Option<Arc<PeerDiscovery>>,
    queue: Option<Arc<OfflineQueue>>,
    storage: Option<Storage>,
    config: HealthConfig,
    evicted_retention: Duration,
    below_minimum: AtomicBool,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<PeerRegistry>,
        negotiator: Arc<Negotiator>,
        config: HealthConfig,
        evicted_retention: Duration,
    ) -> Self {
        Self {
            registry,
            negotiator,
            discovery: None,
            queue: None,
            storage: None,
            config,
            evicted_retention,
            below_minimum: AtomicBool::new(true),
        }
    }

    /// Bootstrap early when healthy peers run short
    pub fn with_discovery(mut self, discovery: Arc<PeerDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Wake the drain loop when healthy peers recover
    pub fn with_queue(mut self, queue: Arc<OfflineQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Save a registry snapshot after every heartbeat
    pub fn with_persistence(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// One heartbeat
    pub async fn probe_once(&self) -> HealthReport {
        let sample = self.registry.sample(self.config.probe_sample_size).await;
        let mut report = HealthReport {
            probed: sample.len(),
            ..Default::default()
        };

        let results: Vec<(String, Probe)> = stream::iter(sample)
            .map(|peer| async move {
                let probe = self.ping(&peer.id).await;
                (peer.id, probe)
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await;

        for (id, probe) in results {
            match probe {
                Probe::Alive => report.succeeded += 1,
                Probe::Skipped => report.skipped += 1,
                Probe::Failed => {
                    report.failed += 1;
                    if let Some(peer) = self.registry.get(&id).await {
                        if peer.state == PeerState::Evicted {
                            report.evicted += 1;
                        }
                    }
                }
            }
        }

        report.purged = self.registry.purge_evicted(self.evicted_retention).await;
        report.healthy = self.registry.healthy_count().await;

        let minimum = self.config.min_healthy_peers;
        if report.healthy < minimum {
            self.below_minimum.store(true, Ordering::SeqCst);
            if let Some(discovery) = &self.discovery {
                log::warn!(
                    "{} healthy peers (minimum {}), requesting bootstrap",
                    report.healthy,
                    minimum
                );
                discovery.trigger_bootstrap();
                report.bootstrap_triggered = true;
            }
        } else if self.below_minimum.swap(false, Ordering::SeqCst) {
            log::info!("{} healthy peers, back above minimum", report.healthy);
            if let Some(queue) = &self.queue {
                queue.wake();
                report.drain_triggered = true;
            }
        }

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save(PEERS_FILE, &self.registry.snapshot().await) {
                log::warn!("Failed to save peer registry: {}", e);
            }
        }

        log::debug!(
            "Heartbeat: {} probed, {} ok, {} failed, {} evicted, {} purged, {} healthy",
            report.probed,
            report.succeeded,
            report.failed,
            report.evicted,
            report.purged,
            report.healthy
        );
        report
    }

    /// Ping one peer. Exhaustion is recorded by the negotiator; a probe cut
    /// off by the probe timeout is recorded here.
    async fn ping(&self, peer_id: &str) -> Probe {
        match timeout(
            self.config.probe_timeout(),
            self.negotiator.send(peer_id, PeerRequest::Ping),
        )
        .await
        {
            Ok(Ok(PeerResponse::Pong { .. })) => Probe::Alive,
            Ok(Ok(other)) => {
                log::debug!("{} answered ping with {}", peer_id, other.type_name());
                let _ = self.registry.record_failure(peer_id).await;
                Probe::Failed
            }
            Ok(Err(NegotiationError::CircuitOpen { .. })) => Probe::Skipped,
            Ok(Err(NegotiationError::UnknownPeer(_))) => Probe::Skipped,
            Ok(Err(e)) => {
                log::debug!("Ping to {} failed: {}", peer_id, e);
                Probe::Failed
            }
            Err(_) => {
                log::debug!("Ping to {} timed out", peer_id);
                let _ = self.registry.record_failure(peer_id).await;
                Probe::Failed
            }
        }
    }

    /// Heartbeat until shutdown
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.heartbeat_interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.probe_once().await;
                }
            }
        }

        log::debug!("Health monitor stopped");
    }
}
