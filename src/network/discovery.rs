//! Peer discovery
//!
//! Bootstraps from the configured seeds and crawls peer lists breadth-first
//! to a bounded depth, then refreshes from a sample of healthy peers on a
//! timer. With no seed reachable the node is offline and retries the whole
//! bootstrap on a fixed backoff. While online, the health monitor can ask
//! for an early bootstrap.

use crate::config::{DiscoveryConfig, SeedNode};
use crate::network::address::AddressDiscovery;
use crate::network::message::{Capabilities, PeerAdvert, PeerId, PeerRequest, PeerResponse};
use crate::network::negotiator::{NegotiationError, Negotiator};
use crate::network::peer::{LocalPeer, PeerNode};
use crate::network::registry::{PeerRegistry, UpsertOutcome};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Constants
// =============================================================================

/// Peer-list requests in flight during a crawl
const CRAWL_CONCURRENCY: usize = 16;

/// Discovery errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("No seed nodes configured")]
    NoSeeds,
    #[error("None of {0} seed nodes answered")]
    SeedsUnreachable(usize),
    #[error("Bootstrap already running")]
    InProgress,
}

/// Where discovery stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Not started
    Idle,
    Bootstrapping,
    /// At least one seed answered the last bootstrap
    Online,
    /// No seed answered; retrying on the bootstrap backoff
    Offline,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub seeds_total: usize,
    pub seeds_reached: usize,
    /// Peers first learned of during the crawl
    pub discovered: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub queried: usize,
    pub failed: usize,
    pub discovered: usize,
}

pub struct PeerDiscovery {
    local: Arc<LocalPeer>,
    registry: Arc<PeerRegistry>,
    negotiator: Arc<Negotiator>,
    address: Option<Arc<AddressDiscovery>>,
    config: DiscoveryConfig,
    mode: RwLock<DiscoveryMode>,
    bootstrapping: Mutex<()>,
    trigger: Notify,
    attempts: AtomicU32,
}

impl PeerDiscovery {
    pub fn new(
        local: Arc<LocalPeer>,
        registry: Arc<PeerRegistry>,
        negotiator: Arc<Negotiator>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            local,
            registry,
            negotiator,
            address: None,
            config,
            mode: RwLock::new(DiscoveryMode::Idle),
            bootstrapping: Mutex::new(()),
            trigger: Notify::new(),
            attempts: AtomicU32::new(0),
        }
    }

    /// Re-check the external address on a timer and announce changes
    pub fn with_address_discovery(mut self, address: Arc<AddressDiscovery>) -> Self {
        self.address = Some(address);
        self
    }

    pub async fn mode(&self) -> DiscoveryMode {
        *self.mode.read().await
    }

    /// Bootstrap attempts started so far
    pub fn bootstrap_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Ask the run loop for a bootstrap now. Ignored while offline.
    pub fn trigger_bootstrap(&self) {
        self.trigger.notify_one();
    }

    // =========================================================================
    // Bootstrap
    // =========================================================================

    /// Register with every seed in parallel, then crawl from the ones that
    /// answered. Succeeds when at least one seed answered.
    pub async fn bootstrap(&self) -> Result<BootstrapReport, DiscoveryError> {
        let _running = self
            .bootstrapping
            .try_lock()
            .map_err(|_| DiscoveryError::InProgress)?;

        if self.config.seeds.is_empty() {
            return Err(DiscoveryError::NoSeeds);
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);
        *self.mode.write().await = DiscoveryMode::Bootstrapping;
        log::info!("Bootstrapping from {} seed nodes", self.config.seeds.len());

        let advert = self.local.advert().await;
        let reached: Vec<PeerId> = futures::future::join_all(
            self.config
                .seeds
                .iter()
                .map(|seed| self.contact_seed(seed, advert.clone())),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        if reached.is_empty() {
            *self.mode.write().await = DiscoveryMode::Offline;
            log::warn!(
                "No seed node reachable, offline; retrying in {:?}",
                self.config.bootstrap_retry()
            );
            return Err(DiscoveryError::SeedsUnreachable(self.config.seeds.len()));
        }

        let discovered = self.crawl(reached.clone()).await;
        *self.mode.write().await = DiscoveryMode::Online;

        let report = BootstrapReport {
            seeds_total: self.config.seeds.len(),
            seeds_reached: reached.len(),
            discovered,
        };
        log::info!(
            "Bootstrap complete: {}/{} seeds, {} peers discovered, {} known",
            report.seeds_reached,
            report.seeds_total,
            report.discovered,
            self.registry.len().await
        );
        Ok(report)
    }

    /// Register with one seed. Returns the seed's real id when it answered.
    async fn contact_seed(&self, seed: &SeedNode, advert: PeerAdvert) -> Option<PeerId> {
        let provisional = PeerNode::from_advert(
            PeerAdvert {
                id: format!("seed@{}", seed),
                address: seed.host.clone(),
                port: seed.port,
                http_port: seed.http_port,
                capabilities: Capabilities::current(),
            },
            true,
        );

        let response = timeout(
            self.config.connect_timeout(),
            self.negotiator
                .send_to(&provisional, PeerRequest::RegisterPeer { advert }),
        )
        .await;

        let remote = match response {
            Ok(Ok(PeerResponse::Registered { advert })) => advert,
            Ok(Ok(other)) => {
                log::warn!("Seed {} answered registration with {}", seed, other.type_name());
                return None;
            }
            Ok(Err(e)) => {
                log::warn!("Seed {} unreachable: {}", seed, e);
                return None;
            }
            Err(_) => {
                log::warn!(
                    "Seed {} did not answer within {:?}",
                    seed,
                    self.config.connect_timeout()
                );
                return None;
            }
        };

        // Reach the seed where we found it, whatever it advertises
        let node = PeerNode::from_advert(
            PeerAdvert {
                id: remote.id,
                address: seed.host.clone(),
                port: seed.port,
                http_port: seed.http_port,
                capabilities: remote.capabilities,
            },
            true,
        );
        let id = node.id.clone();

        if let Err(e) = self.registry.upsert(node).await {
            log::warn!("Seed {} not registered: {}", seed, e);
            return None;
        }
        let _ = self.registry.record_success(&id).await;
        log::info!("Seed {} is peer {}", seed, id);
        Some(id)
    }

    /// Breadth-first crawl below `frontier`; returns how many peers were new
    async fn crawl(&self, frontier: Vec<PeerId>) -> usize {
        let mut visited: HashSet<PeerId> = frontier.iter().cloned().collect();
        let mut frontier = frontier;
        let mut discovered = 0;

        for depth in 1..=self.config.max_depth {
            if frontier.is_empty() {
                break;
            }

            let lists: Vec<Vec<PeerAdvert>> = stream::iter(frontier)
                .map(|id| async move { self.fetch_peer_list(&id).await.unwrap_or_default() })
                .buffer_unordered(CRAWL_CONCURRENCY)
                .collect()
                .await;

            let mut next = Vec::new();
            for adverts in lists {
                for id in self.merge(adverts).await {
                    if visited.insert(id.clone()) {
                        next.push(id);
                    }
                }
            }

            log::debug!("Crawl depth {}: {} new peers", depth, next.len());
            discovered += next.len();
            frontier = next;
        }

        discovered
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Re-query a sample of healthy peers for their peer lists. Peers that do
    /// not answer are recorded as failures by the negotiator.
    pub async fn refresh(&self) -> RefreshReport {
        let sample = self
            .registry
            .sample_healthy(self.config.refresh_sample_size)
            .await;

        let results: Vec<Result<Vec<PeerAdvert>, NegotiationError>> = stream::iter(sample)
            .map(|peer| async move { self.fetch_peer_list(&peer.id).await })
            .buffer_unordered(CRAWL_CONCURRENCY)
            .collect()
            .await;

        let mut report = RefreshReport {
            queried: results.len(),
            ..Default::default()
        };
        for result in results {
            match result {
                Ok(adverts) => report.discovered += self.merge(adverts).await.len(),
                Err(e) => {
                    log::debug!("Refresh probe failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        log::info!(
            "Refresh: {} peers queried, {} failed, {} new",
            report.queried,
            report.failed,
            report.discovered
        );
        report
    }

    /// Follow `GetPeerList` pages from one peer
    async fn fetch_peer_list(&self, peer_id: &str) -> Result<Vec<PeerAdvert>, NegotiationError> {
        let mut adverts = Vec::new();
        let mut cursor = None;

        for _ in 0..self.config.max_pages.max(1) {
            let request = PeerRequest::GetPeerList {
                cursor: cursor.take(),
                limit: self.config.page_size,
            };
            match self.negotiator.send(peer_id, request).await? {
                PeerResponse::PeerList { peers, next_cursor } => {
                    adverts.extend(peers);
                    if adverts.len() >= self.config.max_peers_per_response {
                        break;
                    }
                    match next_cursor {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
                other => {
                    log::debug!("{} answered GetPeerList with {}", peer_id, other.type_name());
                    break;
                }
            }
        }

        adverts.truncate(self.config.max_peers_per_response);
        Ok(adverts)
    }

    /// Register peers heard about from others. Known peers are left alone;
    /// their records are refreshed when they are contacted directly.
    async fn merge(&self, adverts: Vec<PeerAdvert>) -> Vec<PeerId> {
        let mut inserted = Vec::new();
        for advert in adverts {
            let known = self.registry.get(&advert.id).await.is_some();
            if advert.id == self.registry.local_id() || known {
                continue;
            }
            let id = advert.id.clone();
            match self.registry.upsert(PeerNode::from_advert(advert, false)).await {
                Ok(UpsertOutcome::Inserted) => inserted.push(id),
                Ok(_) => {}
                Err(e) => log::debug!("Ignoring advertised peer {}: {}", id, e),
            }
        }
        inserted
    }

    // =========================================================================
    // Announce
    // =========================================================================

    /// Re-register with the bootstrap set and healthy peers, after the
    /// external address changed. Returns how many acknowledged.
    pub async fn announce(&self) -> usize {
        let advert = self.local.advert().await;
        let mut targets = self.registry.list_bootstrap().await;
        let mut seen: HashSet<PeerId> = targets.iter().map(|p| p.id.clone()).collect();
        for peer in self.registry.list_healthy().await {
            if seen.insert(peer.id.clone()) {
                targets.push(peer);
            }
        }

        let acks = stream::iter(targets)
            .map(|peer| {
                let advert = advert.clone();
                async move {
                    matches!(
                        self.negotiator
                            .send(&peer.id, PeerRequest::RegisterPeer { advert })
                            .await,
                        Ok(PeerResponse::Registered { .. })
                    )
                }
            })
            .buffer_unordered(CRAWL_CONCURRENCY)
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;

        log::info!("Announced {} to {} peers", advert.address, acks);
        acks
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Bootstrap until a seed answers, then refresh on a timer. A trigger
    /// from the health monitor forces a new bootstrap while online; offline
    /// retries wait out the full retry period.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut need_bootstrap = true;

        loop {
            if need_bootstrap {
                match self.bootstrap().await {
                    Ok(_) | Err(DiscoveryError::InProgress) => {
                        need_bootstrap = false;
                        // Requests raised while bootstrapping are already served
                        let _ = self.trigger.notified().now_or_never();
                    }
                    Err(e) => {
                        log::warn!("Bootstrap failed: {}", e);
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.config.bootstrap_retry()) => {}
                        }
                        let _ = self.trigger.notified().now_or_never();
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.refresh_interval()) => {
                    self.refresh().await;
                }
                _ = self.trigger.notified() => {
                    log::info!("Bootstrap requested");
                    need_bootstrap = true;
                }
            }
        }

        log::debug!("Discovery stopped");
    }

    /// Re-check the external address on a timer; on change update the
    /// advert and announce it
    pub async fn run_address_recheck(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(address) = self.address.clone() else {
            return;
        };
        let period = address.recheck_interval().max(std::time::Duration::from_secs(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Some(changed) = address.recheck().await {
                        if self.local.set_address(changed.ip.to_string()).await {
                            self.announce().await;
                        }
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NegotiatorConfig, RegistryConfig};
    use crate::network::peer::PeerState;
    use crate::network::transport::{Transport, TransportError};
    use crate::testing::{advert, MockTransport};
    use std::time::Duration;

    fn seed(host: &str) -> SeedNode {
        SeedNode::new(host, 7400, 7401)
    }

    fn remote(id: &str, address: &str) -> PeerAdvert {
        PeerAdvert {
            address: address.to_string(),
            ..advert(id)
        }
    }

    fn setup(
        transport: MockTransport,
        config: DiscoveryConfig,
    ) -> (Arc<PeerRegistry>, PeerDiscovery) {
        let registry = Arc::new(PeerRegistry::new("local", RegistryConfig::default()));
        let negotiator = Arc::new(Negotiator::new(
            Arc::clone(&registry),
            vec![Arc::new(transport) as Arc<dyn Transport>],
            NegotiatorConfig::default(),
        ));
        let discovery = PeerDiscovery::new(
            Arc::new(LocalPeer::new(advert("local"))),
            Arc::clone(&registry),
            negotiator,
            config,
        );
        (registry, discovery)
    }

    /// A small network: seed 10.0.0.3 knows a and b, a knows c, c knows d
    fn network() -> MockTransport {
        MockTransport::answering(|peer, request| {
            let list = |peers: Vec<PeerAdvert>| {
                Ok(PeerResponse::PeerList {
                    peers,
                    next_cursor: None,
                })
            };
            match (peer.address.as_str(), request) {
                ("10.0.0.1" | "10.0.0.2", _) => {
                    Err(TransportError::ConnectionFailed(peer.address.clone()))
                }
                ("10.0.0.3", PeerRequest::RegisterPeer { .. }) => Ok(PeerResponse::Registered {
                    advert: remote("seed-3", "10.0.0.3"),
                }),
                ("10.0.0.3", PeerRequest::GetPeerList { .. }) => list(vec![
                    remote("a", "10.0.1.1"),
                    remote("b", "10.0.1.2"),
                    remote("local", "10.9.9.9"),
                ]),
                ("10.0.1.1", PeerRequest::GetPeerList { .. }) => {
                    list(vec![remote("c", "10.0.1.3")])
                }
                ("10.0.1.3", PeerRequest::GetPeerList { .. }) => {
                    list(vec![remote("d", "10.0.1.4")])
                }
                (_, PeerRequest::GetPeerList { .. }) => list(Vec::new()),
                (_, PeerRequest::RegisterPeer { .. }) => Ok(PeerResponse::Registered {
                    advert: remote("whoever", &peer.address),
                }),
                _ => Ok(PeerResponse::Ack),
            }
        })
    }

    #[tokio::test]
    async fn test_bootstrap_with_one_reachable_seed() {
        let (registry, discovery) = setup(
            network(),
            DiscoveryConfig {
                seeds: vec![seed("10.0.0.1"), seed("10.0.0.2"), seed("10.0.0.3")],
                max_depth: 1,
                ..Default::default()
            },
        );

        let report = discovery.bootstrap().await.unwrap();
        assert_eq!(report.seeds_reached, 1);
        assert_eq!(report.seeds_total, 3);

        let seed = registry.get("seed-3").await.unwrap();
        assert!(seed.is_bootstrap);
        assert_eq!(seed.state, PeerState::Healthy);
        assert_eq!(seed.address, "10.0.0.3");
        assert_eq!(discovery.mode().await, DiscoveryMode::Online);

        // Depth 1: the seed's own list only; ourselves skipped
        assert_eq!(report.discovered, 2);
        assert!(registry.get("c").await.is_none());
        assert!(registry.get("local").await.is_none());
    }

    #[tokio::test]
    async fn test_crawl_respects_max_depth() {
        let (registry, discovery) = setup(
            network(),
            DiscoveryConfig {
                seeds: vec![seed("10.0.0.3")],
                max_depth: 2,
                ..Default::default()
            },
        );

        let report = discovery.bootstrap().await.unwrap();
        assert_eq!(report.discovered, 3);
        assert!(registry.get("c").await.is_some());
        assert!(registry.get("d").await.is_none());
    }

    #[tokio::test]
    async fn test_peer_list_pagination() {
        let transport = MockTransport::answering(|peer, request| match request {
            PeerRequest::RegisterPeer { .. } => Ok(PeerResponse::Registered {
                advert: remote("seed", &peer.address),
            }),
            PeerRequest::GetPeerList { cursor, .. } => Ok(match cursor.as_deref() {
                None => PeerResponse::PeerList {
                    peers: vec![remote("p1", "10.1.0.1"), remote("p2", "10.1.0.2")],
                    next_cursor: Some("p2".to_string()),
                },
                Some("p2") => PeerResponse::PeerList {
                    peers: vec![remote("p3", "10.1.0.3")],
                    next_cursor: None,
                },
                Some(_) => PeerResponse::PeerList {
                    peers: Vec::new(),
                    next_cursor: None,
                },
            }),
            _ => Ok(PeerResponse::Ack),
        });
        let (registry, discovery) = setup(
            transport,
            DiscoveryConfig {
                seeds: vec![seed("10.0.0.3")],
                max_depth: 1,
                ..Default::default()
            },
        );

        discovery.bootstrap().await.unwrap();
        for id in ["p1", "p2", "p3"] {
            assert!(registry.get(id).await.is_some(), "{} missing", id);
        }
    }

    #[tokio::test]
    async fn test_oversized_peer_list_truncated() {
        let transport = MockTransport::answering(|peer, request| match request {
            PeerRequest::RegisterPeer { .. } => Ok(PeerResponse::Registered {
                advert: remote("seed", &peer.address),
            }),
            PeerRequest::GetPeerList { .. } => Ok(PeerResponse::PeerList {
                peers: (0..50)
                    .map(|i| remote(&format!("p{}", i), &format!("10.2.0.{}", i + 1)))
                    .collect(),
                next_cursor: Some("more".to_string()),
            }),
            _ => Ok(PeerResponse::Ack),
        });
        let (registry, discovery) = setup(
            transport,
            DiscoveryConfig {
                seeds: vec![seed("10.0.0.3")],
                max_depth: 1,
                max_peers_per_response: 10,
                ..Default::default()
            },
        );

        discovery.bootstrap().await.unwrap();
        assert_eq!(registry.len().await, 11);
    }

    #[tokio::test]
    async fn test_no_seeds() {
        let (_, discovery) = setup(network(), DiscoveryConfig::default());
        assert_eq!(discovery.bootstrap().await, Err(DiscoveryError::NoSeeds));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_seeds_retry_after_backoff() {
        let (registry, discovery) = setup(
            MockTransport::unreachable(),
            DiscoveryConfig {
                seeds: vec![seed("10.0.0.1"), seed("10.0.0.2")],
                ..Default::default()
            },
        );
        let discovery = Arc::new(discovery);
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&discovery).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(discovery.bootstrap_attempts(), 1);
        assert_eq!(discovery.mode().await, DiscoveryMode::Offline);
        assert!(registry.is_empty().await);

        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        assert_eq!(discovery.bootstrap_attempts(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(discovery.bootstrap_attempts(), 2);

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_forces_bootstrap() {
        let (_, discovery) = setup(
            network(),
            DiscoveryConfig {
                seeds: vec![seed("10.0.0.3")],
                max_depth: 1,
                ..Default::default()
            },
        );
        let discovery = Arc::new(discovery);
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&discovery).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(discovery.bootstrap_attempts(), 1);

        discovery.trigger_bootstrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(discovery.bootstrap_attempts(), 2);

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_triggers_do_not_shorten_offline_backoff() {
        use crate::config::HealthConfig;
        use crate::network::health::HealthMonitor;

        let registry = Arc::new(PeerRegistry::new("local", RegistryConfig::default()));
        let negotiator = Arc::new(Negotiator::new(
            Arc::clone(&registry),
            vec![Arc::new(MockTransport::unreachable()) as Arc<dyn Transport>],
            NegotiatorConfig::default(),
        ));
        let discovery = Arc::new(PeerDiscovery::new(
            Arc::new(LocalPeer::new(advert("local"))),
            Arc::clone(&registry),
            Arc::clone(&negotiator),
            DiscoveryConfig {
                seeds: vec![seed("10.0.0.1"), seed("10.0.0.2")],
                ..Default::default()
            },
        ));
        let health = Arc::new(
            HealthMonitor::new(
                Arc::clone(&registry),
                negotiator,
                HealthConfig::default(),
                Duration::from_secs(600),
            )
            .with_discovery(Arc::clone(&discovery)),
        );

        let shutdown = CancellationToken::new();
        let workers = vec![
            tokio::spawn(Arc::clone(&discovery).run(shutdown.clone())),
            tokio::spawn(Arc::clone(&health).run(shutdown.clone())),
        ];

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(discovery.bootstrap_attempts(), 1);

        // Eight heartbeats below the minimum
        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        assert_eq!(discovery.bootstrap_attempts(), 1);
        assert_eq!(discovery.mode().await, DiscoveryMode::Offline);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(discovery.bootstrap_attempts(), 2);

        shutdown.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_concurrent_bootstrap_refused() {
        let (_, discovery) = setup(
            network().with_delay(Duration::from_millis(50)),
            DiscoveryConfig {
                seeds: vec![seed("10.0.0.3")],
                max_depth: 1,
                ..Default::default()
            },
        );

        let (a, b) = tokio::join!(discovery.bootstrap(), discovery.bootstrap());
        assert!(a.is_ok() != b.is_ok());
        assert!(a == Err(DiscoveryError::InProgress) || b == Err(DiscoveryError::InProgress));
    }

    #[tokio::test]
    async fn test_refresh_merges_and_counts_failures() {
        let transport = MockTransport::answering(|peer, request| match (peer.id.as_str(), request) {
            ("dead", _) => Err(TransportError::Timeout),
            (_, PeerRequest::GetPeerList { .. }) => Ok(PeerResponse::PeerList {
                peers: vec![remote("fresh", "10.3.0.1")],
                next_cursor: None,
            }),
            _ => Ok(PeerResponse::Ack),
        });
        let (registry, discovery) = setup(transport, DiscoveryConfig::default());
        for id in ["alive", "dead"] {
            registry
                .upsert(PeerNode::from_advert(advert(id), false))
                .await
                .unwrap();
            registry.record_success(id).await.unwrap();
        }

        let report = discovery.refresh().await;
        assert_eq!(report.queried, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.discovered, 1);
        assert_eq!(registry.get("dead").await.unwrap().state, PeerState::Unhealthy);
        assert!(registry.get("fresh").await.is_some());
    }

    #[tokio::test]
    async fn test_announce_reaches_bootstrap_and_healthy_peers() {
        let (registry, discovery) = setup(network(), DiscoveryConfig::default());
        let mut boot = PeerNode::from_advert(remote("boot", "10.4.0.1"), true);
        boot.state = PeerState::Unhealthy;
        registry.upsert(boot).await.unwrap();
        registry
            .upsert(PeerNode::from_advert(remote("h", "10.4.0.2"), false))
            .await
            .unwrap();
        registry.record_success("h").await.unwrap();
        registry
            .upsert(PeerNode::from_advert(remote("quiet", "10.4.0.3"), false))
            .await
            .unwrap();

        assert_eq!(discovery.announce().await, 2);
    }
}
