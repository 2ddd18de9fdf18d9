//! Peer registry
//!
//! The single owner of peer records. Discovery, the health monitor and the
//! negotiator all mutate peers through the narrow contract here, so id
//! uniqueness, the state machine and the capacity limit are enforced in one
//! place. Readers (`get`, `list_healthy`) share a read lock; writers are
//! serialized.

use crate::config::RegistryConfig;
use crate::network::message::PeerId;
use crate::network::peer::{transition, PeerEvent, PeerNode, PeerState};
use chrono::{Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

/// Registry errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("Registry full ({0} peers) and nothing evictable")]
    Full(usize),
    #[error("Refusing to register our own id")]
    SelfRegistration,
    #[error("Invalid peer record: {0}")]
    InvalidPeer(String),
}

/// What `upsert` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Existing live record refreshed in place
    Updated,
    /// An evicted record was superseded by a newer registration
    Replaced,
}

/// Counts per state
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub discovered: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub evicted: usize,
    pub bootstrap: usize,
}

type InFlight = Arc<Mutex<HashMap<PeerId, usize>>>;

/// Marks a peer as the target of a request until dropped. Purge and capacity
/// eviction never remove a peer while a guard is alive.
pub struct InFlightGuard {
    peer_id: PeerId,
    in_flight: InFlight,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.in_flight.lock() {
            if let Some(count) = map.get_mut(&self.peer_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    map.remove(&self.peer_id);
                }
            }
        }
    }
}

/// Table of known peers
pub struct PeerRegistry {
    local_id: PeerId,
    peers: RwLock<HashMap<PeerId, PeerNode>>,
    in_flight: InFlight,
    config: RegistryConfig,
}

impl PeerRegistry {
    pub fn new(local_id: impl Into<PeerId>, config: RegistryConfig) -> Self {
        Self {
            local_id: local_id.into(),
            peers: RwLock::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn failure_threshold(&self) -> u32 {
        self.config.failure_threshold
    }

    /// Insert a peer or refresh an existing record.
    ///
    /// A live record keeps its health state; its address and capabilities are
    /// replaced wholesale and `last_seen` only moves forward. An evicted record
    /// is superseded when the new registration is newer.
    pub async fn upsert(&self, peer: PeerNode) -> Result<UpsertOutcome, RegistryError> {
        if peer.id == self.local_id {
            return Err(RegistryError::SelfRegistration);
        }
        if peer.id.is_empty() || peer.address.is_empty() || peer.port == 0 {
            return Err(RegistryError::InvalidPeer(format!(
                "id='{}' address='{}' port={}",
                peer.id, peer.address, peer.port
            )));
        }

        let mut peers = self.peers.write().await;

        if let Some(existing) = peers.get_mut(&peer.id) {
            if existing.is_evicted() {
                if peer.last_seen > existing.last_seen {
                    let is_bootstrap = existing.is_bootstrap || peer.is_bootstrap;
                    let mut fresh = peer;
                    fresh.is_bootstrap = is_bootstrap;
                    fresh.state = PeerState::Discovered;
                    fresh.failure_count = 0;
                    fresh.evicted_at = None;
                    log::info!("Peer {} re-registered after eviction", fresh.id);
                    *existing = fresh;
                    return Ok(UpsertOutcome::Replaced);
                }
                return Ok(UpsertOutcome::Updated);
            }

            existing.address = peer.address;
            existing.port = peer.port;
            existing.http_port = peer.http_port;
            existing.capabilities = peer.capabilities;
            existing.is_bootstrap |= peer.is_bootstrap;
            if peer.last_seen > existing.last_seen {
                existing.last_seen = peer.last_seen;
            }
            return Ok(UpsertOutcome::Updated);
        }

        if peers.len() >= self.config.max_peers {
            let victim = self.pick_capacity_victim(&peers).ok_or(RegistryError::Full(peers.len()))?;
            log::debug!("Registry full, dropping {} for {}", victim, peer.id);
            peers.remove(&victim);
        }

        log::debug!("Discovered peer {} at {}:{}", peer.id, peer.address, peer.port);
        peers.insert(peer.id.clone(), peer);
        Ok(UpsertOutcome::Inserted)
    }

    /// Get a peer by id
    pub async fn get(&self, id: &str) -> Option<PeerNode> {
        self.peers.read().await.get(id).cloned()
    }

    /// Peers currently in `Healthy`
    pub async fn list_healthy(&self) -> Vec<PeerNode> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.is_healthy())
            .cloned()
            .collect()
    }

    pub async fn healthy_count(&self) -> usize {
        self.peers.read().await.values().filter(|p| p.is_healthy()).count()
    }

    /// All records, evicted included
    pub async fn list_all(&self) -> Vec<PeerNode> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Bootstrap-flagged peers that are not evicted
    pub async fn list_bootstrap(&self) -> Vec<PeerNode> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.is_bootstrap && !p.is_evicted())
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Reset the failure count and move the peer to `Healthy`
    pub async fn record_success(&self, id: &str) -> Result<PeerState, RegistryError> {
        let mut peers = self.peers.write().await;
        let peer = peers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownPeer(id.to_string()))?;

        let previous = peer.state;
        peer.failure_count = 0;
        peer.state = transition(previous, PeerEvent::ContactSucceeded);
        if peer.state == PeerState::Healthy {
            peer.last_seen = Utc::now();
        }

        if previous != peer.state {
            log::info!("Peer {} {:?} -> {:?}", id, previous, peer.state);
        }
        Ok(peer.state)
    }

    /// Count a failed contact and apply the state machine
    pub async fn record_failure(&self, id: &str) -> Result<PeerState, RegistryError> {
        let mut peers = self.peers.write().await;
        let peer = peers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownPeer(id.to_string()))?;

        if peer.is_evicted() {
            return Ok(PeerState::Evicted);
        }

        let previous = peer.state;
        peer.failure_count = peer.failure_count.saturating_add(1);
        peer.state = transition(
            previous,
            PeerEvent::ContactFailed {
                failures: peer.failure_count,
                threshold: self.config.failure_threshold,
            },
        );

        if peer.state == PeerState::Evicted {
            peer.evicted_at = Some(Utc::now());
            log::warn!(
                "Peer {} evicted after {} consecutive failures",
                id,
                peer.failure_count
            );
        } else if previous != peer.state {
            log::info!("Peer {} {:?} -> {:?}", id, previous, peer.state);
        }
        Ok(peer.state)
    }

    /// Move a peer to `Evicted`. The record stays for diagnostics until purged.
    pub async fn evict(&self, id: &str) -> Result<(), RegistryError> {
        let mut peers = self.peers.write().await;
        let peer = peers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownPeer(id.to_string()))?;

        if !peer.is_evicted() {
            peer.state = transition(peer.state, PeerEvent::Evict);
            peer.evicted_at = Some(Utc::now());
            log::info!("Peer {} evicted", id);
        }
        Ok(())
    }

    /// Drop evicted records older than `retention` that nobody is talking to
    pub async fn purge_evicted(&self, retention: Duration) -> usize {
        let retention = ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::MAX);
        let now = Utc::now();
        let busy = self.busy_peers();

        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|id, p| match (p.state, p.evicted_at) {
            (PeerState::Evicted, Some(at)) => now - at < retention || busy.contains_key(id),
            _ => true,
        });

        let purged = before - peers.len();
        if purged > 0 {
            log::debug!("Purged {} evicted peers", purged);
        }
        purged
    }

    /// Mark a peer as the target of an in-flight request
    pub fn begin_request(&self, id: &str) -> InFlightGuard {
        if let Ok(mut map) = self.in_flight.lock() {
            *map.entry(id.to_string()).or_insert(0) += 1;
        }
        InFlightGuard {
            peer_id: id.to_string(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.busy_peers().contains_key(id)
    }

    /// Healthy peers ordered by id, starting after `cursor`
    pub async fn page_healthy(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> (Vec<PeerNode>, Option<PeerId>) {
        let mut healthy = self.list_healthy().await;
        healthy.sort_by(|a, b| a.id.cmp(&b.id));

        let start = match cursor {
            Some(c) => healthy.partition_point(|p| p.id.as_str() <= c),
            None => 0,
        };

        let page: Vec<PeerNode> = healthy.iter().skip(start).take(limit).cloned().collect();
        let next = if start + page.len() < healthy.len() {
            page.last().map(|p| p.id.clone())
        } else {
            None
        };
        (page, next)
    }

    /// Up to `n` random non-evicted peers
    pub async fn sample(&self, n: usize) -> Vec<PeerNode> {
        let live: Vec<PeerNode> = self
            .peers
            .read()
            .await
            .values()
            .filter(|p| !p.is_evicted())
            .cloned()
            .collect();
        let mut rng = rand::thread_rng();
        live.choose_multiple(&mut rng, n).cloned().collect()
    }

    /// Up to `n` random healthy peers
    pub async fn sample_healthy(&self, n: usize) -> Vec<PeerNode> {
        let healthy = self.list_healthy().await;
        let mut rng = rand::thread_rng();
        healthy.choose_multiple(&mut rng, n).cloned().collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let peers = self.peers.read().await;
        let mut stats = RegistryStats::default();
        for peer in peers.values() {
            match peer.state {
                PeerState::Discovered => stats.discovered += 1,
                PeerState::Healthy => stats.healthy += 1,
                PeerState::Unhealthy => stats.unhealthy += 1,
                PeerState::Evicted => stats.evicted += 1,
            }
            if peer.is_bootstrap {
                stats.bootstrap += 1;
            }
        }
        stats
    }

    /// Live records for persistence
    pub async fn snapshot(&self) -> Vec<PeerNode> {
        let mut peers: Vec<PeerNode> = self
            .peers
            .read()
            .await
            .values()
            .filter(|p| !p.is_evicted())
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Load persisted records. Health is unknown after a restart, so every
    /// restored peer starts over as `Discovered`.
    pub async fn restore(&self, snapshot: Vec<PeerNode>) -> usize {
        let mut restored = 0;
        for mut peer in snapshot {
            if peer.is_evicted() {
                continue;
            }
            peer.state = PeerState::Discovered;
            peer.failure_count = 0;
            peer.evicted_at = None;
            if self.upsert(peer).await.is_ok() {
                restored += 1;
            }
        }
        restored
    }

    // =========================================================================
    // Private helpers
    // =========================================================================

    fn busy_peers(&self) -> HashMap<PeerId, usize> {
        self.in_flight.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Evicted records go first, then the least recently healthy entry.
    /// Bootstrap peers and peers with requests in flight are never chosen.
    fn pick_capacity_victim(&self, peers: &HashMap<PeerId, PeerNode>) -> Option<PeerId> {
        let busy = self.busy_peers();
        peers
            .values()
            .filter(|p| !p.is_bootstrap && !busy.contains_key(&p.id))
            .min_by_key(|p| (!p.is_evicted(), p.is_healthy(), p.last_seen))
            .map(|p| p.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{Capabilities, PeerAdvert};

    fn peer(id: &str) -> PeerNode {
        PeerNode::from_advert(
            PeerAdvert {
                id: id.to_string(),
                address: "10.0.0.1".to_string(),
                port: 7400,
                http_port: 7401,
                capabilities: Capabilities::current(),
            },
            false,
        )
    }

    fn registry(max_peers: usize) -> PeerRegistry {
        PeerRegistry::new(
            "local",
            RegistryConfig {
                max_peers,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let reg = registry(10);
        assert_eq!(reg.upsert(peer("a")).await, Ok(UpsertOutcome::Inserted));
        assert_eq!(reg.upsert(peer("a")).await, Ok(UpsertOutcome::Updated));
        assert_eq!(reg.len().await, 1);
        assert_eq!(reg.get("a").await.unwrap().state, PeerState::Discovered);
    }

    #[tokio::test]
    async fn test_self_registration_rejected() {
        let reg = registry(10);
        assert_eq!(
            reg.upsert(peer("local")).await,
            Err(RegistryError::SelfRegistration)
        );
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let reg = registry(10);
        reg.upsert(peer("a")).await.unwrap();
        reg.record_success("a").await.unwrap();
        reg.record_failure("a").await.unwrap();
        reg.record_failure("a").await.unwrap();
        assert_eq!(reg.get("a").await.unwrap().failure_count, 2);

        assert_eq!(reg.record_success("a").await, Ok(PeerState::Healthy));
        assert_eq!(reg.get("a").await.unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn test_three_failures_evict() {
        let reg = registry(10);
        reg.upsert(peer("a")).await.unwrap();
        reg.record_success("a").await.unwrap();
        assert_eq!(reg.list_healthy().await.len(), 1);

        assert_eq!(reg.record_failure("a").await, Ok(PeerState::Unhealthy));
        assert!(reg.list_healthy().await.is_empty());
        assert_eq!(reg.record_failure("a").await, Ok(PeerState::Unhealthy));
        assert_eq!(reg.record_failure("a").await, Ok(PeerState::Evicted));

        // Retained for diagnostics, absent from healthy results
        assert!(reg.get("a").await.is_some());
        assert!(reg.list_healthy().await.is_empty());
        assert_eq!(reg.record_success("a").await, Ok(PeerState::Evicted));
        assert!(reg.list_healthy().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let reg = registry(10);
        assert_eq!(
            reg.record_failure("nope").await,
            Err(RegistryError::UnknownPeer("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn test_evicted_peer_superseded_by_newer_registration() {
        let reg = registry(10);
        reg.upsert(peer("a")).await.unwrap();
        reg.evict("a").await.unwrap();

        let mut again = peer("a");
        again.last_seen = Utc::now() + ChronoDuration::seconds(1);
        assert_eq!(reg.upsert(again).await, Ok(UpsertOutcome::Replaced));
        assert_eq!(reg.get("a").await.unwrap().state, PeerState::Discovered);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_healthy_non_bootstrap() {
        let reg = registry(3);

        let mut seed = peer("seed");
        seed.is_bootstrap = true;
        seed.last_seen = Utc::now() - ChronoDuration::hours(5);
        reg.upsert(seed).await.unwrap();

        let mut old = peer("old");
        old.last_seen = Utc::now() - ChronoDuration::hours(1);
        reg.upsert(old).await.unwrap();
        reg.upsert(peer("recent")).await.unwrap();

        assert_eq!(reg.upsert(peer("new")).await, Ok(UpsertOutcome::Inserted));
        assert_eq!(reg.len().await, 3);
        assert!(reg.get("seed").await.is_some());
        assert!(reg.get("old").await.is_none());
        assert!(reg.get("new").await.is_some());
    }

    #[tokio::test]
    async fn test_capacity_full_of_bootstrap_peers() {
        let reg = registry(1);
        let mut seed = peer("seed");
        seed.is_bootstrap = true;
        reg.upsert(seed).await.unwrap();

        assert_eq!(reg.upsert(peer("x")).await, Err(RegistryError::Full(1)));
    }

    #[tokio::test]
    async fn test_in_flight_peer_not_purged() {
        let reg = registry(10);
        reg.upsert(peer("a")).await.unwrap();
        reg.evict("a").await.unwrap();

        let guard = reg.begin_request("a");
        assert!(reg.is_in_flight("a"));
        assert_eq!(reg.purge_evicted(Duration::ZERO).await, 0);
        assert!(reg.get("a").await.is_some());

        drop(guard);
        assert!(!reg.is_in_flight("a"));
        assert_eq!(reg.purge_evicted(Duration::ZERO).await, 1);
        assert!(reg.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_in_flight_peer_not_capacity_evicted() {
        let reg = registry(1);
        reg.upsert(peer("busy")).await.unwrap();
        let _guard = reg.begin_request("busy");

        assert_eq!(reg.upsert(peer("x")).await, Err(RegistryError::Full(1)));
    }

    #[tokio::test]
    async fn test_paging_healthy_peers() {
        let reg = registry(10);
        for id in ["c", "a", "d", "b"] {
            reg.upsert(peer(id)).await.unwrap();
            reg.record_success(id).await.unwrap();
        }

        let (page, next) = reg.page_healthy(None, 3).await;
        let ids: Vec<_> = page.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(next.as_deref(), Some("c"));

        let (page, next) = reg.page_healthy(next.as_deref(), 3).await;
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "d");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_restore_resets_health() {
        let reg = registry(10);
        let mut p = peer("a");
        p.state = PeerState::Healthy;
        p.failure_count = 2;
        let mut gone = peer("b");
        gone.state = PeerState::Evicted;

        assert_eq!(reg.restore(vec![p, gone]).await, 1);
        let restored = reg.get("a").await.unwrap();
        assert_eq!(restored.state, PeerState::Discovered);
        assert_eq!(restored.failure_count, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let reg = registry(10);
        reg.upsert(peer("a")).await.unwrap();
        reg.upsert(peer("b")).await.unwrap();
        reg.record_success("b").await.unwrap();

        let stats = reg.stats().await;
        assert_eq!(stats.discovered, 1);
        assert_eq!(stats.healthy, 1);
    }
}
