//! Communication negotiator
//!
//! `send(peer, request)` walks the peer's transports in priority order
//! (stream, then RPC, then HTTP) until one answers. The order comes from a
//! [`NegotiationStrategy`], which filters by the peer's advertised
//! capabilities and puts the last transport that worked first for a while.
//!
//! Each peer has a [`CircuitBreaker`]. A call that exhausts every transport
//! counts as one failure for the breaker and one `record_failure` for the
//! registry; after `breaker_threshold` consecutive failed calls the circuit
//! opens and calls are refused until an exponential backoff expires.

use crate::config::NegotiatorConfig;
use crate::network::message::{PeerId, PeerRequest, PeerResponse, TransportFlags};
use crate::network::peer::PeerNode;
use crate::network::registry::PeerRegistry;
use crate::network::transport::{ChunkStream, Transport, TransportError, TransportKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Negotiation errors
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("Circuit open for {peer}, retry in {retry_in:?}")]
    CircuitOpen { peer: PeerId, retry_in: Duration },
    #[error("All {attempts} transports failed for {peer}: {last_error}")]
    Exhausted {
        peer: PeerId,
        attempts: usize,
        last_error: TransportError,
    },
    #[error("No transport in common with {0}")]
    NoCommonTransport(PeerId),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircuitState {
    Closed,
    /// Refusing calls until the backoff expires
    Open,
    /// Backoff expired; the next call is a trial
    HalfOpen,
}

/// Per-peer failure isolation
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
    trips: u32,
    open_until: Option<Instant>,
    threshold: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            trips: 0,
            open_until: None,
            threshold: threshold.max(1),
            base_backoff,
            max_backoff,
        }
    }

    pub fn state(&self, now: Instant) -> CircuitState {
        match self.open_until {
            None => CircuitState::Closed,
            Some(until) if now < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }

    /// `Err(retry_in)` while open
    pub fn check(&self, now: Instant) -> Result<(), Duration> {
        match self.open_until {
            Some(until) if now < until => Err(until - now),
            _ => Ok(()),
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.trips = 0;
        self.open_until = None;
    }

    /// Returns true when this failure opened the circuit
    pub fn on_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures < self.threshold {
            return false;
        }
        self.trips = self.trips.saturating_add(1);
        self.open_until = Some(now + self.backoff());
        true
    }

    /// base * 2^(trips - 1), capped
    pub fn backoff(&self) -> Duration {
        let exponent = self.trips.saturating_sub(1).min(20);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

// =============================================================================
// Negotiation Strategy
// =============================================================================

/// Orders transports for a peer
pub struct NegotiationStrategy {
    preferred: Mutex<HashMap<PeerId, (TransportKind, Instant)>>,
    ttl: Duration,
}

impl NegotiationStrategy {
    pub fn new(ttl: Duration) -> Self {
        Self {
            preferred: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Transports to try, in order. Only kinds both sides support are kept;
    /// a recently successful kind moves to the front.
    pub fn plan(
        &self,
        peer_id: &str,
        capabilities: TransportFlags,
        available: &[TransportKind],
    ) -> Vec<TransportKind> {
        let mut plan: Vec<TransportKind> = available
            .iter()
            .copied()
            .filter(|kind| capabilities.contains(kind.flag()))
            .collect();

        let preferred = lock(&self.preferred).get(peer_id).copied();
        if let Some((kind, at)) = preferred {
            if at.elapsed() < self.ttl {
                if let Some(pos) = plan.iter().position(|k| *k == kind) {
                    let kind = plan.remove(pos);
                    plan.insert(0, kind);
                }
            } else {
                lock(&self.preferred).remove(peer_id);
            }
        }

        plan
    }

    pub fn remember(&self, peer_id: &str, kind: TransportKind) {
        lock(&self.preferred).insert(peer_id.to_string(), (kind, Instant::now()));
    }

    pub fn forget(&self, peer_id: &str) {
        lock(&self.preferred).remove(peer_id);
    }
}

// =============================================================================
// Negotiator
// =============================================================================

pub struct Negotiator {
    registry: Arc<PeerRegistry>,
    transports: Vec<Arc<dyn Transport>>,
    strategy: NegotiationStrategy,
    breakers: Mutex<HashMap<PeerId, CircuitBreaker>>,
    config: NegotiatorConfig,
}

impl Negotiator {
    /// `transports` in priority order
    pub fn new(
        registry: Arc<PeerRegistry>,
        transports: Vec<Arc<dyn Transport>>,
        config: NegotiatorConfig,
    ) -> Self {
        Self {
            registry,
            transports,
            strategy: NegotiationStrategy::new(config.preference_ttl()),
            breakers: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Send to a registered peer
    pub async fn send(
        &self,
        peer_id: &str,
        request: PeerRequest,
    ) -> Result<PeerResponse, NegotiationError> {
        let peer = self
            .registry
            .get(peer_id)
            .await
            .ok_or_else(|| NegotiationError::UnknownPeer(peer_id.to_string()))?;
        self.send_to(&peer, request).await
    }

    /// Send to a peer record that may not be registered yet (seeds during
    /// bootstrap). Outcomes are still reported to the registry when it knows
    /// the id.
    pub async fn send_to(
        &self,
        peer: &PeerNode,
        request: PeerRequest,
    ) -> Result<PeerResponse, NegotiationError> {
        let plan = self.begin(peer)?;
        let _in_flight = self.registry.begin_request(&peer.id);
        let advert = peer.advert();
        let mut last_error = None;

        for kind in &plan {
            let Some(transport) = self.transport(*kind) else {
                continue;
            };

            let result = match timeout(
                self.config.request_timeout(),
                transport.call(&advert, request.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };

            match result {
                Ok(response) => {
                    log::debug!(
                        "{} to {} via {} -> {}",
                        request.type_name(),
                        peer.id,
                        kind,
                        response.type_name()
                    );
                    self.succeeded(&peer.id, *kind).await;
                    return Ok(response);
                }
                Err(e) => {
                    log::debug!(
                        "{} to {} via {} failed: {}",
                        request.type_name(),
                        peer.id,
                        kind,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(self.exhausted(&peer.id, plan.len(), last_error).await)
    }

    /// Open a chunked transfer of `hash` from a registered peer
    pub async fn open_stream(
        &self,
        peer_id: &str,
        hash: &str,
    ) -> Result<ChunkStream, NegotiationError> {
        let peer = self
            .registry
            .get(peer_id)
            .await
            .ok_or_else(|| NegotiationError::UnknownPeer(peer_id.to_string()))?;

        let plan = self.begin(&peer)?;
        let _in_flight = self.registry.begin_request(&peer.id);
        let advert = peer.advert();
        let mut last_error = None;

        for kind in &plan {
            let Some(transport) = self.transport(*kind) else {
                continue;
            };

            let result = match timeout(
                self.config.request_timeout(),
                transport.open_stream(&advert, hash),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };

            match result {
                Ok(stream) => {
                    log::debug!("Streaming {} from {} via {}", hash, peer.id, kind);
                    self.succeeded(&peer.id, *kind).await;
                    return Ok(stream);
                }
                Err(e) => {
                    log::debug!("Stream of {} from {} via {} failed: {}", hash, peer.id, kind, e);
                    last_error = Some(e);
                }
            }
        }

        Err(self.exhausted(&peer.id, plan.len(), last_error).await)
    }

    /// Breaker state for a peer
    pub fn circuit_state(&self, peer_id: &str) -> CircuitState {
        lock(&self.breakers)
            .get(peer_id)
            .map(|b| b.state(Instant::now()))
            .unwrap_or(CircuitState::Closed)
    }

    /// Close pooled connections idle past the configured timeout
    pub async fn recycle_idle(&self) -> usize {
        let idle = self.config.idle_timeout();
        let mut closed = 0;
        for transport in &self.transports {
            closed += transport.close_idle(idle).await;
        }
        closed
    }

    /// Recycle idle connections until shutdown
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = (self.config.idle_timeout() / 2).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.recycle_idle().await;
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        for transport in &self.transports {
            transport.shutdown().await;
        }
    }

    // =========================================================================
    // Private helpers
    // =========================================================================

    fn transport(&self, kind: TransportKind) -> Option<&Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.kind() == kind)
    }

    /// Check the breaker and build the transport plan
    fn begin(&self, peer: &PeerNode) -> Result<Vec<TransportKind>, NegotiationError> {
        if let Some(breaker) = lock(&self.breakers).get(&peer.id) {
            if let Err(retry_in) = breaker.check(Instant::now()) {
                return Err(NegotiationError::CircuitOpen {
                    peer: peer.id.clone(),
                    retry_in,
                });
            }
        }

        let available: Vec<TransportKind> = self.transports.iter().map(|t| t.kind()).collect();
        let plan = self
            .strategy
            .plan(&peer.id, peer.capabilities.transports, &available);
        if plan.is_empty() {
            return Err(NegotiationError::NoCommonTransport(peer.id.clone()));
        }
        Ok(plan)
    }

    async fn succeeded(&self, peer_id: &str, kind: TransportKind) {
        self.strategy.remember(peer_id, kind);

        let was_open = lock(&self.breakers)
            .remove(peer_id)
            .map(|b| b.open_until.is_some())
            .unwrap_or(false);
        if was_open {
            log::info!("Circuit for {} closed", peer_id);
        }

        // Seeds contacted before registration are not in the registry yet
        if self.registry.get(peer_id).await.is_some() {
            let _ = self.registry.record_success(peer_id).await;
        }
    }

    async fn exhausted(
        &self,
        peer_id: &str,
        attempts: usize,
        last_error: Option<TransportError>,
    ) -> NegotiationError {
        self.strategy.forget(peer_id);

        let opened = {
            let mut breakers = lock(&self.breakers);
            let breaker = breakers.entry(peer_id.to_string()).or_insert_with(|| {
                CircuitBreaker::new(
                    self.config.breaker_threshold,
                    self.config.breaker_base_backoff(),
                    self.config.breaker_max_backoff(),
                )
            });
            breaker
                .on_failure(Instant::now())
                .then(|| breaker.backoff())
        };
        if let Some(backoff) = opened {
            log::warn!("Circuit for {} opened for {:?}", peer_id, backoff);
        }

        if self.registry.get(peer_id).await.is_some() {
            let _ = self.registry.record_failure(peer_id).await;
        }

        NegotiationError::Exhausted {
            peer: peer_id.to_string(),
            attempts,
            last_error: last_error.unwrap_or(TransportError::Closed),
        }
    }
}
