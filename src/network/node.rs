//! P2P Node implementation
//!
//! The main node that wires every networking component together, owns the
//! listeners and background workers, and shuts them down as one.

use crate::api::{create_router, ApiState, NodeStatus};
use crate::config::{ConfigError, NodeConfig};
use crate::gossip::{GossipDistributor, GossipError, LedgerEngine, SubmitOutcome};
use crate::network::address::{AddressDiscovery, AddressError};
use crate::network::discovery::PeerDiscovery;
use crate::network::health::HealthMonitor;
use crate::network::message::{Capabilities, PeerAdvert, PeerId, TxHash};
use crate::network::negotiator::Negotiator;
use crate::network::peer::{LocalPeer, PeerNode};
use crate::network::registry::PeerRegistry;
use crate::network::server::Server;
use crate::network::service::PeerService;
use crate::network::transport::{
    HttpTransport, RpcTransport, StreamTransport, Transport, TransportError,
};
use crate::queue::{DistributionTarget, LogDeadLetterSink, OfflineQueue, QueueError};
use crate::storage::{Storage, StorageError, PEERS_FILE};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for workers before flushing anyway
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Hex doubles the payload; leave room for the JSON around it
const BODY_OVERHEAD: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Address discovery error: {0}")]
    Address(#[from] AddressError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Node already started")]
    AlreadyStarted,
}

/// Bound but not yet serving
struct Listeners {
    rpc: Server,
    http: TcpListener,
}

/// The main P2P node
pub struct Node {
    config: NodeConfig,
    storage: Storage,
    local: Arc<LocalPeer>,
    registry: Arc<PeerRegistry>,
    negotiator: Arc<Negotiator>,
    gossip: Arc<GossipDistributor>,
    queue: Arc<OfflineQueue>,
    discovery: Arc<PeerDiscovery>,
    health: Arc<HealthMonitor>,
    address: Arc<AddressDiscovery>,
    service: Arc<PeerService>,
    listeners: Mutex<Option<Listeners>>,
    rpc_addr: SocketAddr,
    http_addr: SocketAddr,
    started_at: DateTime<Utc>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a node: validate config, load persisted state and bind the
    /// listeners. Nothing is served until [`start`](Self::start).
    pub async fn new(config: NodeConfig, ledger: Arc<dyn LedgerEngine>) -> Result<Self, NodeError> {
        config.validate()?;

        let storage = Storage::new(&config.data_dir)?;
        let id = storage.load_or_create_node_id()?;

        let rpc = Server::bind(config.rpc_bind_addr()).await?;
        let http = TcpListener::bind(config.http_bind_addr()).await?;
        let rpc_addr = rpc.local_addr();
        let http_addr = http.local_addr()?;
        log::info!("HTTP server listening on {}", http_addr);

        // Placeholder until the external address is resolved on start
        let address = match config.address.external_address {
            Some(ip) => ip.to_string(),
            None if config.listen_addr.is_unspecified() => "127.0.0.1".to_string(),
            None => config.listen_addr.to_string(),
        };
        let local = Arc::new(LocalPeer::new(PeerAdvert {
            id: id.clone(),
            address,
            port: rpc_addr.port(),
            http_port: http_addr.port(),
            capabilities: Capabilities::current(),
        }));

        let registry = Arc::new(PeerRegistry::new(id.clone(), config.registry.clone()));
        if config.registry.persist {
            if let Some(snapshot) = storage.load::<Vec<PeerNode>>(PEERS_FILE)? {
                let restored = registry.restore(snapshot).await;
                log::info!("Restored {} peers from disk", restored);
            }
        }

        let transports: Vec<Arc<dyn Transport>> = vec![
            Arc::new(StreamTransport::new(config.negotiator.max_connections_per_peer)),
            Arc::new(RpcTransport::new()),
            Arc::new(HttpTransport::new(
                config.negotiator.max_connections_per_peer,
                config.negotiator.idle_timeout(),
            )?),
        ];
        let negotiator = Arc::new(Negotiator::new(
            Arc::clone(&registry),
            transports,
            config.negotiator.clone(),
        ));

        let queue = Arc::new(OfflineQueue::open(
            storage.clone(),
            config.queue.clone(),
            Arc::new(LogDeadLetterSink),
        )?);

        let gossip = Arc::new(GossipDistributor::new(
            Arc::clone(&local),
            Arc::clone(&registry),
            Arc::clone(&negotiator),
            ledger,
            Arc::clone(&queue),
            config.gossip.clone(),
            config.health.min_healthy_peers,
        ));
        let service = Arc::new(PeerService::new(
            Arc::clone(&local),
            Arc::clone(&registry),
            Arc::clone(&gossip),
            &config.gossip,
        ));

        let address = Arc::new(AddressDiscovery::new(
            config.address.clone(),
            rpc_addr.port(),
            http_addr.port(),
        )?);
        let discovery = Arc::new(
            PeerDiscovery::new(
                Arc::clone(&local),
                Arc::clone(&registry),
                Arc::clone(&negotiator),
                config.discovery.clone(),
            )
            .with_address_discovery(Arc::clone(&address)),
        );

        let mut health = HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&negotiator),
            config.health.clone(),
            config.registry.evicted_retention(),
        )
        .with_discovery(Arc::clone(&discovery))
        .with_queue(Arc::clone(&queue));
        if config.registry.persist {
            health = health.with_persistence(storage.clone());
        }

        log::info!("Node {} created", id);

        Ok(Self {
            config,
            storage,
            local,
            registry,
            negotiator,
            gossip,
            queue,
            discovery,
            health: Arc::new(health),
            address,
            service,
            listeners: Mutex::new(Some(Listeners { rpc, http })),
            rpc_addr,
            http_addr,
            started_at: Utc::now(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Resolve the external address, then start serving and spawn every
    /// background worker
    pub async fn start(&self) -> Result<(), NodeError> {
        let listeners = self
            .listeners
            .lock()
            .await
            .take()
            .ok_or(NodeError::AlreadyStarted)?;

        let external = self.address.resolve().await;
        self.local.set_address(external.ip.to_string()).await;

        let token = self.shutdown.clone();
        let mut workers = self.workers.lock().await;

        // Servers
        workers.push(tokio::spawn(
            listeners.rpc.run(Arc::clone(&self.service), token.clone()),
        ));
        let router = create_router(self.api_state());
        let http_token = token.clone();
        workers.push(tokio::spawn(async move {
            let served = axum::serve(listeners.http, router)
                .with_graceful_shutdown(async move { http_token.cancelled().await })
                .await;
            if let Err(e) = served {
                log::error!("HTTP server error: {}", e);
            }
        }));

        // Background workers
        workers.push(tokio::spawn(Arc::clone(&self.negotiator).run(token.clone())));
        let target: Arc<dyn DistributionTarget> = self.gossip.clone();
        workers.push(tokio::spawn(Arc::clone(&self.queue).run(target, token.clone())));
        workers.push(tokio::spawn(Arc::clone(&self.gossip).run_bloom_reset(token.clone())));
        workers.push(tokio::spawn(Arc::clone(&self.discovery).run(token.clone())));
        workers.push(tokio::spawn(
            Arc::clone(&self.discovery).run_address_recheck(token.clone()),
        ));
        workers.push(tokio::spawn(Arc::clone(&self.health).run(token.clone())));

        if let Some(upnp) = self.address.upnp() {
            if upnp.is_mapped().await {
                let renewal_token = token.clone();
                workers.push(tokio::spawn(async move {
                    upnp.run_renewal(renewal_token).await;
                }));
            }
        }

        log::info!(
            "Node {} started (rpc {}, http {}, advertised as {})",
            self.registry.local_id(),
            self.rpc_addr,
            self.http_addr,
            external.ip
        );
        Ok(())
    }

    /// Hand a new transaction to the gossip layer
    pub async fn submit_for_distribution(
        &self,
        payload: Vec<u8>,
    ) -> Result<(TxHash, SubmitOutcome), GossipError> {
        self.gossip.submit_for_distribution(payload).await
    }

    /// Stop workers, then persist queue and registry
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        log::info!("Node shutting down...");
        self.shutdown.cancel();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(workers))
            .await
            .is_err()
        {
            log::warn!("Workers still running after {:?}; flushing anyway", SHUTDOWN_GRACE);
        }

        self.negotiator.shutdown().await;
        self.queue.flush().await?;
        if self.config.registry.persist {
            self.storage.save(PEERS_FILE, &self.registry.snapshot().await)?;
        }
        if let Some(upnp) = self.address.upnp() {
            upnp.cleanup().await;
        }

        log::info!("Node stopped");
        Ok(())
    }

    /// State shared with the HTTP handlers
    pub fn api_state(&self) -> ApiState {
        ApiState {
            local: Arc::clone(&self.local),
            registry: Arc::clone(&self.registry),
            negotiator: Arc::clone(&self.negotiator),
            gossip: Arc::clone(&self.gossip),
            queue: Arc::clone(&self.queue),
            discovery: Arc::clone(&self.discovery),
            address: Arc::clone(&self.address),
            service: Arc::clone(&self.service),
            body_limit: self.config.gossip.max_transaction_size * 2 + BODY_OVERHEAD,
            started_at: self.started_at,
            shutdown: self.shutdown.clone(),
        }
    }

    pub async fn status(&self) -> NodeStatus {
        self.api_state().status().await
    }

    pub fn id(&self) -> PeerId {
        self.registry.local_id().to_string()
    }

    pub async fn advert(&self) -> PeerAdvert {
        self.local.advert().await
    }

    /// Bound RPC listener address
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Bound HTTP listener address
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn queue(&self) -> Arc<OfflineQueue> {
        Arc::clone(&self.queue)
    }

    pub fn discovery(&self) -> Arc<PeerDiscovery> {
        Arc::clone(&self.discovery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddressConfig, DiscoveryConfig, GossipConfig, HealthConfig, SeedNode};
    use crate::testing::RecordingLedger;
    use std::future::Future;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::Path;
    use tempfile::tempdir;

    fn ledger() -> Arc<RecordingLedger> {
        Arc::new(RecordingLedger::default())
    }

    fn test_config(dir: &Path, seeds: Vec<SeedNode>) -> NodeConfig {
        NodeConfig {
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            http_port: 0,
            data_dir: dir.to_path_buf(),
            address: AddressConfig {
                external_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                stun_servers: Vec::new(),
                http_services: Vec::new(),
                ..Default::default()
            },
            discovery: DiscoveryConfig {
                seeds,
                connect_timeout_secs: 2,
                ..Default::default()
            },
            gossip: GossipConfig {
                bloom_bits: 1 << 16,
                ..Default::default()
            },
            health: HealthConfig {
                min_healthy_peers: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Nothing listens on port 1
    fn dead_seed() -> Vec<SeedNode> {
        vec![SeedNode::new("127.0.0.1", 1, 2)]
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_config_without_seeds_is_fatal() {
        let dir = tempdir().unwrap();
        let result = Node::new(test_config(dir.path(), Vec::new()), ledger()).await;
        assert!(matches!(result, Err(NodeError::Config(ConfigError::NoSeeds))));
    }

    #[tokio::test]
    async fn test_restart_keeps_identity_and_queue() {
        let dir = tempdir().unwrap();

        let node = Node::new(test_config(dir.path(), dead_seed()), ledger()).await.unwrap();
        let id = node.id();
        let (hash, outcome) = node.submit_for_distribution(b"offline tx".to_vec()).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Queued);
        assert!(matches!(node.start().await, Ok(())));
        assert!(matches!(node.start().await, Err(NodeError::AlreadyStarted)));
        node.shutdown().await.unwrap();
        drop(node);

        let node = Node::new(test_config(dir.path(), dead_seed()), ledger()).await.unwrap();
        assert_eq!(node.id(), id);
        let pending = node.queue().pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].hash, hash);
    }

    #[tokio::test]
    async fn test_two_nodes_gossip_over_localhost() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let ledger_a = ledger();

        let a = Node::new(test_config(dir_a.path(), dead_seed()), ledger_a.clone())
            .await
            .unwrap();
        a.start().await.unwrap();

        let seed = SeedNode::new("127.0.0.1", a.rpc_addr().port(), a.http_addr().port());
        let b = Node::new(test_config(dir_b.path(), vec![seed]), ledger()).await.unwrap();
        b.start().await.unwrap();

        // B bootstraps from A: A becomes a healthy bootstrap peer, B is known to A
        let b_registry = b.registry();
        eventually(|| {
            let registry = Arc::clone(&b_registry);
            async move { registry.healthy_count().await == 1 }
        })
        .await;
        let seed_peer = b.registry().get(&a.id()).await.unwrap();
        assert!(seed_peer.is_bootstrap);
        assert!(a.registry().get(&b.id()).await.is_some());

        // Inline payload
        let (_, outcome) = b.submit_for_distribution(b"small".to_vec()).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Distributing { notified: 1 });

        // Streamed payload
        let large: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        b.submit_for_distribution(large.clone()).await.unwrap();

        let ledger = ledger_a.clone();
        eventually(|| {
            let ledger = ledger.clone();
            async move { ledger.accepted().len() == 2 }
        })
        .await;
        let accepted = ledger_a.accepted();
        assert!(accepted.contains(&b"small".to_vec()));
        assert!(accepted.contains(&large));

        let status = b.status().await;
        assert_eq!(status.peers.healthy, 1);
        assert_eq!(status.queue_len, 0);

        b.shutdown().await.unwrap();
        a.shutdown().await.unwrap();
        assert!(dir_b.path().join(PEERS_FILE).exists());
    }
}
