//! Shared test doubles

use crate::api::ApiState;
use crate::config::{
    AddressConfig, DiscoveryConfig, GossipConfig, NegotiatorConfig, QueueConfig, RegistryConfig,
};
use crate::gossip::{AcceptOutcome, GossipDistributor, GossipError, LedgerEngine};
use crate::network::address::AddressDiscovery;
use crate::network::discovery::PeerDiscovery;
use crate::network::message::{
    Capabilities, PeerAdvert, PeerId, PeerRequest, PeerResponse, TransactionChunk,
};
use crate::network::negotiator::Negotiator;
use crate::network::peer::{LocalPeer, PeerNode, PeerState};
use crate::network::registry::PeerRegistry;
use crate::network::service::{ChunkSource, PeerService};
use crate::network::transport::{ChunkStream, Transport, TransportError, TransportKind};
use crate::queue::{DeadLetter, DeadLetterSink, DistributionTarget, OfflineQueue};
use crate::storage::Storage;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use chrono::Utc;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

type Reply = Result<PeerResponse, TransportError>;
type Handler = dyn Fn(&PeerAdvert, &PeerRequest) -> Reply + Send + Sync;

/// Scriptable in-process transport
pub struct MockTransport {
    kind: TransportKind,
    handler: Box<Handler>,
    delay: Option<Duration>,
    chunks: Option<Vec<TransactionChunk>>,
    calls: Mutex<Vec<(PeerId, &'static str)>>,
    streams: Mutex<Vec<PeerId>>,
}

impl MockTransport {
    pub fn answering<F>(handler: F) -> Self
    where
        F: Fn(&PeerAdvert, &PeerRequest) -> Reply + Send + Sync + 'static,
    {
        Self {
            kind: TransportKind::Stream,
            handler: Box::new(handler),
            delay: None,
            chunks: None,
            calls: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
        }
    }

    /// Every call is acknowledged
    pub fn acking() -> Self {
        Self::answering(|_, _| Ok(PeerResponse::Ack))
    }

    /// Every call fails to connect
    pub fn unreachable() -> Self {
        Self::answering(|peer, _| Err(TransportError::ConnectionFailed(peer.rpc_endpoint())))
    }

    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Serve `payload` to stream requests, split into `chunk_size` pieces
    pub fn serving(self, payload: Vec<u8>, chunk_size: usize) -> Self {
        let chunks = ChunkSource::new(Bytes::from(payload), chunk_size).collect();
        self.streaming_chunks(chunks)
    }

    /// Answer stream requests with exactly these chunks
    pub fn streaming_chunks(mut self, chunks: Vec<TransactionChunk>) -> Self {
        self.chunks = Some(chunks);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_of(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(_, name)| *name == op).count()
    }

    /// Peer ids in call order
    pub fn peers_called(&self) -> Vec<PeerId> {
        self.calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn call(
        &self,
        peer: &PeerAdvert,
        request: PeerRequest,
    ) -> Result<PeerResponse, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((peer.id.clone(), request.type_name()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(peer, &request)
    }

    async fn open_stream(
        &self,
        peer: &PeerAdvert,
        _hash: &str,
    ) -> Result<ChunkStream, TransportError> {
        self.streams.lock().unwrap().push(peer.id.clone());
        match &self.chunks {
            Some(chunks) => Ok(futures::stream::iter(chunks.clone().into_iter().map(Ok)).boxed()),
            None => Err(TransportError::ConnectionFailed(peer.rpc_endpoint())),
        }
    }
}

pub fn advert(id: &str) -> PeerAdvert {
    PeerAdvert {
        id: id.to_string(),
        address: "127.0.0.1".to_string(),
        port: 7400,
        http_port: 7401,
        capabilities: Capabilities::current(),
    }
}

pub fn healthy_peer(id: &str) -> PeerNode {
    let mut peer = PeerNode::from_advert(advert(id), false);
    peer.state = PeerState::Healthy;
    peer
}

/// Register `n` healthy peers named `peer-0..`
pub async fn add_healthy_peers(registry: &PeerRegistry, n: usize) -> Vec<PeerId> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let id = format!("peer-{}", i);
        registry.upsert(healthy_peer(&id)).await.unwrap();
        registry.record_success(&id).await.unwrap();
        ids.push(id);
    }
    ids
}

/// Ledger that records what it was given
#[derive(Default)]
pub struct RecordingLedger {
    accepted: Mutex<Vec<Vec<u8>>>,
    reject: Mutex<Option<String>>,
}

impl RecordingLedger {
    pub fn accepted(&self) -> Vec<Vec<u8>> {
        self.accepted.lock().unwrap().clone()
    }

    pub fn reject_all(&self, reason: &str) {
        *self.reject.lock().unwrap() = Some(reason.to_string());
    }
}

#[async_trait]
impl LedgerEngine for RecordingLedger {
    async fn accept_transaction(&self, payload: &[u8]) -> AcceptOutcome {
        if let Some(reason) = self.reject.lock().unwrap().clone() {
            return AcceptOutcome::Rejected(reason);
        }
        self.accepted.lock().unwrap().push(payload.to_vec());
        AcceptOutcome::Accepted
    }
}

#[derive(Default)]
pub struct RecordingSink {
    reported: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn reported(&self) -> Vec<String> {
        self.reported.lock().unwrap().clone()
    }
}

impl DeadLetterSink for RecordingSink {
    fn report(&self, letter: &DeadLetter) {
        self.reported.lock().unwrap().push(letter.item.hash.clone());
    }
}

/// Distribution target that fails chosen hashes a set number of times
pub struct ScriptedTarget {
    failures: Mutex<HashMap<String, u32>>,
    ready: AtomicBool,
    attempts: Mutex<Vec<String>>,
}

impl ScriptedTarget {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(true),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// `u32::MAX` fails forever
    pub fn fail_times(&self, hash: &str, times: u32) {
        self.failures.lock().unwrap().insert(hash.to_string(), times);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl DistributionTarget for ScriptedTarget {
    async fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn redistribute(&self, hash: &str, _payload: &[u8]) -> Result<usize, GossipError> {
        self.attempts.lock().unwrap().push(hash.to_string());
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(hash) {
            Some(0) | None => Ok(1),
            Some(n) => {
                if *n != u32::MAX {
                    *n -= 1;
                }
                Err(GossipError::NoPeersReached)
            }
        }
    }
}

/// A distributor wired to one mock transport, with local id `local`
pub struct GossipFixture {
    pub dir: TempDir,
    pub local: Arc<LocalPeer>,
    pub registry: Arc<PeerRegistry>,
    pub negotiator: Arc<Negotiator>,
    pub queue: Arc<OfflineQueue>,
    pub gossip: Arc<GossipDistributor>,
    pub ledger: Arc<RecordingLedger>,
    pub sink: Arc<RecordingSink>,
    pub transport: Arc<MockTransport>,
    pub config: GossipConfig,
}

impl GossipFixture {
    pub fn service(&self) -> PeerService {
        PeerService::new(
            Arc::clone(&self.local),
            Arc::clone(&self.registry),
            Arc::clone(&self.gossip),
            &self.config,
        )
    }
}

pub async fn gossip_fixture(transport: MockTransport, min_healthy_peers: usize) -> GossipFixture {
    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(LocalPeer::new(advert("local")));
    let registry = Arc::new(PeerRegistry::new("local", RegistryConfig::default()));
    let transport = Arc::new(transport);
    let negotiator = Arc::new(Negotiator::new(
        Arc::clone(&registry),
        vec![transport.clone() as Arc<dyn Transport>],
        NegotiatorConfig::default(),
    ));

    let sink = Arc::new(RecordingSink::default());
    let queue = Arc::new(
        OfflineQueue::open(
            Storage::new(dir.path()).unwrap(),
            QueueConfig::default(),
            sink.clone(),
        )
        .unwrap(),
    );

    let config = GossipConfig {
        bloom_bits: 1 << 16,
        ..Default::default()
    };
    let ledger = Arc::new(RecordingLedger::default());
    let gossip = Arc::new(GossipDistributor::new(
        Arc::clone(&local),
        Arc::clone(&registry),
        Arc::clone(&negotiator),
        ledger.clone(),
        Arc::clone(&queue),
        config.clone(),
        min_healthy_peers,
    ));

    GossipFixture {
        dir,
        local,
        registry,
        negotiator,
        queue,
        gossip,
        ledger,
        sink,
        transport,
        config,
    }
}

/// API state over a fixture, with a fixed external address
pub fn api_state(fixture: &GossipFixture) -> ApiState {
    let address = AddressDiscovery::new(
        AddressConfig {
            external_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..Default::default()
        },
        7400,
        7401,
    )
    .unwrap();
    ApiState {
        local: Arc::clone(&fixture.local),
        registry: Arc::clone(&fixture.registry),
        negotiator: Arc::clone(&fixture.negotiator),
        gossip: Arc::clone(&fixture.gossip),
        queue: Arc::clone(&fixture.queue),
        discovery: Arc::new(PeerDiscovery::new(
            Arc::clone(&fixture.local),
            Arc::clone(&fixture.registry),
            Arc::clone(&fixture.negotiator),
            DiscoveryConfig::default(),
        )),
        address: Arc::new(address),
        service: Arc::new(fixture.service()),
        body_limit: 4 * 1024 * 1024,
        started_at: Utc::now(),
        shutdown: CancellationToken::new(),
    }
}
