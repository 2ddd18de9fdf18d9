//! REST API handlers
//!
//! Two audiences share the HTTP port: operators (`/api/...`) and other nodes
//! using the REST fallback transport (`/p2p/...`). Peer routes decode their
//! request and hand it to the same [`PeerService`] the other transports use.

use crate::gossip::{GossipDistributor, GossipError, SubmitOutcome};
use crate::network::address::{AddressDiscovery, ExternalAddress};
use crate::network::discovery::{DiscoveryMode, PeerDiscovery};
use crate::network::message::{PeerAdvert, PeerRequest, PeerResponse, TxHash};
use crate::network::negotiator::{CircuitState, Negotiator};
use crate::network::peer::{LocalPeer, PeerState};
use crate::network::registry::{PeerRegistry, RegistryStats};
use crate::network::service::PeerService;
use crate::network::transport::http::{NotifyBody, PeerListQuery};
use crate::queue::{DeadLetter, OfflineQueue, QueueItem};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Page size when a peer-list request names none
const DEFAULT_PEER_PAGE: usize = 100;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub local: Arc<LocalPeer>,
    pub registry: Arc<PeerRegistry>,
    pub negotiator: Arc<Negotiator>,
    pub gossip: Arc<GossipDistributor>,
    pub queue: Arc<OfflineQueue>,
    pub discovery: Arc<PeerDiscovery>,
    pub address: Arc<AddressDiscovery>,
    pub service: Arc<PeerService>,
    /// Largest request body accepted (hex doubles payload size)
    pub body_limit: usize,
    pub started_at: DateTime<Utc>,
    /// Closes long-lived WebSocket sessions on shutdown
    pub shutdown: CancellationToken,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub advert: PeerAdvert,
    pub external_address: Option<ExternalAddress>,
    pub discovery: DiscoveryMode,
    pub bootstrap_attempts: u32,
    pub peers: RegistryStats,
    pub queue_len: usize,
    pub dead_letters: usize,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub http_port: u16,
    pub state: PeerState,
    pub failure_count: u32,
    pub is_bootstrap: bool,
    pub last_seen: DateTime<Utc>,
    pub circuit: CircuitState,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub hash: TxHash,
    #[serde(flatten)]
    pub outcome: SubmitOutcome,
}

/// Queue entry without its payload
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub seq: u64,
    pub hash: TxHash,
    pub size: usize,
    pub queued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl From<&QueueItem> for QueueEntry {
    fn from(item: &QueueItem) -> Self {
        Self {
            seq: item.seq,
            hash: item.hash.clone(),
            size: item.payload.len(),
            queued_at: item.queued_at,
            retry_count: item.retry_count,
            last_attempt: item.last_attempt,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub hash: TxHash,
    pub size: usize,
    pub retry_count: u32,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

impl From<&DeadLetter> for DeadLetterEntry {
    fn from(letter: &DeadLetter) -> Self {
        Self {
            hash: letter.item.hash.clone(),
            size: letter.item.payload.len(),
            retry_count: letter.item.retry_count,
            reason: letter.reason.clone(),
            dead_at: letter.dead_at,
        }
    }
}

#[derive(Serialize)]
pub struct ApiError {
    pub error: String,
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Deserialize)]
pub struct SubmitRequest {
    /// Hex-encoded transaction payload
    pub payload: String,
}

impl ApiState {
    /// Snapshot of the node for operators
    pub async fn status(&self) -> NodeStatus {
        let now = Utc::now();
        NodeStatus {
            advert: self.local.advert().await,
            external_address: self.address.last_known().await,
            discovery: self.discovery.mode().await,
            bootstrap_attempts: self.discovery.bootstrap_attempts(),
            peers: self.registry.stats().await,
            queue_len: self.queue.len().await,
            dead_letters: self.queue.dead_letters().await.len(),
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
        }
    }
}

// ============================================================================
// Operator Handlers
// ============================================================================

/// GET /health - Liveness check
pub async fn health_check() -> &'static str {
    "OK"
}

/// GET /api/status - Node overview
pub async fn get_status(State(state): State<ApiState>) -> Json<NodeStatus> {
    Json(state.status().await)
}

/// GET /api/peers - Every known peer with its circuit state
pub async fn list_peers(State(state): State<ApiState>) -> Json<Vec<PeerInfo>> {
    let peers = state
        .registry
        .list_all()
        .await
        .into_iter()
        .map(|peer| PeerInfo {
            circuit: state.negotiator.circuit_state(&peer.id),
            id: peer.id,
            address: peer.address,
            port: peer.port,
            http_port: peer.http_port,
            state: peer.state,
            failure_count: peer.failure_count,
            is_bootstrap: peer.is_bootstrap,
            last_seen: peer.last_seen,
        })
        .collect();
    Json(peers)
}

/// POST /api/transactions - Submit a transaction for distribution
pub async fn submit_transaction(
    State(state): State<ApiState>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, Json<ApiError>)> {
    let payload = hex::decode(req.payload.trim()).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ApiError {
                error: format!("Invalid hex payload: {}", e),
            }),
        )
    })?;

    match state.gossip.submit_for_distribution(payload).await {
        Ok((hash, outcome)) => Ok(Json(SubmitResponse { hash, outcome })),
        Err(e) => {
            let status = match e {
                GossipError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                GossipError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            Err((
                status,
                Json(ApiError {
                    error: e.to_string(),
                }),
            ))
        }
    }
}

/// GET /api/queue - Transactions waiting for peers
pub async fn get_queue(State(state): State<ApiState>) -> Json<Vec<QueueEntry>> {
    Json(state.queue.pending().await.iter().map(QueueEntry::from).collect())
}

/// GET /api/queue/dead-letters - Transactions that ran out of retries
pub async fn get_dead_letters(State(state): State<ApiState>) -> Json<Vec<DeadLetterEntry>> {
    Json(
        state
            .queue
            .dead_letters()
            .await
            .iter()
            .map(DeadLetterEntry::from)
            .collect(),
    )
}

// ============================================================================
// Peer Handlers
// ============================================================================

/// Every peer route answers with a `PeerResponse`, error statuses included
fn reply(response: PeerResponse) -> (StatusCode, Json<PeerResponse>) {
    let status = match response {
        PeerResponse::NotFound => StatusCode::NOT_FOUND,
        PeerResponse::Error { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    };
    (status, Json(response))
}

/// POST /p2p/register
pub async fn p2p_register(
    State(state): State<ApiState>,
    Json(advert): Json<PeerAdvert>,
) -> (StatusCode, Json<PeerResponse>) {
    reply(state.service.handle(PeerRequest::RegisterPeer { advert }).await)
}

/// GET /p2p/peers
pub async fn p2p_peers(
    State(state): State<ApiState>,
    Query(query): Query<PeerListQuery>,
) -> (StatusCode, Json<PeerResponse>) {
    let request = PeerRequest::GetPeerList {
        cursor: query.cursor,
        limit: query.limit.unwrap_or(DEFAULT_PEER_PAGE),
    };
    reply(state.service.handle(request).await)
}

/// GET /p2p/ping
pub async fn p2p_ping(State(state): State<ApiState>) -> (StatusCode, Json<PeerResponse>) {
    reply(state.service.handle(PeerRequest::Ping).await)
}

/// POST /p2p/notify
pub async fn p2p_notify(
    State(state): State<ApiState>,
    Json(body): Json<NotifyBody>,
) -> (StatusCode, Json<PeerResponse>) {
    let request = PeerRequest::NotifyTransaction {
        sender: body.sender,
        notification: body.notification,
    };
    reply(state.service.handle(request).await)
}

/// GET /p2p/transactions/{hash}
pub async fn p2p_get_transaction(
    State(state): State<ApiState>,
    Path(hash): Path<String>,
) -> (StatusCode, Json<PeerResponse>) {
    reply(state.service.handle(PeerRequest::GetTransaction { hash }).await)
}

/// GET /p2p/transactions/{hash}/stream - Newline-delimited JSON chunks
pub async fn p2p_stream_transaction(
    State(state): State<ApiState>,
    Path(hash): Path<String>,
) -> Response {
    let chunks = match state.service.open_chunks(&hash).await {
        Ok(chunks) => chunks,
        Err(reason) => {
            return (StatusCode::NOT_FOUND, Json(PeerResponse::Error { reason })).into_response()
        }
    };

    let lines = futures::stream::iter(chunks.map(|chunk| {
        serde_json::to_vec(&chunk).map(|mut line| {
            line.push(b'\n');
            bytes::Bytes::from(line)
        })
    }));

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}
