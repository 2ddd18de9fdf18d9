//! Inbound peer protocol
//!
//! Answers the six peer operations. Every transport server (framed TCP,
//! WebSocket, REST) decodes its wire format and hands the request here, so
//! the semantics are the same whichever way a peer reached us.

use crate::config::GossipConfig;
use crate::gossip::GossipDistributor;
use crate::network::message::{PeerRequest, PeerResponse, TransactionChunk, MAX_PEER_PAGE};
use crate::network::peer::{LocalPeer, PeerNode};
use crate::network::registry::{PeerRegistry, RegistryError};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;

/// Handler shared by all inbound transports
pub struct PeerService {
    local: Arc<LocalPeer>,
    registry: Arc<PeerRegistry>,
    gossip: Arc<GossipDistributor>,
    chunk_size: usize,
    stream_threshold: usize,
}

impl PeerService {
    pub fn new(
        local: Arc<LocalPeer>,
        registry: Arc<PeerRegistry>,
        gossip: Arc<GossipDistributor>,
        config: &GossipConfig,
    ) -> Self {
        Self {
            local,
            registry,
            gossip,
            chunk_size: config.chunk_size.max(1),
            stream_threshold: config.stream_threshold,
        }
    }

    /// Answer a request/response operation
    pub async fn handle(&self, request: PeerRequest) -> PeerResponse {
        match request {
            PeerRequest::RegisterPeer { advert } => {
                let id = advert.id.clone();
                match self.registry.upsert(PeerNode::from_advert(advert, false)).await {
                    Ok(outcome) => {
                        log::debug!("Peer {} registered with us ({:?})", id, outcome);
                        PeerResponse::Registered {
                            advert: self.local.advert().await,
                        }
                    }
                    Err(RegistryError::SelfRegistration) => PeerResponse::Error {
                        reason: "peer id collides with ours".to_string(),
                    },
                    Err(e) => PeerResponse::Error {
                        reason: e.to_string(),
                    },
                }
            }

            PeerRequest::GetPeerList { cursor, limit } => {
                let limit = limit.clamp(1, MAX_PEER_PAGE);
                let (peers, next_cursor) =
                    self.registry.page_healthy(cursor.as_deref(), limit).await;
                PeerResponse::PeerList {
                    peers: peers.iter().map(PeerNode::advert).collect(),
                    next_cursor,
                }
            }

            PeerRequest::Ping => PeerResponse::Pong {
                peer_id: self.local.id().await,
                timestamp_ms: Utc::now().timestamp_millis(),
            },

            PeerRequest::NotifyTransaction {
                sender,
                notification,
            } => {
                // Ack right away; the fetch runs against the sender on its own call
                let gossip = Arc::clone(&self.gossip);
                tokio::spawn(async move {
                    if let Err(e) = gossip.on_notification(&sender, notification).await {
                        log::debug!("Notification from {} not processed: {}", sender, e);
                    }
                });
                PeerResponse::Ack
            }

            PeerRequest::GetTransaction { hash } => match self.gossip.lookup(&hash).await {
                None => PeerResponse::NotFound,
                Some(payload) if payload.len() > self.stream_threshold => PeerResponse::Error {
                    reason: format!(
                        "payload of {} bytes must be fetched with StreamTransaction",
                        payload.len()
                    ),
                },
                Some(payload) => PeerResponse::Transaction {
                    payload: payload.to_vec(),
                },
            },

            PeerRequest::StreamTransaction { .. } => PeerResponse::Error {
                reason: "StreamTransaction needs a streaming channel".to_string(),
            },
        }
    }

    /// Chunks for a streamed transfer, or the reason it cannot be served
    pub async fn open_chunks(&self, hash: &str) -> Result<ChunkSource, String> {
        self.gossip
            .lookup(hash)
            .await
            .map(|payload| ChunkSource::new(payload, self.chunk_size))
            .ok_or_else(|| format!("transaction {} not found", hash))
    }
}

/// Splits a payload into numbered chunks without copying it up front
#[derive(Debug, Clone)]
pub struct ChunkSource {
    payload: Bytes,
    chunk_size: usize,
    next: u32,
    total: u32,
}

impl ChunkSource {
    pub fn new(payload: Bytes, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let total = payload.len().div_ceil(chunk_size).max(1) as u32;
        Self {
            payload,
            chunk_size,
            next: 0,
            total,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}

impl Iterator for ChunkSource {
    type Item = TransactionChunk;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let start = self.next as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.payload.len());
        let chunk = TransactionChunk {
            index: self.next,
            total: self.total,
            data: self.payload.slice(start..end).to_vec(),
        };
        self.next += 1;
        Some(chunk)
    }
}
