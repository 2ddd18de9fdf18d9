//! Ledger-Gossip: peer-to-peer networking for a permissioned ledger
//!
//! This crate keeps a node connected to its network and moves transactions
//! between nodes:
//! - Peer registry with health tracking and eviction
//! - External address discovery behind NAT (UPnP, STUN, HTTP echo)
//! - Seed bootstrap, peer-list crawling and periodic refresh
//! - Transport negotiation with per-peer circuit breakers
//! - Bloom-filtered gossip with inline, fetched and chunk-streamed payloads
//! - Durable offline queue with retries and dead letters
//! - Operator REST API
//!
//! # Example
//!
//! ```rust,no_run
//! use ledger_gossip::config::NodeConfig;
//! use ledger_gossip::gossip::AcceptAllLedger;
//! use ledger_gossip::network::Node;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = NodeConfig::default();
//! config.set_seeds("10.0.0.1:7400")?;
//!
//! let node = Node::new(config, Arc::new(AcceptAllLedger)).await?;
//! node.start().await?;
//!
//! let (hash, outcome) = node.submit_for_distribution(b"transfer".to_vec()).await?;
//! println!("{} -> {:?}", hash, outcome);
//!
//! node.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod gossip;
pub mod network;
pub mod queue;
pub mod storage;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use api::{create_router, ApiState};
pub use config::{ConfigError, NodeConfig, SeedNode};
pub use gossip::{AcceptOutcome, GossipDistributor, GossipError, LedgerEngine, SubmitOutcome};
pub use network::{Node, NodeError, PeerAdvert, PeerRegistry, PeerState};
pub use queue::OfflineQueue;
pub use storage::Storage;
