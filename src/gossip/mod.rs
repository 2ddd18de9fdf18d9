//! Transaction gossip
//!
//! Epidemic distribution with Bloom-filter de-duplication, payload pulls and
//! a bounded cache of payloads this node can serve.

pub mod bloom;
pub mod cache;
pub mod distributor;
pub mod ledger;

pub use bloom::BloomFilter;
pub use cache::PayloadCache;
pub use distributor::{
    fanout_size, transaction_hash, GossipDistributor, GossipError, NotificationOutcome,
    SubmitOutcome,
};
pub use ledger::{AcceptAllLedger, AcceptOutcome, LedgerEngine};
