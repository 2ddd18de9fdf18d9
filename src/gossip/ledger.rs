//! Ledger engine boundary
//!
//! The ledger decides what a transaction means; this crate only delivers
//! payloads to it and uses the verdict to decide whether to keep gossiping.

use async_trait::async_trait;

/// Verdict of the ledger on a delivered payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted,
    Rejected(String),
}

/// Consumer of transactions retrieved from the network
#[async_trait]
pub trait LedgerEngine: Send + Sync {
    async fn accept_transaction(&self, payload: &[u8]) -> AcceptOutcome;
}

/// Accepts everything; used by the standalone binary
#[derive(Debug, Default)]
pub struct AcceptAllLedger;

#[async_trait]
impl LedgerEngine for AcceptAllLedger {
    async fn accept_transaction(&self, payload: &[u8]) -> AcceptOutcome {
        log::info!("Accepted transaction of {} bytes", payload.len());
        AcceptOutcome::Accepted
    }
}
