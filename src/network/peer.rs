//! Peer records and their health state machine
//!
//! A peer moves `Discovered → Healthy → Unhealthy → Evicted`. Transitions are
//! computed by the pure [`transition`] function so the rules can be tested
//! apart from any networking code; the registry is the only caller that
//! applies them.

use crate::network::message::{Capabilities, PeerAdvert, PeerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Health state of a known peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerState {
    /// Learned of, never contacted
    Discovered,
    Healthy,
    /// Failed recently, still eligible for contact
    Unhealthy,
    /// Terminal; retained briefly for diagnostics
    Evicted,
}

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    ContactSucceeded,
    /// `failures` is the count after this failure was recorded
    ContactFailed { failures: u32, threshold: u32 },
    Evict,
}

/// Next state for `state` given `event`
pub fn transition(state: PeerState, event: PeerEvent) -> PeerState {
    match (state, event) {
        (PeerState::Evicted, _) => PeerState::Evicted,
        (_, PeerEvent::Evict) => PeerState::Evicted,
        (_, PeerEvent::ContactSucceeded) => PeerState::Healthy,
        (_, PeerEvent::ContactFailed { failures, threshold }) if failures >= threshold => {
            PeerState::Evicted
        }
        (_, PeerEvent::ContactFailed { .. }) => PeerState::Unhealthy,
    }
}

/// One known remote node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerNode {
    pub id: PeerId,
    pub address: String,
    pub port: u16,
    pub http_port: u16,
    pub capabilities: Capabilities,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Consecutive failed contacts
    pub failure_count: u32,
    pub is_bootstrap: bool,
    pub state: PeerState,
    /// When the peer entered `Evicted`
    #[serde(default)]
    pub evicted_at: Option<DateTime<Utc>>,
}

impl PeerNode {
    /// Fresh record for a peer learned from an advert
    pub fn from_advert(advert: PeerAdvert, is_bootstrap: bool) -> Self {
        let now = Utc::now();
        Self {
            id: advert.id,
            address: advert.address,
            port: advert.port,
            http_port: advert.http_port,
            capabilities: advert.capabilities,
            first_seen: now,
            last_seen: now,
            failure_count: 0,
            is_bootstrap,
            state: PeerState::Discovered,
            evicted_at: None,
        }
    }

    /// Wire description of this peer
    pub fn advert(&self) -> PeerAdvert {
        PeerAdvert {
            id: self.id.clone(),
            address: self.address.clone(),
            port: self.port,
            http_port: self.http_port,
            capabilities: self.capabilities,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == PeerState::Healthy
    }

    pub fn is_evicted(&self) -> bool {
        self.state == PeerState::Evicted
    }
}

/// This node's own identity, shared by every component that advertises it.
///
/// The address changes when external-address discovery learns something new,
/// so it sits behind a lock.
#[derive(Debug)]
pub struct LocalPeer {
    advert: RwLock<PeerAdvert>,
}

impl LocalPeer {
    pub fn new(advert: PeerAdvert) -> Self {
        Self {
            advert: RwLock::new(advert),
        }
    }

    pub async fn id(&self) -> PeerId {
        self.advert.read().await.id.clone()
    }

    pub async fn advert(&self) -> PeerAdvert {
        self.advert.read().await.clone()
    }

    /// Replace the advertised address; returns true if it changed
    pub async fn set_address(&self, address: String) -> bool {
        let mut advert = self.advert.write().await;
        if advert.address == address {
            return false;
        }
        advert.address = address;
        true
    }

    /// Record the ports actually bound (matters when configured as 0)
    pub async fn set_ports(&self, port: u16, http_port: u16) {
        let mut advert = self.advert.write().await;
        advert.port = port;
        advert.http_port = http_port;
    }
}
