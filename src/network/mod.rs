//! P2P Networking module
//!
//! Keeps the peer set of a permissioned ledger node healthy and reachable.
//!
//! # Features
//! - Peer registry with a Discovered/Healthy/Unhealthy/Evicted state machine
//! - External address discovery (configured, UPnP, STUN, HTTP)
//! - Seed bootstrap, bounded crawl and periodic refresh
//! - Transport negotiation (WebSocket stream, framed RPC, REST) with circuit breaking
//! - Heartbeat probing and eviction

pub mod address;
pub mod discovery;
pub mod health;
pub mod message;
pub mod negotiator;
pub mod node;
pub mod peer;
pub mod registry;
pub mod server;
pub mod service;
pub mod transport;
pub mod upnp;

pub use address::{AddressDiscovery, AddressError, AddressSource, ExternalAddress};
pub use discovery::{DiscoveryError, DiscoveryMode, PeerDiscovery};
pub use health::{HealthMonitor, HealthReport};
pub use message::{
    Capabilities, PeerAdvert, PeerId, PeerRequest, PeerResponse, TransactionChunk,
    TransactionNotification, TransportFlags, TxHash, MAGIC, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
pub use negotiator::{CircuitBreaker, CircuitState, NegotiationError, Negotiator};
pub use node::{Node, NodeError};
pub use peer::{LocalPeer, PeerNode, PeerState};
pub use registry::{PeerRegistry, RegistryError, RegistryStats};
pub use server::Server;
pub use service::PeerService;
pub use transport::{Transport, TransportError, TransportKind};
pub use upnp::UpnpMapper;
