//! Network message types for the peer protocol
//!
//! The same request/response pair is carried by every transport: the
//! WebSocket stream, the framed TCP RPC connection, and the REST fallback.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for frame delimiting on the RPC port
pub const MAGIC: [u8; 4] = [0x4C, 0x47, 0x53, 0x50]; // "LGSP"

/// Largest frame accepted from the wire
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound on a single peer-list page
pub const MAX_PEER_PAGE: usize = 1000;

/// Opaque, stable peer identifier
pub type PeerId = String;

/// Lowercase hex SHA-256 of a transaction payload
pub type TxHash = String;

bitflags! {
    /// Transport protocols a peer can speak
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TransportFlags: u8 {
        const STREAM = 0b0000_0001;
        const RPC = 0b0000_0010;
        const HTTP = 0b0000_0100;
    }
}

/// Protocol support of a peer. Replaced wholesale on every discovery contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub transports: TransportFlags,
    pub version: u32,
}

impl Capabilities {
    pub fn new(transports: TransportFlags, version: u32) -> Self {
        Self {
            transports,
            version,
        }
    }

    /// Everything this build supports
    pub fn current() -> Self {
        Self::new(TransportFlags::all(), PROTOCOL_VERSION)
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::current()
    }
}

/// How a peer describes itself on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAdvert {
    pub id: PeerId,
    pub address: String,
    /// Framed TCP port
    pub port: u16,
    /// HTTP port (REST + WebSocket)
    pub http_port: u16,
    pub capabilities: Capabilities,
}

impl PeerAdvert {
    /// `host:port` of the RPC listener
    pub fn rpc_endpoint(&self) -> String {
        host_port(&self.address, self.port)
    }

    /// Base URL of the HTTP listener
    pub fn http_base(&self) -> String {
        format!("http://{}", host_port(&self.address, self.http_port))
    }

    /// URL of the streaming WebSocket
    pub fn ws_url(&self) -> String {
        format!("ws://{}/p2p/ws", host_port(&self.address, self.http_port))
    }
}

/// Join host and port, bracketing IPv6 literals
pub fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Gossip message announcing a transaction.
///
/// The hash is the only de-duplication key; two notifications with the same
/// hash are the same notification whoever sent them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionNotification {
    pub hash: TxHash,
    /// Serialized payload size in bytes
    pub size: u64,
    /// Peer that first distributed the transaction
    pub origin: PeerId,
    pub hop_count: u8,
    /// Small payloads travel with the notification
    #[serde(default, with = "serde_hex::option")]
    pub inline_payload: Option<Vec<u8>>,
}

/// One piece of a streamed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionChunk {
    pub index: u32,
    pub total: u32,
    #[serde(with = "serde_hex")]
    pub data: Vec<u8>,
}

/// Inbound operations served to other nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body")]
pub enum PeerRequest {
    /// Announce ourselves to a peer
    RegisterPeer { advert: PeerAdvert },

    /// Page through the peer's healthy peers, ordered by id
    GetPeerList {
        cursor: Option<PeerId>,
        limit: usize,
    },

    /// Liveness check
    Ping,

    /// Gossip fanout message
    NotifyTransaction {
        sender: PeerId,
        notification: TransactionNotification,
    },

    /// Pull a payload after a notification
    GetTransaction { hash: TxHash },

    /// Pull a large payload as a chunk sequence
    StreamTransaction { hash: TxHash },
}

impl PeerRequest {
    /// Get operation name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            PeerRequest::RegisterPeer { .. } => "RegisterPeer",
            PeerRequest::GetPeerList { .. } => "GetPeerList",
            PeerRequest::Ping => "Ping",
            PeerRequest::NotifyTransaction { .. } => "NotifyTransaction",
            PeerRequest::GetTransaction { .. } => "GetTransaction",
            PeerRequest::StreamTransaction { .. } => "StreamTransaction",
        }
    }
}

/// Replies to [`PeerRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
pub enum PeerResponse {
    /// Registration ack carrying the responder's own advert
    Registered { advert: PeerAdvert },

    PeerList {
        peers: Vec<PeerAdvert>,
        next_cursor: Option<PeerId>,
    },

    Pong { peer_id: PeerId, timestamp_ms: i64 },

    Ack,

    Transaction {
        #[serde(with = "serde_hex")]
        payload: Vec<u8>,
    },

    NotFound,

    Error { reason: String },
}

impl PeerResponse {
    pub fn type_name(&self) -> &'static str {
        match self {
            PeerResponse::Registered { .. } => "Registered",
            PeerResponse::PeerList { .. } => "PeerList",
            PeerResponse::Pong { .. } => "Pong",
            PeerResponse::Ack => "Ack",
            PeerResponse::Transaction { .. } => "Transaction",
            PeerResponse::NotFound => "NotFound",
            PeerResponse::Error { .. } => "Error",
        }
    }
}

/// Multiplexing envelope used by the stream and RPC transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub id: u64,
    pub body: FrameBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FrameBody {
    Request(PeerRequest),
    Response(PeerResponse),
    Chunk(TransactionChunk),
    /// End of a chunk sequence
    End,
    /// A stream could not be served or was cut short
    Failed { reason: String },
}

impl Frame {
    pub fn new(id: u64, body: FrameBody) -> Self {
        Self { id, body }
    }

    /// Serialize frame to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize frame from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Hex encoding for binary fields in JSON
pub(crate) mod serde_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match bytes {
                Some(b) => serializer.serialize_some(&hex::encode(b)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s: Option<String> = Option::deserialize(deserializer)?;
            s.map(|s| hex::decode(s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
