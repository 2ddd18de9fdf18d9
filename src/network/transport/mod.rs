//! Peer transports
//!
//! Each transport carries the same [`PeerRequest`]/[`PeerResponse`] pair over
//! a different wire. The negotiator holds them as an ordered list of
//! capability-tagged implementations and walks the list until one works, so
//! adding a transport means adding one more implementation of [`Transport`].

pub mod http;
pub mod rpc;
pub mod stream;

use crate::network::message::{
    PeerAdvert, PeerRequest, PeerResponse, TransactionChunk, TransportFlags,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use http::HttpTransport;
pub use rpc::RpcTransport;
pub use stream::StreamTransport;

/// Chunks of a streamed transaction, in order
pub type ChunkStream = BoxStream<'static, Result<TransactionChunk, TransportError>>;

/// Transport errors. All of them count as a failed attempt for negotiation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Timed out")]
    Timeout,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Connection closed")]
    Closed,
    #[error("{0} not supported by this transport")]
    Unsupported(&'static str),
}

/// Transport kinds in preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum TransportKind {
    /// Persistent multiplexed WebSocket
    Stream,
    /// One framed TCP connection per call
    Rpc,
    /// REST over HTTP
    Http,
}

impl TransportKind {
    /// Default negotiation order
    pub const PRIORITY: [TransportKind; 3] =
        [TransportKind::Stream, TransportKind::Rpc, TransportKind::Http];

    /// Capability bit a peer must advertise for this transport
    pub fn flag(self) -> TransportFlags {
        match self {
            TransportKind::Stream => TransportFlags::STREAM,
            TransportKind::Rpc => TransportFlags::RPC,
            TransportKind::Http => TransportFlags::HTTP,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Stream => "stream",
            TransportKind::Rpc => "rpc",
            TransportKind::Http => "http",
        };
        f.write_str(name)
    }
}

/// One way of reaching a peer
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Single request/response exchange
    async fn call(
        &self,
        peer: &PeerAdvert,
        request: PeerRequest,
    ) -> Result<PeerResponse, TransportError>;

    /// Start a chunked transfer of `hash`
    async fn open_stream(&self, peer: &PeerAdvert, hash: &str)
        -> Result<ChunkStream, TransportError>;

    /// Close pooled connections unused for `idle`; returns how many closed
    async fn close_idle(&self, _idle: Duration) -> usize {
        0
    }

    /// Drop every pooled connection
    async fn shutdown(&self) {}
}

/// Build a response error for anything that is not the expected reply
pub(crate) fn unexpected(response: &PeerResponse) -> TransportError {
    TransportError::Protocol(format!("unexpected response {}", response.type_name()))
}
