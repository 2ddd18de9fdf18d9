//! REST fallback transport
//!
//! Maps each peer operation onto a plain HTTP route served under `/p2p`.
//! Streamed transfers come back as newline-delimited JSON chunks.

use super::{ChunkStream, Transport, TransportError, TransportKind};
use crate::network::message::{
    PeerAdvert, PeerRequest, PeerResponse, TransactionChunk, TransactionNotification,
};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Body of `POST /p2p/notify`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyBody {
    pub sender: String,
    pub notification: TransactionNotification,
}

/// Query of `GET /p2p/peers`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerListQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(max_per_peer: usize, idle_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(max_per_peer)
            .pool_idle_timeout(idle_timeout)
            .build()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self { client })
    }

    fn request(&self, peer: &PeerAdvert, request: PeerRequest) -> reqwest::RequestBuilder {
        let base = peer.http_base();
        match request {
            PeerRequest::RegisterPeer { advert } => self
                .client
                .post(format!("{}/p2p/register", base))
                .json(&advert),
            PeerRequest::GetPeerList { cursor, limit } => self
                .client
                .get(format!("{}/p2p/peers", base))
                .query(&PeerListQuery {
                    cursor,
                    limit: Some(limit),
                }),
            PeerRequest::Ping => self.client.get(format!("{}/p2p/ping", base)),
            PeerRequest::NotifyTransaction {
                sender,
                notification,
            } => self
                .client
                .post(format!("{}/p2p/notify", base))
                .json(&NotifyBody {
                    sender,
                    notification,
                }),
            PeerRequest::GetTransaction { hash } => self
                .client
                .get(format!("{}/p2p/transactions/{}", base, hash)),
            PeerRequest::StreamTransaction { hash } => self
                .client
                .get(format!("{}/p2p/transactions/{}/stream", base, hash)),
        }
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::ConnectionFailed(e.to_string())
    } else if e.is_decode() {
        TransportError::Protocol(e.to_string())
    } else {
        TransportError::ConnectionFailed(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn call(
        &self,
        peer: &PeerAdvert,
        request: PeerRequest,
    ) -> Result<PeerResponse, TransportError> {
        if matches!(request, PeerRequest::StreamTransaction { .. }) {
            return Err(TransportError::Unsupported("StreamTransaction as a call"));
        }

        // Every route answers with a serialized PeerResponse, error statuses included
        let response = self.request(peer, request).send().await.map_err(map_reqwest)?;
        let status = response.status();
        let body = response.bytes().await.map_err(map_reqwest)?;

        serde_json::from_slice(&body).map_err(|e| {
            TransportError::Protocol(format!("HTTP {} with unreadable body: {}", status, e))
        })
    }

    async fn open_stream(
        &self,
        peer: &PeerAdvert,
        hash: &str,
    ) -> Result<ChunkStream, TransportError> {
        let response = self
            .request(
                peer,
                PeerRequest::StreamTransaction {
                    hash: hash.to_string(),
                },
            )
            .send()
            .await
            .map_err(map_reqwest)?;

        if !response.status().is_success() {
            let status = response.status();
            let reason = match response.json::<PeerResponse>().await {
                Ok(PeerResponse::Error { reason }) => reason,
                Ok(other) => other.type_name().to_string(),
                Err(_) => status.to_string(),
            };
            return Err(TransportError::Protocol(reason));
        }

        Ok(ndjson_chunks(response.bytes_stream().boxed()))
    }
}

/// Split a byte stream into newline-delimited chunk records
fn ndjson_chunks(
    body: futures::stream::BoxStream<'static, Result<bytes::Bytes, reqwest::Error>>,
) -> ChunkStream {
    let state = (body, BytesMut::new(), false);

    futures::stream::unfold(state, |(mut body, mut buf, mut done)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line = buf.split_to(pos);
                buf.advance(1);
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let item = serde_json::from_slice::<TransactionChunk>(&line)
                    .map_err(TransportError::Serialization);
                return Some((item, (body, buf, done)));
            }

            if done {
                if buf.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                let line = buf.split();
                let item = serde_json::from_slice::<TransactionChunk>(&line)
                    .map_err(TransportError::Serialization);
                return Some((item, (body, buf, done)));
            }

            match body.next().await {
                Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    done = true;
                    buf.clear();
                    return Some((Err(map_reqwest(e)), (body, buf, done)));
                }
                None => done = true,
            }
        }
    })
    .boxed()
}
