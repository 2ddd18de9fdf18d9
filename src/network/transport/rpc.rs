//! Single-call RPC over framed TCP
//!
//! Opens a fresh connection to the peer's RPC port for every call and closes
//! it after the reply, so no state is kept between calls.

use super::{unexpected, ChunkStream, Transport, TransportError, TransportKind};
use crate::network::message::{Frame, FrameBody, PeerAdvert, PeerRequest, PeerResponse};
use crate::network::server::FrameCodec;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Id used for the only request on an RPC connection
const CALL_ID: u64 = 1;

#[derive(Debug, Default)]
pub struct RpcTransport;

impl RpcTransport {
    pub fn new() -> Self {
        Self
    }

    async fn connect(
        &self,
        peer: &PeerAdvert,
        request: PeerRequest,
    ) -> Result<Framed<TcpStream, FrameCodec>, TransportError> {
        let stream = TcpStream::connect(peer.rpc_endpoint())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        stream.set_nodelay(true)?;

        let mut framed = Framed::new(stream, FrameCodec);
        framed
            .send(Frame::new(CALL_ID, FrameBody::Request(request)))
            .await?;
        Ok(framed)
    }
}

#[async_trait]
impl Transport for RpcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Rpc
    }

    async fn call(
        &self,
        peer: &PeerAdvert,
        request: PeerRequest,
    ) -> Result<PeerResponse, TransportError> {
        if matches!(request, PeerRequest::StreamTransaction { .. }) {
            return Err(TransportError::Unsupported("StreamTransaction as a call"));
        }

        let mut framed = self.connect(peer, request).await?;

        match framed.next().await {
            Some(Ok(Frame {
                body: FrameBody::Response(response),
                ..
            })) => Ok(response),
            Some(Ok(Frame {
                body: FrameBody::Failed { reason },
                ..
            })) => Err(TransportError::Protocol(reason)),
            Some(Ok(_)) => Err(TransportError::Protocol("expected a response frame".to_string())),
            Some(Err(e)) => Err(TransportError::Io(e)),
            None => Err(TransportError::Closed),
        }
    }

    async fn open_stream(
        &self,
        peer: &PeerAdvert,
        hash: &str,
    ) -> Result<ChunkStream, TransportError> {
        let framed = self
            .connect(
                peer,
                PeerRequest::StreamTransaction {
                    hash: hash.to_string(),
                },
            )
            .await?;

        // Ends after `End`, `Failed` or the first error
        let chunks = futures::stream::unfold(Some(framed), |state| async move {
            let mut framed = state?;
            let item = match framed.next().await {
                Some(Ok(Frame {
                    body: FrameBody::Chunk(chunk),
                    ..
                })) => return Some((Ok(chunk), Some(framed))),
                Some(Ok(Frame {
                    body: FrameBody::End,
                    ..
                })) => return None,
                Some(Ok(Frame {
                    body: FrameBody::Failed { reason },
                    ..
                })) => Err(TransportError::Protocol(reason)),
                Some(Ok(Frame {
                    body: FrameBody::Response(response),
                    ..
                })) => Err(unexpected(&response)),
                Some(Ok(_)) => Err(TransportError::Protocol("unexpected frame".to_string())),
                Some(Err(e)) => Err(TransportError::Io(e)),
                None => Err(TransportError::Closed),
            };
            Some((item, None))
        });

        Ok(chunks.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{Capabilities, TransactionChunk};
    use tokio::net::TcpListener;

    async fn fake_peer() -> (PeerAdvert, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let advert = PeerAdvert {
            id: "remote".to_string(),
            address: "127.0.0.1".to_string(),
            port,
            http_port: port,
            capabilities: Capabilities::current(),
        };
        (advert, listener)
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (advert, listener) = fake_peer().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec);
            let frame = framed.next().await.unwrap().unwrap();
            assert_eq!(frame.body, FrameBody::Request(PeerRequest::Ping));
            framed
                .send(Frame::new(
                    frame.id,
                    FrameBody::Response(PeerResponse::Pong {
                        peer_id: "remote".to_string(),
                        timestamp_ms: 1,
                    }),
                ))
                .await
                .unwrap();
        });

        let response = RpcTransport::new().call(&advert, PeerRequest::Ping).await.unwrap();
        assert!(matches!(response, PeerResponse::Pong { .. }));
    }

    #[tokio::test]
    async fn test_stream_collects_chunks() {
        let (advert, listener) = fake_peer().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec);
            let frame = framed.next().await.unwrap().unwrap();
            for index in 0..2 {
                let chunk = TransactionChunk {
                    index,
                    total: 2,
                    data: vec![index as u8; 4],
                };
                framed
                    .send(Frame::new(frame.id, FrameBody::Chunk(chunk)))
                    .await
                    .unwrap();
            }
            framed.send(Frame::new(frame.id, FrameBody::End)).await.unwrap();
        });

        let stream = RpcTransport::new().open_stream(&advert, "abc").await.unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].as_ref().unwrap().data, vec![1, 1, 1, 1]);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let (advert, listener) = fake_peer().await;
        drop(listener);

        let result = RpcTransport::new().call(&advert, PeerRequest::Ping).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
