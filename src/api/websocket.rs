//! WebSocket server for the stream transport
//!
//! Peers keep one socket open and multiplex requests over it by frame id.
//! Each request is answered on its own task so a long chunk stream does not
//! hold up pings and notifications behind it. Responses share a small
//! bounded queue to the writer, so a stream produces chunks only as fast
//! as the socket takes them.

use crate::api::handlers::ApiState;
use crate::network::message::{Frame, FrameBody, PeerRequest};
use crate::network::service::PeerService;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Frames waiting for the socket writer
const OUTBOUND_FRAMES: usize = 8;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    let service = Arc::clone(&state.service);
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, service, shutdown))
}

/// Serve one peer connection
async fn handle_socket(socket: WebSocket, service: Arc<PeerService>, shutdown: CancellationToken) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound, mut rx) = mpsc::channel::<Frame>(OUTBOUND_FRAMES);

    // Writer: every response task feeds this one sink
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    log::warn!("Failed to encode frame {}: {}", frame.id, e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            let frame = match msg {
                Ok(Message::Text(text)) => Frame::from_bytes(text.as_bytes()),
                Ok(Message::Binary(data)) => Frame::from_bytes(&data),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    log::debug!("WebSocket error: {}", e);
                    break;
                }
            };

            match frame {
                Ok(Frame {
                    id,
                    body: FrameBody::Request(request),
                }) => {
                    log::debug!("WS {} (frame {})", request.type_name(), id);
                    tokio::spawn(respond(
                        Arc::clone(&service),
                        outbound.clone(),
                        id,
                        request,
                    ));
                }
                Ok(frame) => {
                    let failed = Frame::new(
                        frame.id,
                        FrameBody::Failed {
                            reason: "expected a request frame".to_string(),
                        },
                    );
                    if outbound.send(failed).await.is_err() {
                        break;
                    }
                }
                Err(e) => log::debug!("Dropping malformed WebSocket frame: {}", e),
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            // Let in-flight responses finish; the writer ends with the last sender
            let _ = (&mut send_task).await;
        }
        _ = shutdown.cancelled() => {
            recv_task.abort();
            send_task.abort();
        }
    }

    log::debug!("WebSocket connection closed");
}

/// Answer one request on the shared writer
async fn respond(
    service: Arc<PeerService>,
    outbound: mpsc::Sender<Frame>,
    id: u64,
    request: PeerRequest,
) {
    match request {
        PeerRequest::StreamTransaction { hash } => match service.open_chunks(&hash).await {
            Ok(chunks) => {
                for chunk in chunks {
                    if outbound.send(Frame::new(id, FrameBody::Chunk(chunk))).await.is_err() {
                        return;
                    }
                }
                let _ = outbound.send(Frame::new(id, FrameBody::End)).await;
            }
            Err(reason) => {
                let _ = outbound.send(Frame::new(id, FrameBody::Failed { reason })).await;
            }
        },
        request => {
            let response = service.handle(request).await;
            let _ = outbound.send(Frame::new(id, FrameBody::Response(response))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::create_router;
    use crate::network::message::{Capabilities, PeerAdvert, PeerResponse};
    use crate::network::transport::{StreamTransport, Transport};
    use crate::testing::{api_state, gossip_fixture, MockTransport};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_respond_streams_chunks_then_end() {
        let fixture = gossip_fixture(MockTransport::unreachable(), 1).await;
        let hash = fixture.gossip.cache_payload(vec![5u8; 600 * 1024]).await;
        let service = Arc::new(fixture.service());

        let (tx, mut rx) = mpsc::channel(16);
        respond(service, tx, 9, PeerRequest::StreamTransaction { hash }).await;

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            assert_eq!(frame.id, 9);
            frames.push(frame.body);
        }
        assert_eq!(frames.len(), 4);
        assert!(matches!(frames[0], FrameBody::Chunk(ref c) if c.total == 3));
        assert_eq!(frames[3], FrameBody::End);
    }

    #[tokio::test]
    async fn test_respond_unknown_stream_fails() {
        let fixture = gossip_fixture(MockTransport::unreachable(), 1).await;
        let service = Arc::new(fixture.service());

        let (tx, mut rx) = mpsc::channel(16);
        respond(
            Arc::clone(&service),
            tx.clone(),
            1,
            PeerRequest::StreamTransaction {
                hash: "00".repeat(32),
            },
        )
        .await;
        respond(service, tx, 2, PeerRequest::Ping).await;

        assert!(matches!(rx.recv().await.unwrap().body, FrameBody::Failed { .. }));
        let pong = rx.recv().await.unwrap();
        assert_eq!(pong.id, 2);
        assert!(matches!(
            pong.body,
            FrameBody::Response(PeerResponse::Pong { .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_waits_for_writer_capacity() {
        let fixture = gossip_fixture(MockTransport::unreachable(), 1).await;
        let hash = fixture.gossip.cache_payload(vec![6u8; 4 * 1024 * 1024]).await;
        let service = Arc::new(fixture.service());

        let (tx, mut rx) = mpsc::channel(OUTBOUND_FRAMES);
        let request = PeerRequest::StreamTransaction { hash };
        let producer = tokio::spawn(respond(service, tx, 3, request));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        assert_eq!(rx.len(), OUTBOUND_FRAMES);

        let mut frames = 0;
        while rx.recv().await.is_some() {
            frames += 1;
        }
        assert_eq!(frames, 16 + 1);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_answered_during_large_stream() {
        let fixture = gossip_fixture(MockTransport::unreachable(), 1).await;
        let hash = fixture.gossip.cache_payload(vec![7u8; 16 * 1024 * 1024]).await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let router = create_router(api_state(&fixture));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let peer = PeerAdvert {
            id: "local".to_string(),
            address: "127.0.0.1".to_string(),
            port: 1,
            http_port: port,
            capabilities: Capabilities::current(),
        };

        // One socket carries both the stream and the ping
        let transport = Arc::new(StreamTransport::new(1));
        let mut chunks = transport.open_stream(&peer, &hash).await.unwrap();
        let consumed = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&consumed);
        let reader = tokio::spawn(async move {
            while let Some(chunk) = chunks.next().await {
                chunk.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        while consumed.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let response = transport.call(&peer, PeerRequest::Ping).await.unwrap();
        assert!(matches!(response, PeerResponse::Pong { .. }));
        assert!(consumed.load(Ordering::SeqCst) < 64);
        assert_eq!(transport.connection_count("local").await, 1);

        reader.await.unwrap();
        assert_eq!(consumed.load(Ordering::SeqCst), 64);
    }
}
