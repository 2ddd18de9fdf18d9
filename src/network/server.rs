//! TCP server and frame codec for the RPC transport
//!
//! Accepts inbound connections on the RPC port and answers framed requests.
//! A connection may carry several requests in sequence; streamed transfers
//! are answered with chunk frames followed by an end marker.

use crate::network::message::{Frame, FrameBody, PeerRequest, MAGIC, MAX_FRAME_SIZE};
use crate::network::service::PeerService;
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;

/// Frame codec: magic (4) + big-endian length (4) + JSON body
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        if data.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", data.len()),
            ));
        }

        dst.reserve(8 + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < 8 {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid magic bytes",
            ));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }

        if src.len() < 8 + len {
            src.reserve(8 + len - src.len());
            return Ok(None);
        }

        src.advance(8);
        let data = src.split_to(len);

        let frame = Frame::from_bytes(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        Ok(Some(frame))
    }
}

/// TCP server for the RPC transport
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind the listener
    pub async fn bind(addr: SocketAddr) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("RPC server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until shutdown
    pub async fn run(self, service: Arc<PeerService>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let service = Arc::clone(&service);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            let served = handle_connection(stream, addr, service, shutdown).await;
                            if let Err(e) = served {
                                log::debug!("RPC connection {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => log::warn!("RPC accept failed: {}", e),
                },
            }
        }

        log::info!("RPC server on {} stopped", self.local_addr);
    }
}

/// Serve framed requests on one inbound connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    service: Arc<PeerService>,
    shutdown: CancellationToken,
) -> Result<(), io::Error> {
    let mut framed = Framed::new(stream, FrameCodec);

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = framed.next() => frame,
        };

        match frame {
            Some(Ok(Frame {
                id,
                body: FrameBody::Request(request),
            })) => {
                log::debug!("RPC {} from {}", request.type_name(), addr);
                respond(&mut framed, id, request, &service).await?;
            }
            Some(Ok(frame)) => {
                framed
                    .send(Frame::new(
                        frame.id,
                        FrameBody::Failed {
                            reason: "expected a request frame".to_string(),
                        },
                    ))
                    .await?;
                break;
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }

    Ok(())
}

async fn respond(
    framed: &mut Framed<TcpStream, FrameCodec>,
    id: u64,
    request: PeerRequest,
    service: &PeerService,
) -> Result<(), io::Error> {
    match request {
        PeerRequest::StreamTransaction { hash } => match service.open_chunks(&hash).await {
            Ok(chunks) => {
                for chunk in chunks {
                    framed.send(Frame::new(id, FrameBody::Chunk(chunk))).await?;
                }
                framed.send(Frame::new(id, FrameBody::End)).await
            }
            Err(reason) => framed.send(Frame::new(id, FrameBody::Failed { reason })).await,
        },
        request => {
            let response = service.handle(request).await;
            framed.send(Frame::new(id, FrameBody::Response(response))).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::PeerResponse;

    #[test]
    fn test_frame_codec() {
        let mut codec = FrameCodec;
        let frame = Frame::new(3, FrameBody::Response(PeerResponse::Ack));

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(1, FrameBody::End), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(buf.len() - 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&b"XXXX\0\0\0\x02{}"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }
}
