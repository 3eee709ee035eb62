// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! StreamPacket framing and the raw content-streaming transport.
//!
//! ```text
//! +----------+-------------+-------------------+
//! | id u32BE | length i32BE| payload (length)  |
//! +----------+-------------+-------------------+
//! ```
//!
//! `length > 0` carries data, `length == 0` ends the content, and
//! `length < 0` reports error code `-length` with no payload. A request is a
//! single frame whose payload is the digest to read.

use crate::domain::content::{ContentError, ContentStore, ContentStream};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::debug;

pub const HEADER_LEN: usize = 8;
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// gRPC-style code carried by a not-found error frame.
pub const CODE_NOT_FOUND: u32 = 5;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {length} bytes exceeds the {max} byte limit")]
    FrameTooLarge { length: usize, max: usize },

    #[error("Unexpected stream id {actual}, expected {expected}")]
    UnexpectedId { expected: u32, actual: u32 },

    #[error("Remote reported error code {code}")]
    Remote { code: u32 },

    #[error("Connection closed before end of content")]
    UnexpectedEof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPacket {
    pub id: u32,
    pub length: i32,
    pub payload: Bytes,
}

impl StreamPacket {
    pub fn data(id: u32, payload: Bytes) -> Self {
        Self { id, length: payload.len() as i32, payload }
    }

    pub fn eof(id: u32) -> Self {
        Self { id, length: 0, payload: Bytes::new() }
    }

    pub fn error(id: u32, code: u32) -> Self {
        Self { id, length: -(code.min(i32::MAX as u32) as i32), payload: Bytes::new() }
    }

    pub fn is_eof(&self) -> bool {
        self.length == 0
    }

    pub fn error_code(&self) -> Option<u32> {
        (self.length < 0).then(|| self.length.unsigned_abs())
    }
}

#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = StreamPacket;
    type Error = PacketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let id = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let length = i32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        let payload_len = length.max(0) as usize;

        if payload_len > MAX_FRAME_LEN {
            return Err(PacketError::FrameTooLarge { length: payload_len, max: MAX_FRAME_LEN });
        }

        if src.len() < HEADER_LEN + payload_len {
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(StreamPacket { id, length, payload }))
    }
}

impl Encoder<StreamPacket> for PacketCodec {
    type Error = PacketError;

    fn encode(&mut self, item: StreamPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_FRAME_LEN {
            return Err(PacketError::FrameTooLarge { length: item.payload.len(), max: MAX_FRAME_LEN });
        }
        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u32(item.id);
        dst.put_i32(item.length);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// Content store speaking StreamPacket over a TCP connection per read.
pub struct PacketContentStore {
    address: String,
    next_id: AtomicU32,
}

impl PacketContentStore {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into(), next_id: AtomicU32::new(1) }
    }
}

#[async_trait]
impl ContentStore for PacketContentStore {
    async fn read(&self, digest: &str) -> Result<ContentStream, ContentError> {
        let io = TcpStream::connect(&self.address)
            .await
            .map_err(|e| ContentError::Transport(format!("connect {}: {}", self.address, e)))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(digest = %digest, address = %self.address, stream_id = id, "Reading content over packet stream");
        read_packets(io, id, digest).await
    }
}

/// Send the read request and stream the response frames for `id`.
pub async fn read_packets<T>(io: T, id: u32, digest: &str) -> Result<ContentStream, ContentError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(io, PacketCodec);
    framed
        .send(StreamPacket::data(id, Bytes::copy_from_slice(digest.as_bytes())))
        .await
        .map_err(|e| content_error(digest, e))?;

    // Read the first frame here so a missing blob fails the read itself.
    let first = match next_chunk(&mut framed, id, digest).await? {
        Some(chunk) => chunk,
        None => return Ok(futures::stream::empty().boxed()),
    };

    let digest = digest.to_string();
    let tail = futures::stream::try_unfold((framed, digest), move |(mut framed, digest)| async move {
        let chunk = next_chunk(&mut framed, id, &digest).await?;
        Ok::<_, ContentError>(chunk.map(|chunk| (chunk, (framed, digest))))
    });

    Ok(futures::stream::once(futures::future::ready(Ok(first))).chain(tail).boxed())
}

/// Next data frame for `id`; `None` at end of content.
async fn next_chunk<T>(
    framed: &mut Framed<T, PacketCodec>,
    id: u32,
    digest: &str,
) -> Result<Option<Bytes>, ContentError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let packet = match framed.next().await {
        Some(Ok(packet)) => packet,
        Some(Err(e)) => return Err(content_error(digest, e)),
        None => return Err(content_error(digest, PacketError::UnexpectedEof)),
    };

    if packet.id != id {
        return Err(content_error(digest, PacketError::UnexpectedId { expected: id, actual: packet.id }));
    }
    if let Some(code) = packet.error_code() {
        return Err(content_error(digest, PacketError::Remote { code }));
    }
    if packet.is_eof() {
        return Ok(None);
    }
    Ok(Some(packet.payload))
}

fn content_error(digest: &str, err: PacketError) -> ContentError {
    match err {
        PacketError::Remote { code: CODE_NOT_FOUND } => ContentError::NotFound(digest.to_string()),
        other => ContentError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_waits_for_complete_frame() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        codec.encode(StreamPacket::data(7, Bytes::from_static(b"hello")), &mut buf).unwrap();

        let mut partial = buf.split_to(10);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);

        let packet = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(packet.id, 7);
        assert_eq!(packet.payload, Bytes::from_static(b"hello"));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_negative_length_is_error_without_payload() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_i32(-5);
        buf.put_slice(b"next");

        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.error_code(), Some(5));
        assert!(packet.payload.is_empty());
        assert_eq!(&buf[..], b"next");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_i32((MAX_FRAME_LEN + 1) as i32);

        assert!(matches!(codec.decode(&mut buf), Err(PacketError::FrameTooLarge { .. })));
    }

    async fn serve(server: tokio::io::DuplexStream, responses: Vec<StreamPacket>) -> String {
        let mut framed = Framed::new(server, PacketCodec);
        let request = framed.next().await.unwrap().unwrap();
        for packet in responses {
            framed.send(packet).await.unwrap();
        }
        String::from_utf8(request.payload.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_read_streams_chunks_until_eof() {
        let (client, server) = tokio::io::duplex(64);
        let responder = tokio::spawn(serve(
            server,
            vec![
                StreamPacket::data(9, Bytes::from_static(b"abc")),
                StreamPacket::data(9, Bytes::from_static(b"def")),
                StreamPacket::eof(9),
            ],
        ));

        let stream = read_packets(client, 9, "sha256:1234").await.unwrap();
        let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;

        assert_eq!(chunks, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")]);
        assert_eq!(responder.await.unwrap(), "sha256:1234");
    }

    #[tokio::test]
    async fn test_error_after_first_chunk_ends_stream() {
        let (client, server) = tokio::io::duplex(64);
        tokio::spawn(serve(
            server,
            vec![StreamPacket::data(6, Bytes::from_static(b"abc")), StreamPacket::error(6, 13)],
        ));

        let mut stream = read_packets(client, 6, "sha256:cut").await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert!(matches!(stream.next().await.unwrap(), Err(ContentError::Transport(_))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_frame_maps_to_not_found() {
        let (client, server) = tokio::io::duplex(64);
        tokio::spawn(serve(server, vec![StreamPacket::error(4, CODE_NOT_FOUND)]));

        let err = read_packets(client, 4, "sha256:gone").await.err().unwrap();

        assert_eq!(err, ContentError::NotFound("sha256:gone".to_string()));
    }

    #[tokio::test]
    async fn test_mismatched_id_is_protocol_error() {
        let (client, server) = tokio::io::duplex(64);
        tokio::spawn(serve(server, vec![StreamPacket::data(2, Bytes::from_static(b"x"))]));

        let err = read_packets(client, 1, "sha256:aa").await.err().unwrap();

        assert!(matches!(err, ContentError::Transport(message) if message.contains("Unexpected stream id")));
    }
}
