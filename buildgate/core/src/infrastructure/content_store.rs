// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Content store backed by the builder's `containerd.services.content.v1.Content/Read`.

use crate::domain::connection::BuilderConnection;
use crate::domain::content::{ContentError, ContentStore, ContentStream};
use crate::infrastructure::grpc::messages::{ReadContentRequest, ReadContentResponse};
use crate::infrastructure::grpc::pump::MessageSource;
use crate::infrastructure::grpc::transport::{method_path, open_server_streaming, UpstreamReceiver};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use prost::Message;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Code, Status};
use tracing::debug;

const CONTENT_READ: &str = "/containerd.services.content.v1.Content/Read";
const CONTAINERD_NAMESPACE: &str = "buildkit";

pub struct GrpcContentStore {
    connection: BuilderConnection,
    cancel: CancellationToken,
}

impl GrpcContentStore {
    pub fn new(connection: BuilderConnection, cancel: CancellationToken) -> Self {
        Self { connection, cancel }
    }
}

#[async_trait]
impl ContentStore for GrpcContentStore {
    async fn read(&self, digest: &str) -> Result<ContentStream, ContentError> {
        let path = method_path(CONTENT_READ).map_err(|s| ContentError::Transport(s.message().to_string()))?;
        let request = ReadContentRequest {
            digest: digest.to_string(),
            offset: 0,
            size: 0,
        };

        let mut metadata = MetadataMap::new();
        metadata.insert("containerd-namespace", MetadataValue::from_static(CONTAINERD_NAMESPACE));

        debug!(digest = %digest, builder = %self.connection.builder_id, "Reading content");
        let mut receiver = open_server_streaming(
            &self.connection,
            path,
            metadata,
            Bytes::from(request.encode_to_vec()),
            self.cancel.child_token(),
        );

        // Pull the first chunk here so a missing blob fails the read itself.
        let first = receiver.recv().await.map_err(|status| content_error(digest, status))?;
        let head = match first {
            Some(raw) => vec![decode_chunk(raw)],
            None => return Ok(futures::stream::empty().boxed()),
        };

        let digest = digest.to_string();
        let tail = futures::stream::try_unfold(
            (receiver, digest),
            |(mut receiver, digest): (UpstreamReceiver, String)| async move {
                match receiver.recv().await {
                    Ok(Some(raw)) => Ok(Some((decode_chunk(raw)?, (receiver, digest)))),
                    Ok(None) => Ok(None),
                    Err(status) => Err(content_error(&digest, status)),
                }
            },
        );
        let stream = futures::stream::iter(head).chain(tail);

        Ok(stream.boxed())
    }
}

fn decode_chunk(raw: Bytes) -> Result<Bytes, ContentError> {
    ReadContentResponse::decode(raw)
        .map(|chunk| chunk.data)
        .map_err(|e| ContentError::Transport(format!("malformed content chunk: {}", e)))
}

fn content_error(digest: &str, status: Status) -> ContentError {
    match status.code() {
        Code::NotFound => ContentError::NotFound(digest.to_string()),
        _ => ContentError::Transport(format!("{:?}: {}", status.code(), status.message())),
    }
}
