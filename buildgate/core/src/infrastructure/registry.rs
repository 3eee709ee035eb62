// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Content Registry
//!
//! A minimal Docker/OCI Distribution v2 server for exactly one pinned image.
//! Manifests and configs are served from memory (read and verified when the
//! image is pinned); layer blobs are streamed from the builder's content store
//! on demand. Each instance serves one image and is shut down after one use.

use crate::domain::content::{ContentError, ContentStore, ImageIdentity, PinnedImage};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
const API_VERSION_HEADER: &str = "docker-distribution-api-version";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid repository name or path: {0}")]
    NameInvalid(String),

    #[error("repository name not known to registry: {0}")]
    NameUnknown(String),

    #[error("blob unknown to registry: {0}")]
    BlobUnknown(String),

    #[error("method {0} not supported")]
    MethodUnknown(Method),

    #[error("content store read failed: {0}")]
    Upstream(String),

    #[error("Failed to bind content registry: {0}")]
    Bind(#[from] std::io::Error),
}

impl RegistryError {
    fn code(&self) -> &'static str {
        match self {
            RegistryError::NameInvalid(_) => "NAME_INVALID",
            RegistryError::NameUnknown(_) => "NAME_UNKNOWN",
            RegistryError::BlobUnknown(_) => "BLOB_UNKNOWN",
            RegistryError::MethodUnknown(_) => "METHOD_UNKNOWN",
            RegistryError::Upstream(_) | RegistryError::Bind(_) => "UNKNOWN",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            RegistryError::NameInvalid(_) | RegistryError::NameUnknown(_) | RegistryError::BlobUnknown(_) => {
                StatusCode::NOT_FOUND
            }
            RegistryError::MethodUnknown(_) => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::Upstream(_) => StatusCode::BAD_GATEWAY,
            RegistryError::Bind(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let body = json!({
            "errors": [{
                "code": self.code(),
                "message": self.to_string(),
            }]
        });
        (self.status(), Json(body)).into_response()
    }
}

struct RegistryState {
    identity: ImageIdentity,
    image: PinnedImage,
    store: Arc<dyn ContentStore>,
}

/// Registry serving one pinned image.
#[derive(Clone)]
pub struct ContentRegistry {
    state: Arc<RegistryState>,
}

impl ContentRegistry {
    pub fn new(identity: ImageIdentity, image: PinnedImage, store: Arc<dyn ContentStore>) -> Self {
        Self {
            state: Arc::new(RegistryState { identity, image, store }),
        }
    }

    pub fn identity(&self) -> &ImageIdentity {
        &self.state.identity
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v2", any(api_root))
            .route("/v2/", any(api_root))
            .route("/v2/{*path}", any(dispatch))
            .with_state(self.state.clone())
    }

    /// Bind `bind` (port 0 picks a free port) and serve until the handle is shut down.
    pub async fn serve(self, bind: SocketAddr, cancel: CancellationToken) -> Result<RegistryHandle, RegistryError> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let router = self.router();

        info!(
            address = %addr,
            image = %self.state.identity.name,
            "Content registry listening"
        );

        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });

        Ok(RegistryHandle { addr, cancel, task })
    }
}

/// A running registry. Dropping the handle does not stop the server.
pub struct RegistryHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl RegistryHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        match self.task.await {
            Ok(Ok(())) => debug!(address = %self.addr, "Content registry stopped"),
            Ok(Err(e)) => warn!(address = %self.addr, error = %e, "Content registry exited with error"),
            Err(e) => warn!(address = %self.addr, error = %e, "Content registry task failed"),
        }
    }
}

async fn api_root(method: Method) -> Result<Response, RegistryError> {
    read_only(&method)?;
    let mut response = StatusCode::OK.into_response();
    response
        .headers_mut()
        .insert(API_VERSION_HEADER, HeaderValue::from_static("registry/2.0"));
    Ok(response)
}

enum Target<'a> {
    Manifest { name: &'a str },
    Blob { name: &'a str, digest: &'a str },
}

fn parse_target(path: &str) -> Option<Target<'_>> {
    if let Some((name, _reference)) = path.rsplit_once("/manifests/") {
        return Some(Target::Manifest { name });
    }
    if let Some((name, digest)) = path.rsplit_once("/blobs/") {
        if !digest.is_empty() && !digest.contains('/') {
            return Some(Target::Blob { name, digest });
        }
    }
    None
}

fn read_only(method: &Method) -> Result<(), RegistryError> {
    if method == Method::GET || method == Method::HEAD {
        Ok(())
    } else {
        Err(RegistryError::MethodUnknown(method.clone()))
    }
}

async fn dispatch(
    State(state): State<Arc<RegistryState>>,
    method: Method,
    Path(path): Path<String>,
) -> Result<Response, RegistryError> {
    let target = parse_target(&path).ok_or_else(|| RegistryError::NameInvalid(path.clone()))?;
    read_only(&method)?;

    match target {
        Target::Manifest { name } => {
            check_name(&state, name)?;
            debug!(method = %method, path = %path, "Serving pinned manifest");
            let image = &state.image;
            Ok(blob_response(
                &method,
                image.media_type(),
                &image.manifest_descriptor.digest,
                image.manifest_bytes.len() as u64,
                Body::from(image.manifest_bytes.clone()),
            ))
        }
        Target::Blob { name, digest } => {
            check_name(&state, name)?;
            serve_blob(&state, &method, digest).await
        }
    }
}

fn check_name(state: &RegistryState, name: &str) -> Result<(), RegistryError> {
    if name == state.identity.name {
        Ok(())
    } else {
        Err(RegistryError::NameUnknown(name.to_string()))
    }
}

async fn serve_blob(state: &RegistryState, method: &Method, digest: &str) -> Result<Response, RegistryError> {
    let image = &state.image;

    if digest == image.manifest_descriptor.digest {
        return Ok(blob_response(
            method,
            image.media_type(),
            digest,
            image.manifest_bytes.len() as u64,
            Body::from(image.manifest_bytes.clone()),
        ));
    }

    let descriptor = image
        .blob(digest)
        .ok_or_else(|| RegistryError::BlobUnknown(digest.to_string()))?;

    if method == Method::HEAD {
        return Ok(blob_response(method, &descriptor.media_type, digest, descriptor.size, Body::empty()));
    }

    if digest == image.manifest.config.digest {
        return Ok(blob_response(
            method,
            &descriptor.media_type,
            digest,
            descriptor.size,
            Body::from(image.config_bytes.clone()),
        ));
    }

    debug!(digest = %digest, size = descriptor.size, "Streaming layer from content store");
    let stream = state
        .store
        .read(digest)
        .await
        .map_err(|e| match e {
            ContentError::NotFound(_) => RegistryError::BlobUnknown(digest.to_string()),
            other => RegistryError::Upstream(other.to_string()),
        })?;

    Ok(blob_response(
        method,
        &descriptor.media_type,
        digest,
        descriptor.size,
        Body::from_stream(stream),
    ))
}

fn blob_response(method: &Method, media_type: &str, digest: &str, size: u64, body: Body) -> Response {
    let body = if method == Method::HEAD { Body::empty() } else { body };
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(media_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(digest) {
        headers.insert(DOCKER_CONTENT_DIGEST, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert!(matches!(
            parse_target("buildgate/load-abc/manifests/latest"),
            Some(Target::Manifest { name: "buildgate/load-abc" })
        ));
        assert!(matches!(
            parse_target("buildgate/load-abc/blobs/sha256:00"),
            Some(Target::Blob { name: "buildgate/load-abc", digest: "sha256:00" })
        ));
        assert!(parse_target("buildgate/load-abc/tags/list").is_none());
        assert!(parse_target("buildgate/load-abc/blobs/uploads/").is_none());
    }
}
