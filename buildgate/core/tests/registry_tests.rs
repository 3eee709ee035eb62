// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the content registry HTTP surface.
//!
//! The router is driven in-process with `tower::ServiceExt::oneshot`; layers
//! are streamed from an in-memory content store.

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use buildgate_core::domain::content::{
    sha256_digest, ContentDescriptor, ContentError, ContentStore, ContentStream, ImageIdentity, OciManifest,
    PinnedImage, MEDIA_TYPE_OCI_MANIFEST,
};
use buildgate_core::infrastructure::registry::ContentRegistry;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

#[derive(Default, Clone)]
struct InMemoryStore {
    blobs: HashMap<String, Bytes>,
}

impl InMemoryStore {
    fn put(&mut self, data: Bytes) -> String {
        let digest = sha256_digest(&data);
        self.blobs.insert(digest.clone(), data);
        digest
    }
}

#[async_trait]
impl ContentStore for InMemoryStore {
    async fn read(&self, digest: &str) -> Result<ContentStream, ContentError> {
        let data = self
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| ContentError::NotFound(digest.to_string()))?;
        // Two chunks, to exercise streaming.
        let mid = data.len() / 2;
        let chunks = vec![Ok(data.slice(..mid)), Ok(data.slice(mid..))];
        Ok(futures::stream::iter(chunks).boxed())
    }
}

struct Fixture {
    registry: ContentRegistry,
    manifest_digest: String,
    config_digest: String,
    layer_digest: String,
    layer: Bytes,
}

async fn fixture() -> Fixture {
    fixture_serving(true).await
}

/// With `layers_present` unset the registry's store lacks the layer blob the
/// pinned manifest lists.
async fn fixture_serving(layers_present: bool) -> Fixture {
    let mut store = InMemoryStore::default();
    let config = Bytes::from_static(br#"{"architecture":"arm64","os":"linux"}"#);
    let layer = Bytes::from((0..4096u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
    let config_digest = store.put(config.clone());
    let layer_digest = store.put(layer.clone());

    let manifest = OciManifest {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
        config: ContentDescriptor::new(
            "application/vnd.oci.image.config.v1+json",
            config_digest.clone(),
            config.len() as u64,
        ),
        layers: vec![ContentDescriptor::new(
            "application/vnd.oci.image.layer.v1.tar+gzip",
            layer_digest.clone(),
            layer.len() as u64,
        )],
        annotations: None,
    };
    let manifest_bytes = Bytes::from(serde_json::to_vec(&manifest).unwrap());
    let manifest_digest = store.put(manifest_bytes.clone());
    let descriptor = ContentDescriptor::new(MEDIA_TYPE_OCI_MANIFEST, manifest_digest.clone(), manifest_bytes.len() as u64);

    let image = PinnedImage::fetch(&store, &descriptor).await.unwrap();
    let mut serving = store.clone();
    if !layers_present {
        serving.blobs.remove(&layer_digest);
    }
    let store: Arc<dyn ContentStore> = Arc::new(serving);
    let identity = ImageIdentity { name: "buildgate/load-test".to_string(), tag: "abc".to_string() };

    Fixture {
        registry: ContentRegistry::new(identity, image, store),
        manifest_digest,
        config_digest,
        layer_digest,
        layer,
    }
}

fn request(method: Method, uri: String) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

async fn error_code(response: axum::response::Response) -> String {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    json["errors"][0]["code"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_api_root_answers_ok() {
    let f = fixture().await;
    for uri in ["/v2", "/v2/"] {
        let response = f.registry.router().oneshot(request(Method::GET, uri.to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn test_manifest_is_served_regardless_of_reference() {
    let f = fixture().await;

    for reference in ["abc", "latest", "sha256:whatever"] {
        let response = f
            .registry
            .router()
            .oneshot(request(Method::GET, format!("/v2/buildgate/load-test/manifests/{}", reference)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["docker-content-digest"], f.manifest_digest.as_str());
        assert_eq!(response.headers()["content-type"], MEDIA_TYPE_OCI_MANIFEST);
    }
}

#[tokio::test]
async fn test_head_blob_reports_length_without_body() {
    let f = fixture().await;

    let response = f
        .registry
        .router()
        .oneshot(request(Method::HEAD, format!("/v2/buildgate/load-test/blobs/{}", f.layer_digest)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "4096");
    assert_eq!(response.headers()["docker-content-digest"], f.layer_digest.as_str());
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_get_blob_streams_layer_and_config() {
    let f = fixture().await;

    let response = f
        .registry
        .router()
        .oneshot(request(Method::GET, format!("/v2/buildgate/load-test/blobs/{}", f.layer_digest)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, f.layer);

    let response = f
        .registry
        .router()
        .oneshot(request(Method::GET, format!("/v2/buildgate/load-test/blobs/{}", f.config_digest)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(sha256_digest(&body), f.config_digest);
}

#[tokio::test]
async fn test_unknown_blob_is_blob_unknown() {
    let f = fixture().await;

    let response = f
        .registry
        .router()
        .oneshot(request(Method::HEAD, "/v2/buildgate/load-test/blobs/sha256:0000".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = f
        .registry
        .router()
        .oneshot(request(Method::GET, "/v2/buildgate/load-test/blobs/sha256:0000".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UNKNOWN");
}

#[tokio::test]
async fn test_invalid_paths_and_methods() {
    let f = fixture().await;

    let response = f
        .registry
        .router()
        .oneshot(request(Method::GET, "/v2/buildgate/load-test/tags/list".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "NAME_INVALID");

    let response = f
        .registry
        .router()
        .oneshot(request(Method::PUT, "/v2/buildgate/load-test/manifests/abc".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(error_code(response).await, "METHOD_UNKNOWN");

    let response = f
        .registry
        .router()
        .oneshot(request(Method::GET, "/v2/someone/else/manifests/abc".to_string()))
        .await
        .unwrap();
    assert_eq!(error_code(response).await, "NAME_UNKNOWN");
}

#[tokio::test]
async fn test_layer_missing_from_store_is_blob_unknown() {
    let f = fixture_serving(false).await;

    let response = f
        .registry
        .router()
        .oneshot(request(Method::GET, format!("/v2/buildgate/load-test/blobs/{}", f.layer_digest)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UNKNOWN");
}
