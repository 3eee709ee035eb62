// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Content-addressed image data.
//!
//! Descriptors, the image manifest schema, and the [`ContentStore`] contract
//! used to read manifests, configs and layer blobs out of a builder's content
//! store by digest.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Digest, size and media type of one blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<DescriptorPlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorPlatform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl ContentDescriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            platform: None,
            annotations: None,
        }
    }
}

/// Image manifest (OCI or Docker v2 schema 2; the fields used here are identical).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: ContentDescriptor,
    #[serde(default)]
    pub layers: Vec<ContentDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl OciManifest {
    /// Linear scan of the layer list for a digest.
    pub fn find_layer(&self, digest: &str) -> Option<&ContentDescriptor> {
        self.layers.iter().find(|layer| layer.digest == digest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("Content {0} not found")]
    NotFound(String),
    #[error("Content {digest} failed verification: expected {expected}, got {actual}")]
    DigestMismatch {
        digest: String,
        expected: String,
        actual: String,
    },
    #[error("Invalid manifest {digest}: {reason}")]
    InvalidManifest { digest: String, reason: String },
    #[error("Content transport error: {0}")]
    Transport(String),
}

pub type ContentStream = BoxStream<'static, Result<Bytes, ContentError>>;

/// Digest-addressed read access to a builder's content store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Stream the blob's bytes in order.
    async fn read(&self, digest: &str) -> Result<ContentStream, ContentError>;
}

pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Read a whole blob and check it against its descriptor.
pub async fn read_verified(
    store: &dyn ContentStore,
    descriptor: &ContentDescriptor,
) -> Result<Bytes, ContentError> {
    let mut stream = store.read(&descriptor.digest).await?;
    let mut buf = BytesMut::with_capacity(descriptor.size as usize);
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    let data = buf.freeze();

    if data.len() as u64 != descriptor.size {
        return Err(ContentError::DigestMismatch {
            digest: descriptor.digest.clone(),
            expected: format!("{} bytes", descriptor.size),
            actual: format!("{} bytes", data.len()),
        });
    }

    if descriptor.digest.starts_with("sha256:") {
        let actual = sha256_digest(&data);
        if actual != descriptor.digest {
            return Err(ContentError::DigestMismatch {
                digest: descriptor.digest.clone(),
                expected: descriptor.digest.clone(),
                actual,
            });
        }
    }

    Ok(data)
}

/// The single image a content registry instance serves.
#[derive(Debug, Clone)]
pub struct PinnedImage {
    pub manifest_descriptor: ContentDescriptor,
    pub manifest_bytes: Bytes,
    pub manifest: OciManifest,
    pub config_bytes: Bytes,
}

impl PinnedImage {
    /// Read and verify the manifest and its config from the content store.
    pub async fn fetch(
        store: &dyn ContentStore,
        manifest_descriptor: &ContentDescriptor,
    ) -> Result<Self, ContentError> {
        let manifest_bytes = read_verified(store, manifest_descriptor).await?;
        let manifest: OciManifest =
            serde_json::from_slice(&manifest_bytes).map_err(|e| ContentError::InvalidManifest {
                digest: manifest_descriptor.digest.clone(),
                reason: e.to_string(),
            })?;

        if manifest.schema_version != 2 {
            return Err(ContentError::InvalidManifest {
                digest: manifest_descriptor.digest.clone(),
                reason: format!("unsupported schemaVersion {}", manifest.schema_version),
            });
        }

        let config_bytes = read_verified(store, &manifest.config).await?;

        Ok(Self {
            manifest_descriptor: manifest_descriptor.clone(),
            manifest_bytes,
            manifest,
            config_bytes,
        })
    }

    pub fn media_type(&self) -> &str {
        self.manifest
            .media_type
            .as_deref()
            .unwrap_or(&self.manifest_descriptor.media_type)
    }

    /// Size of any blob belonging to this image, by digest.
    pub fn blob(&self, digest: &str) -> Option<&ContentDescriptor> {
        if self.manifest.config.digest == digest {
            return Some(&self.manifest.config);
        }
        self.manifest.find_layer(digest)
    }
}

/// Randomized repository name and tag for one fast-load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageIdentity {
    pub name: String,
    pub tag: String,
}

const IDENTITY_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

impl ImageIdentity {
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            name: format!("buildgate/load-{}", random_token(rng, 12)),
            tag: random_token(rng, 10),
        }
    }

    pub fn reference(&self, host: &str) -> String {
        format!("{}/{}:{}", host, self.name, self.tag)
    }
}

fn random_token<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| IDENTITY_ALPHABET[rng.random_range(0..IDENTITY_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// In-memory content store that records every digest it is asked for.
    #[derive(Default)]
    pub struct MemoryContentStore {
        pub blobs: HashMap<String, Bytes>,
        pub reads: Mutex<Vec<String>>,
        pub chunk_size: usize,
    }

    impl MemoryContentStore {
        pub fn insert(&mut self, data: impl Into<Bytes>) -> String {
            let data = data.into();
            let digest = sha256_digest(&data);
            self.blobs.insert(digest.clone(), data);
            digest
        }
    }

    #[async_trait]
    impl ContentStore for MemoryContentStore {
        async fn read(&self, digest: &str) -> Result<ContentStream, ContentError> {
            self.reads.lock().unwrap().push(digest.to_string());
            let data = self
                .blobs
                .get(digest)
                .cloned()
                .ok_or_else(|| ContentError::NotFound(digest.to_string()))?;
            let chunk = self.chunk_size.max(1);
            let chunks: Vec<Result<Bytes, ContentError>> = (0..data.len())
                .step_by(chunk)
                .map(|start| Ok(data.slice(start..(start + chunk).min(data.len()))))
                .collect();
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    /// Store a config, one layer and a manifest referencing both.
    pub fn sample_image(store: &mut MemoryContentStore) -> (ContentDescriptor, Bytes) {
        let config = Bytes::from_static(br#"{"architecture":"amd64","os":"linux"}"#);
        let layer = Bytes::from(vec![7u8; 2048]);
        let config_digest = store.insert(config.clone());
        let layer_digest = store.insert(layer.clone());

        let manifest = OciManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config: ContentDescriptor::new(
                "application/vnd.oci.image.config.v1+json",
                config_digest,
                config.len() as u64,
            ),
            layers: vec![ContentDescriptor::new(
                "application/vnd.oci.image.layer.v1.tar+gzip",
                layer_digest,
                layer.len() as u64,
            )],
            annotations: None,
        };
        let manifest_bytes = Bytes::from(serde_json::to_vec(&manifest).unwrap());
        let manifest_digest = store.insert(manifest_bytes.clone());

        (
            ContentDescriptor::new(MEDIA_TYPE_OCI_MANIFEST, manifest_digest, manifest_bytes.len() as u64),
            manifest_bytes,
        )
    }
}
