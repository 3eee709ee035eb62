// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local image loading.
//!
//! Fast load pins the built image, serves it from a one-shot content registry
//! under a random name and has the local daemon pull it from there. The
//! fallback path pulls a temporary tag from the hosted registry instead. Both
//! finish by applying the user's tags and dropping the temporary reference.

use crate::domain::build::{BuildError, CancelSource};
use crate::domain::content::{ContentDescriptor, ContentStore, ImageIdentity, PinnedImage};
use crate::infrastructure::bridge::DesktopBridge;
use crate::infrastructure::docker::LocalDaemon;
use crate::infrastructure::registry::ContentRegistry;
use rand::rngs::StdRng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct FastLoader {
    daemon: Arc<dyn LocalDaemon>,
    bridge: DesktopBridge,
    rng: Mutex<StdRng>,
}

impl FastLoader {
    pub fn new(daemon: Arc<dyn LocalDaemon>, bridge: DesktopBridge, rng: StdRng) -> Self {
        Self { daemon, bridge, rng: Mutex::new(rng) }
    }

    fn identity(&self) -> ImageIdentity {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ImageIdentity::random(&mut *rng)
    }

    /// Load one image from the builder's content store into the local daemon.
    ///
    /// The registry and any relay are torn down whether or not the load worked.
    /// A failure after `cancel` fired is reported as a user cancellation.
    pub async fn load(
        &self,
        store: Arc<dyn ContentStore>,
        manifest: &ContentDescriptor,
        tags: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        match self.load_pinned(store, manifest, tags, cancel).await {
            Err(_) if cancel.is_cancelled() => Err(BuildError::Canceled(CancelSource::User)),
            other => other,
        }
    }

    async fn load_pinned(
        &self,
        store: Arc<dyn ContentStore>,
        manifest: &ContentDescriptor,
        tags: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        let image = PinnedImage::fetch(store.as_ref(), manifest)
            .await
            .map_err(|e| BuildError::FastLoad(e.to_string()))?;
        let identity = self.identity();

        let bridge_required = self.bridge.required().await;
        // A relay reaches the registry through the host gateway, not loopback.
        let bind_ip = if bridge_required {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };

        let registry_cancel = cancel.child_token();
        let registry = ContentRegistry::new(identity.clone(), image, store)
            .serve(SocketAddr::new(bind_ip, 0), registry_cancel)
            .await
            .map_err(|e| BuildError::FastLoad(e.to_string()))?;

        let result = async {
            let route = self
                .bridge
                .open(registry.port(), bridge_required, cancel)
                .await
                .map_err(|e| BuildError::FastLoad(e.to_string()))?;

            let reference = identity.reference(&route.host);
            let pulled = self
                .pull_and_tag(&reference, tags)
                .await
                .map_err(|e| BuildError::FastLoad(e.to_string()));

            self.bridge.close(route).await;
            pulled
        }
        .await;

        registry.shutdown().await;
        result
    }

    /// Fallback retrieval through a temporary tag on the hosted registry.
    pub async fn load_hosted(&self, reference: &str, tags: &[String]) -> Result<(), BuildError> {
        self.pull_and_tag(reference, tags)
            .await
            .map_err(|e| BuildError::Load(e.to_string()))
    }

    async fn pull_and_tag(
        &self,
        reference: &str,
        tags: &[String],
    ) -> Result<(), crate::infrastructure::docker::DaemonError> {
        self.daemon.pull(reference).await?;
        for tag in tags {
            self.daemon.tag(reference, tag).await?;
            info!(tag = %tag, "Loaded image");
        }

        if !tags.is_empty() {
            if let Err(e) = self.daemon.remove_image(reference).await {
                warn!(reference = %reference, error = %e, "Failed to remove temporary image reference");
            }
        }
        Ok(())
    }
}
