// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local Docker daemon access.
//!
//! [`LocalDaemon`] is the narrow surface the fast-load path needs: detect a
//! VM-isolated desktop daemon, pull/tag/remove images and run the relay
//! container. [`DockerDaemon`] implements it with `bollard`.

use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    RemoveContainerOptionsBuilder, RemoveImageOptionsBuilder, StartContainerOptions,
    TagImageOptionsBuilder,
};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DaemonError {
    #[error("{0}")]
    Connect(String),

    #[error("Failed to pull image {reference}: {message}")]
    Pull { reference: String, message: String },

    #[error("Failed to tag {source_ref} as {target}: {message}")]
    Tag {
        source_ref: String,
        target: String,
        message: String,
    },

    #[error("Failed to remove image {reference}: {message}")]
    RemoveImage { reference: String, message: String },

    #[error("Relay container error: {0}")]
    Container(String),
}

/// A started relay container and the host port it publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayContainer {
    pub id: String,
    pub host_port: u16,
}

#[async_trait]
pub trait LocalDaemon: Send + Sync {
    /// Whether the daemon runs inside a desktop VM that cannot reach host-only ports.
    async fn needs_bridge(&self) -> Result<bool, DaemonError>;

    async fn pull(&self, reference: &str) -> Result<(), DaemonError>;

    async fn tag(&self, source: &str, target: &str) -> Result<(), DaemonError>;

    async fn remove_image(&self, reference: &str) -> Result<(), DaemonError>;

    /// Start a TCP relay forwarding a published port to `host.docker.internal:<target_port>`.
    async fn start_relay(&self, image: &str, target_port: u16) -> Result<RelayContainer, DaemonError>;

    /// Force-remove a container together with its volumes.
    async fn remove_container(&self, id: &str) -> Result<(), DaemonError>;
}

pub struct DockerDaemon {
    docker: Docker,
}

impl DockerDaemon {
    pub fn new(socket_path: Option<String>) -> Result<Self, DaemonError> {
        let docker = if let Some(path) = socket_path {
            #[cfg(unix)]
            let result = Docker::connect_with_unix(&path, 120, bollard::API_DEFAULT_VERSION);

            #[cfg(windows)]
            let result = Docker::connect_with_named_pipe(&path, 120, bollard::API_DEFAULT_VERSION);

            result.map_err(|e| {
                DaemonError::Connect(format!(
                    "Failed to connect to Docker at {}: {}\n\n\
                     Ensure Docker is running and the socket path is correct.",
                    path, e
                ))
            })?
        } else {
            Docker::connect_with_local_defaults().map_err(|e| {
                DaemonError::Connect(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Common causes:\n\
                     - Docker daemon not running (check: docker ps)\n\
                     - Permission denied accessing Docker socket\n\n\
                     Loading the built image requires a local Docker daemon.",
                    e
                ))
            })?
        };

        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Split `repo[:tag]` into repository and tag, ignoring registry port colons.
pub fn split_reference(reference: &str) -> (&str, &str) {
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => (&reference[..name_start + i], &reference[name_start + i + 1..]),
        None => (reference, "latest"),
    }
}

/// Desktop daemons report themselves through the version platform name or
/// the info operating system string.
pub fn is_desktop_daemon(platform_name: Option<&str>, operating_system: Option<&str>) -> bool {
    let mentions_desktop = |s: &str| s.contains("Docker Desktop");
    platform_name.map(mentions_desktop).unwrap_or(false)
        || operating_system.map(mentions_desktop).unwrap_or(false)
}

#[async_trait]
impl LocalDaemon for DockerDaemon {
    async fn needs_bridge(&self) -> Result<bool, DaemonError> {
        let version = self
            .docker
            .version()
            .await
            .map_err(|e| DaemonError::Connect(format!("Cannot query Docker version: {}", e)))?;
        let platform = version.platform.as_ref().map(|p| p.name.as_str());

        if is_desktop_daemon(platform, None) {
            return Ok(true);
        }

        let info = self
            .docker
            .info()
            .await
            .map_err(|e| DaemonError::Connect(format!("Cannot query Docker info: {}", e)))?;
        Ok(is_desktop_daemon(None, info.operating_system.as_deref()))
    }

    async fn pull(&self, reference: &str) -> Result<(), DaemonError> {
        info!("Pulling image: {}", reference);
        let options = CreateImageOptionsBuilder::default().from_image(reference).build();

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(image = %reference, "{}", status);
                    }
                }
                Err(e) => {
                    return Err(DaemonError::Pull {
                        reference: reference.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<(), DaemonError> {
        let (repo, tag) = split_reference(target);
        let options = TagImageOptionsBuilder::default().repo(repo).tag(tag).build();

        self.docker
            .tag_image(source, Some(options))
            .await
            .map_err(|e| DaemonError::Tag {
                source_ref: source.to_string(),
                target: target.to_string(),
                message: e.to_string(),
            })
    }

    async fn remove_image(&self, reference: &str) -> Result<(), DaemonError> {
        // Only the reference goes away; the tagged image keeps its layers.
        let options = RemoveImageOptionsBuilder::default().noprune(true).build();

        self.docker
            .remove_image(reference, Some(options), None)
            .await
            .map(|_| ())
            .map_err(|e| DaemonError::RemoveImage {
                reference: reference.to_string(),
                message: e.to_string(),
            })
    }

    async fn start_relay(&self, image: &str, target_port: u16) -> Result<RelayContainer, DaemonError> {
        self.pull(image).await?;

        let container_port = format!("{}/tcp", target_port);
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: None,
            }]),
        );

        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            cmd: Some(vec![
                format!("TCP-LISTEN:{},fork,reuseaddr", target_port),
                format!("TCP:host.docker.internal:{}", target_port),
            ]),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let name = format!("buildgate-relay-{}", target_port);
        let options = CreateContainerOptionsBuilder::default().name(&name).build();
        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| DaemonError::Container(format!("create {}: {}", name, e)))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            let _ = self.remove_container(&created.id).await;
            return Err(DaemonError::Container(format!("start {}: {}", name, e)));
        }

        let inspect = match self
            .docker
            .inspect_container(&created.id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) => {
                let _ = self.remove_container(&created.id).await;
                return Err(DaemonError::Container(format!("inspect {}: {}", name, e)));
            }
        };

        let host_port = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| ports.get(&container_port).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .and_then(|port| port.parse::<u16>().ok());

        match host_port {
            Some(host_port) => {
                info!(container = %created.id, host_port, target_port, "Relay container started");
                Ok(RelayContainer { id: created.id, host_port })
            }
            None => {
                let _ = self.remove_container(&created.id).await;
                Err(DaemonError::Container(format!("{} published no host port", name)))
            }
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), DaemonError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).v(true).build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| DaemonError::Container(format!("remove {}: {}", id, e)))
    }
}
