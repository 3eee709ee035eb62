// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Desktop Network Bridge
//!
//! A desktop daemon runs inside a VM and cannot reach a port bound on the
//! host's loopback. When that is detected, a relay container is started on the
//! daemon's own network forwarding a published port to the registry, and the
//! daemon pulls from `localhost:<relay port>` instead. Both the registry and
//! the relay must answer HTTP before the route is handed out.

use crate::domain::config::ReadinessPolicy;
use crate::infrastructure::docker::{DaemonError, LocalDaemon, RelayContainer};
use crate::infrastructure::readiness::{poll_until, HttpProbe, ReadinessError};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error("Content registry unreachable: {0}")]
    Registry(ReadinessError),

    #[error("Relay container unreachable: {0}")]
    Relay(ReadinessError),
}

/// How the local daemon reaches the registry for one load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRoute {
    /// `host:port` the daemon pulls from
    pub host: String,
    pub relay: Option<RelayContainer>,
}

pub struct DesktopBridge {
    daemon: Arc<dyn LocalDaemon>,
    http: reqwest::Client,
    relay_image: String,
    readiness: ReadinessPolicy,
}

impl DesktopBridge {
    pub fn new(
        daemon: Arc<dyn LocalDaemon>,
        http: reqwest::Client,
        relay_image: impl Into<String>,
        readiness: ReadinessPolicy,
    ) -> Self {
        Self {
            daemon,
            http,
            relay_image: relay_image.into(),
            readiness,
        }
    }

    /// Probe the daemon platform; errors count as "no bridge needed".
    pub async fn required(&self) -> bool {
        match self.daemon.needs_bridge().await {
            Ok(required) => required,
            Err(e) => {
                warn!(error = %e, "Could not determine daemon platform, assuming direct access");
                false
            }
        }
    }

    /// Wait for the registry and, when `bridge` is set, put a relay in front of it.
    pub async fn open(
        &self,
        registry_port: u16,
        bridge: bool,
        cancel: &CancellationToken,
    ) -> Result<RegistryRoute, BridgeError> {
        let registry = HttpProbe::new(self.http.clone(), format!("http://127.0.0.1:{}/v2/", registry_port));
        poll_until(&registry, self.readiness, cancel)
            .await
            .map_err(BridgeError::Registry)?;

        if !bridge {
            return Ok(RegistryRoute {
                host: format!("localhost:{}", registry_port),
                relay: None,
            });
        }

        let relay = self.daemon.start_relay(&self.relay_image, registry_port).await?;
        let probe = HttpProbe::new(self.http.clone(), format!("http://127.0.0.1:{}/v2/", relay.host_port));
        if let Err(e) = poll_until(&probe, self.readiness, cancel).await {
            self.remove_relay(&relay).await;
            return Err(BridgeError::Relay(e));
        }

        info!(relay = %relay.id, port = relay.host_port, "Registry reachable through desktop relay");
        Ok(RegistryRoute {
            host: format!("localhost:{}", relay.host_port),
            relay: Some(relay),
        })
    }

    /// Tear down whatever [`DesktopBridge::open`] started.
    pub async fn close(&self, route: RegistryRoute) {
        if let Some(relay) = route.relay {
            self.remove_relay(&relay).await;
        }
    }

    async fn remove_relay(&self, relay: &RelayContainer) {
        if let Err(e) = self.daemon.remove_container(&relay.id).await {
            warn!(relay = %relay.id, error = %e, "Failed to remove relay container");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every daemon call. The "relay" publishes the registry port itself.
    #[derive(Default)]
    pub struct FakeDaemon {
        pub desktop: bool,
        pub relay_port: Option<u16>,
        pub fail_pull: Option<String>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeDaemon {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl LocalDaemon for FakeDaemon {
        async fn needs_bridge(&self) -> Result<bool, DaemonError> {
            Ok(self.desktop)
        }

        async fn pull(&self, reference: &str) -> Result<(), DaemonError> {
            self.record(format!("pull {}", reference));
            match &self.fail_pull {
                Some(message) => Err(DaemonError::Pull {
                    reference: reference.to_string(),
                    message: message.clone(),
                }),
                None => Ok(()),
            }
        }

        async fn tag(&self, source: &str, target: &str) -> Result<(), DaemonError> {
            self.record(format!("tag {} {}", source, target));
            Ok(())
        }

        async fn remove_image(&self, reference: &str) -> Result<(), DaemonError> {
            self.record(format!("rmi {}", reference));
            Ok(())
        }

        async fn start_relay(&self, image: &str, target_port: u16) -> Result<RelayContainer, DaemonError> {
            self.record(format!("relay {} {}", image, target_port));
            Ok(RelayContainer {
                id: "relay-1".to_string(),
                host_port: self.relay_port.unwrap_or(target_port),
            })
        }

        async fn remove_container(&self, id: &str) -> Result<(), DaemonError> {
            self.record(format!("rm {}", id));
            Ok(())
        }
    }
}
