// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Builder Lifecycle
//!
//! Acquires one ephemeral builder per architecture from the bookkeeping
//! service, waits for it to pass a bounded liveness poll and publishes the
//! resulting connection (or error) into a per-architecture slot. Proxies are
//! started before bootstrap finishes; their [`ConnectionState`] waits on the
//! slot the first time an RPC needs the builder.

use crate::domain::builder::{Builder, BuilderEndpoint, BuilderId, BuilderState};
use crate::domain::config::ReadinessPolicy;
use crate::domain::connection::{AcquisitionError, BuilderConnection, ConnectionState, Connector};
use crate::domain::platform::Architecture;
use crate::domain::progress::ProgressReporter;
use crate::domain::BuildService;
use crate::infrastructure::grpc::GrpcHealthProbe;
use crate::infrastructure::readiness::{poll_until, LivenessProbe, ReadinessError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tonic::transport::{ClientTlsConfig, Endpoint};
use tracing::{error, info, warn};

/// Turns an advertised endpoint into a channel and a liveness probe.
pub trait BuilderDialer: Send + Sync {
    fn dial(&self, architecture: Architecture, endpoint: &BuilderEndpoint)
        -> Result<BuilderConnection, AcquisitionError>;

    fn probe(&self, connection: &BuilderConnection) -> Box<dyn LivenessProbe>;
}

/// Lazy tonic channels, TLS for `https://` addresses, gRPC health for liveness.
pub struct GrpcDialer;

impl BuilderDialer for GrpcDialer {
    fn dial(
        &self,
        architecture: Architecture,
        endpoint: &BuilderEndpoint,
    ) -> Result<BuilderConnection, AcquisitionError> {
        let invalid = |reason: String| AcquisitionError::InvalidEndpoint {
            platform: architecture,
            builder: endpoint.builder_id.to_string(),
            address: endpoint.address.clone(),
            reason,
        };

        let mut channel = Endpoint::from_shared(endpoint.address.clone())
            .map_err(|e| invalid(e.to_string()))?
            .http2_keep_alive_interval(std::time::Duration::from_secs(30))
            .keep_alive_while_idle(true);

        if endpoint.address.starts_with("https://") {
            channel = channel
                .tls_config(ClientTlsConfig::new().with_webpki_roots())
                .map_err(|e| invalid(e.to_string()))?;
        }

        Ok(BuilderConnection::new(
            endpoint.builder_id.clone(),
            architecture,
            channel.connect_lazy(),
            &endpoint.token,
        ))
    }

    fn probe(&self, connection: &BuilderConnection) -> Box<dyn LivenessProbe> {
        Box::new(GrpcHealthProbe::new(connection.clone()))
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Ready(BuilderConnection),
    Failed(AcquisitionError),
}

/// Waits for the lifecycle to publish a builder connection.
struct SlotConnector {
    architecture: Architecture,
    rx: watch::Receiver<Slot>,
}

#[async_trait]
impl Connector for SlotConnector {
    async fn connect(&self) -> Result<BuilderConnection, AcquisitionError> {
        let mut rx = self.rx.clone();
        let slot = rx
            .wait_for(|slot| !matches!(slot, Slot::Pending))
            .await
            .map_err(|_| {
                AcquisitionError::Unavailable(format!(
                    "{} builder lifecycle ended before a connection was published",
                    self.architecture
                ))
            })?
            .clone();

        match slot {
            Slot::Ready(connection) => Ok(connection),
            Slot::Failed(err) => Err(err),
            Slot::Pending => Err(AcquisitionError::Unavailable("builder still pending".to_string())),
        }
    }
}

pub struct BuilderLifecycle {
    service: Arc<dyn BuildService>,
    dialer: Arc<dyn BuilderDialer>,
    build_id: String,
    token: String,
    readiness: ReadinessPolicy,
    slots: HashMap<Architecture, watch::Sender<Slot>>,
    builders: Mutex<HashMap<Architecture, Builder>>,
    endpoints: Mutex<HashMap<Architecture, BuilderEndpoint>>,
    cancel: CancellationToken,
}

impl BuilderLifecycle {
    pub fn new(
        service: Arc<dyn BuildService>,
        dialer: Arc<dyn BuilderDialer>,
        build_id: impl Into<String>,
        token: impl Into<String>,
        architectures: &[Architecture],
        readiness: ReadinessPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let slots = architectures
            .iter()
            .map(|arch| (*arch, watch::channel(Slot::Pending).0))
            .collect();

        Self {
            service,
            dialer,
            build_id: build_id.into(),
            token: token.into(),
            readiness,
            slots,
            builders: Mutex::new(HashMap::new()),
            endpoints: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    pub fn architectures(&self) -> Vec<Architecture> {
        let mut archs: Vec<Architecture> = self.slots.keys().copied().collect();
        archs.sort();
        archs
    }

    /// Connection state for the proxies of one architecture.
    pub fn connection_state(
        &self,
        architecture: Architecture,
        build_url: Option<String>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> ConnectionState {
        let connector: Arc<dyn Connector> = match self.slots.get(&architecture) {
            Some(tx) => Arc::new(SlotConnector { architecture, rx: tx.subscribe() }),
            None => {
                let (tx, rx) = watch::channel(Slot::Failed(AcquisitionError::Unavailable(format!(
                    "no {} builder was requested for this build",
                    architecture
                ))));
                drop(tx);
                Arc::new(SlotConnector { architecture, rx })
            }
        };
        ConnectionState::new(connector, build_url, reporter)
    }

    /// Wait for the connection of one architecture.
    pub async fn connection(&self, architecture: Architecture) -> Result<BuilderConnection, AcquisitionError> {
        let tx = self.slots.get(&architecture).ok_or_else(|| {
            AcquisitionError::Unavailable(format!("no {} builder was requested for this build", architecture))
        })?;
        SlotConnector { architecture, rx: tx.subscribe() }.connect().await
    }

    pub fn state(&self, architecture: Architecture) -> Option<BuilderState> {
        self.lock_builders().get(&architecture).map(|b| b.state)
    }

    pub fn builder_id(&self, architecture: Architecture) -> Option<BuilderId> {
        self.lock_builders().get(&architecture).map(|b| b.id.clone())
    }

    /// Raw content-streaming address advertised by the builder, if any.
    pub fn content_address(&self, architecture: Architecture) -> Option<String> {
        self.endpoints
            .lock()
            .ok()
            .and_then(|endpoints| endpoints.get(&architecture).and_then(|e| e.content_address.clone()))
    }

    /// Acquire and boot one builder, publishing the outcome into its slot.
    pub async fn bootstrap(&self, architecture: Architecture) -> Result<BuilderConnection, AcquisitionError> {
        let outcome = self.boot(architecture).await;

        if let Some(tx) = self.slots.get(&architecture) {
            tx.send_replace(match &outcome {
                Ok(connection) => Slot::Ready(connection.clone()),
                Err(err) => Slot::Failed(err.clone()),
            });
        }

        match &outcome {
            Ok(connection) => {
                self.set_state(architecture, BuilderState::Ready);
                info!(
                    build_id = %self.build_id,
                    platform = %architecture,
                    builder_id = %connection.builder_id,
                    "Builder ready"
                );
            }
            Err(err) => {
                self.set_state(architecture, BuilderState::Error);
                error!(build_id = %self.build_id, platform = %architecture, error = %err, "Builder failed to start");
            }
        }

        outcome
    }

    async fn boot(&self, architecture: Architecture) -> Result<BuilderConnection, AcquisitionError> {
        info!(build_id = %self.build_id, platform = %architecture, "Acquiring builder");

        let endpoint = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(AcquisitionError::Canceled { platform: architecture }),
            acquired = self.service.acquire(&self.build_id, &self.token, architecture) => acquired?,
        };

        {
            let mut builders = self.lock_builders();
            builders.insert(architecture, Builder::booting(architecture, &endpoint));
        }
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.insert(architecture, endpoint.clone());
        }

        let connection = self.dialer.dial(architecture, &endpoint)?;
        let probe = self.dialer.probe(&connection);

        match poll_until(probe.as_ref(), self.readiness, &self.cancel).await {
            Ok(_) => Ok(connection),
            Err(ReadinessError::Canceled { .. }) => Err(AcquisitionError::Canceled { platform: architecture }),
            Err(ReadinessError::Exhausted { attempts, last_error, .. }) => Err(AcquisitionError::NotReady {
                platform: architecture,
                builder: endpoint.builder_id.to_string(),
                attempts,
                last_error,
            }),
        }
    }

    /// Boot every requested builder in parallel.
    ///
    /// A failing builder does not stop its siblings; the first error to
    /// complete is returned once all have finished.
    pub async fn bootstrap_all(self: &Arc<Self>) -> Result<(), AcquisitionError> {
        let mut tasks = JoinSet::new();
        for architecture in self.slots.keys().copied() {
            let lifecycle = Arc::clone(self);
            tasks.spawn(async move { lifecycle.bootstrap(architecture).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(AcquisitionError::Unavailable(format!("bootstrap task failed: {}", e)))
            });
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Mark every ready builder released. Released builders are never handed out again.
    pub fn release(&self) -> Vec<BuilderId> {
        let mut released = Vec::new();
        for (architecture, builder) in self.lock_builders().iter_mut() {
            if builder.is_ready() {
                if let Err(e) = builder.transition(BuilderState::Released) {
                    warn!(platform = %architecture, error = %e, "Could not release builder");
                    continue;
                }
                released.push(builder.id.clone());
            }
        }

        for (architecture, tx) in &self.slots {
            tx.send_replace(Slot::Failed(AcquisitionError::Unavailable(format!(
                "{} builder was released",
                architecture
            ))));
        }

        info!(build_id = %self.build_id, count = released.len(), "Builders released");
        released
    }

    fn set_state(&self, architecture: Architecture, state: BuilderState) {
        if let Some(builder) = self.lock_builders().get_mut(&architecture) {
            if let Err(e) = builder.transition(state) {
                warn!(platform = %architecture, error = %e, "Ignoring builder state change");
            }
        }
    }

    fn lock_builders(&self) -> std::sync::MutexGuard<'_, HashMap<Architecture, Builder>> {
        self.builders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
