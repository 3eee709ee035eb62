// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Build Orchestrator
//!
//! Drives one build end to end:
//!
//! 1. resolve the requested platforms into builder architectures
//! 2. start one proxy per architecture and bootstrap the builders behind them
//! 3. hand the proxy endpoints to the external build client
//! 4. retrieve the image (fast load, hosted-registry round trip, or nothing)
//!
//! Steps 2-4 form one attempt. Attempts are retried on allow-listed transient
//! errors. A failed fast load re-runs the build with a conventional export
//! unless the build input came from stdin. The bookkeeping record is finished
//! exactly once and the progress reporter is always flushed.

use crate::application::fast_load::FastLoader;
use crate::application::lifecycle::{BuilderDialer, BuilderLifecycle};
use crate::application::retry::with_retry;
use crate::application::telemetry::TimingsRecorder;
use crate::domain::build::{
    BuildClient, BuildError, BuildOutcome, BuildRequest, BuildResult, CancelSource, ExportStrategy, ProxyNode,
};
use crate::domain::config::GateConfigSpec;
use crate::domain::connection::BuilderConnection;
use crate::domain::content::{ContentStore, ImageIdentity};
use crate::domain::platform::{resolve_platforms, Architecture};
use crate::domain::progress::ProgressReporter;
use crate::domain::BuildService;
use crate::infrastructure::content_store::GrpcContentStore;
use crate::infrastructure::packet::PacketContentStore;
use crate::presentation::proxy::{ProxyContext, ProxyServer, ShutdownSignal};
use rand::rngs::StdRng;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Opens the content store of a ready builder.
pub trait ContentStoreFactory: Send + Sync {
    fn open(
        &self,
        connection: BuilderConnection,
        content_address: Option<String>,
        cancel: CancellationToken,
    ) -> Arc<dyn ContentStore>;
}

/// Packet transport when the builder advertises a raw content address,
/// gRPC content service otherwise.
pub struct BuilderContentStores;

impl ContentStoreFactory for BuilderContentStores {
    fn open(
        &self,
        connection: BuilderConnection,
        content_address: Option<String>,
        cancel: CancellationToken,
    ) -> Arc<dyn ContentStore> {
        match content_address {
            Some(address) => Arc::new(PacketContentStore::new(address)),
            None => Arc::new(GrpcContentStore::new(connection, cancel)),
        }
    }
}

/// The build's bookkeeping record. Consumed by `finish`, so it can only be
/// finalized once.
struct BuildRecord {
    service: Arc<dyn BuildService>,
    build_id: String,
    token: String,
}

impl BuildRecord {
    async fn finish(self, outcome: BuildOutcome) {
        info!(build_id = %self.build_id, outcome = outcome.kind(), "Finishing build");
        if let Err(e) = self.service.finish(&self.build_id, &self.token, &outcome).await {
            error!(build_id = %self.build_id, error = %e, "Failed to record build outcome");
        }
    }
}

pub struct BuildOrchestrator {
    service: Arc<dyn BuildService>,
    client: Arc<dyn BuildClient>,
    dialer: Arc<dyn BuilderDialer>,
    reporter: Arc<dyn ProgressReporter>,
    loader: Option<Arc<FastLoader>>,
    stores: Arc<dyn ContentStoreFactory>,
    config: GateConfigSpec,
    host: Architecture,
    rng: Mutex<StdRng>,
}

impl BuildOrchestrator {
    pub fn new(
        service: Arc<dyn BuildService>,
        client: Arc<dyn BuildClient>,
        dialer: Arc<dyn BuilderDialer>,
        reporter: Arc<dyn ProgressReporter>,
        config: GateConfigSpec,
        rng: StdRng,
    ) -> Self {
        Self {
            service,
            client,
            dialer,
            reporter,
            loader: None,
            stores: Arc::new(BuilderContentStores),
            config,
            host: Architecture::host().unwrap_or(Architecture::Amd64),
            rng: Mutex::new(rng),
        }
    }

    pub fn with_loader(mut self, loader: Arc<FastLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_content_stores(mut self, stores: Arc<dyn ContentStoreFactory>) -> Self {
        self.stores = stores;
        self
    }

    pub fn with_host(mut self, host: Architecture) -> Self {
        self.host = host;
        self
    }

    pub async fn build(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<BuildResult>, BuildError> {
        let record = BuildRecord {
            service: self.service.clone(),
            build_id: request.build_id.clone(),
            token: request.token.clone(),
        };

        let result = match self.run(request, cancel).await {
            Err(err) if cancel.is_cancelled() && !err.is_cancellation() => {
                Err(BuildError::Canceled(CancelSource::User))
            }
            Err(err) if !cancel.is_cancelled() && err.is_remote_cancellation() => {
                warn!(build_id = %request.build_id, error = %err, "Build canceled by the builder");
                Err(BuildError::Canceled(CancelSource::Remote))
            }
            other => other,
        };

        if let Err(err) = &result {
            if !err.is_cancellation() {
                self.reporter.print(&err.user_message());
            }
        }
        record.finish(BuildOutcome::from_result(&result)).await;
        if let Err(e) = self.reporter.flush().await {
            warn!(build_id = %request.build_id, error = %e, "Progress output did not flush");
        }
        result
    }

    async fn run(&self, request: &BuildRequest, cancel: &CancellationToken) -> Result<Vec<BuildResult>, BuildError> {
        let architectures = resolve_platforms(&request.platforms, request.explicit_platforms, self.host)?;
        let export = self.export_strategy(request);
        info!(
            build_id = %request.build_id,
            platforms = ?architectures,
            export = ?export,
            "Starting build"
        );

        let retry = self.config.retry.policy();
        let result = with_retry(retry, cancel, |attempt| {
            self.attempt(request, &architectures, &export, attempt, cancel)
        })
        .await;

        match result {
            Err(err @ BuildError::FastLoad(_)) if !request.stdin_input && !cancel.is_cancelled() => {
                warn!(build_id = %request.build_id, error = %err, "Fast load failed, rebuilding with image export");
                self.reporter
                    .print("Fast load failed, falling back to exporting the image into Docker");
                let fallback = ExportStrategy::DockerLoad;
                with_retry(retry, cancel, |attempt| {
                    self.attempt(request, &architectures, &fallback, attempt, cancel)
                })
                .await
            }
            other => other,
        }
    }

    fn export_strategy(&self, request: &BuildRequest) -> ExportStrategy {
        if !request.load {
            return ExportStrategy::None;
        }
        if self.config.fast_load.enabled && request.can_use_local_registry && self.loader.is_some() {
            return ExportStrategy::ContentStore;
        }
        match &request.hosted_repository {
            Some(repository) => {
                let identity = {
                    let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    ImageIdentity::random(&mut *rng)
                };
                ExportStrategy::HostedRegistry {
                    reference: format!("{}:tmp-{}", repository.trim_end_matches('/'), identity.tag),
                }
            }
            None => ExportStrategy::DockerLoad,
        }
    }

    async fn attempt(
        &self,
        request: &BuildRequest,
        architectures: &[Architecture],
        export: &ExportStrategy,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<BuildResult>, BuildError> {
        if attempt > 1 {
            self.reporter.print(&format!("Retrying build (attempt {})", attempt));
        }

        let attempt_cancel = cancel.child_token();
        let lifecycle = Arc::new(BuilderLifecycle::new(
            self.service.clone(),
            self.dialer.clone(),
            request.build_id.clone(),
            request.token.clone(),
            architectures,
            self.config.builder.readiness(),
            attempt_cancel.clone(),
        ));
        let recorder = TimingsRecorder::start(
            self.service.clone(),
            request.build_id.clone(),
            request.token.clone(),
            Duration::from_millis(self.config.telemetry.flush_interval_ms),
            attempt_cancel.child_token(),
        );

        let mut proxies = Vec::with_capacity(architectures.len());
        let result = self
            .drive(request, architectures, export, &lifecycle, &recorder, &mut proxies, &attempt_cancel)
            .await;

        for proxy in proxies {
            if let Err(e) = proxy.shutdown().await {
                warn!(build_id = %request.build_id, error = %e, "Build proxy did not stop cleanly");
            }
        }
        lifecycle.release();
        recorder.finish().await;
        attempt_cancel.cancel();

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        request: &BuildRequest,
        architectures: &[Architecture],
        export: &ExportStrategy,
        lifecycle: &Arc<BuilderLifecycle>,
        recorder: &TimingsRecorder,
        proxies: &mut Vec<ProxyServer>,
        cancel: &CancellationToken,
    ) -> Result<Vec<BuildResult>, BuildError> {
        let bind_ip: IpAddr = self.config.proxy.bind_address.parse().map_err(|e| {
            BuildError::Transport(format!(
                "invalid proxy bind address '{}': {}",
                self.config.proxy.bind_address, e
            ))
        })?;
        let grace = Duration::from_millis(self.config.proxy.shutdown_grace_ms);
        let summary_printed = Arc::new(AtomicBool::new(false));

        let mut nodes = Vec::with_capacity(architectures.len());
        for architecture in architectures.iter().copied() {
            let connection =
                Arc::new(lifecycle.connection_state(architecture, request.build_url.clone(), self.reporter.clone()));
            let stop = cancel.child_token();
            let ctx = ProxyContext::new(
                architecture,
                connection,
                Arc::new(ShutdownSignal::new(stop.clone(), grace)),
                cancel.child_token(),
            )
            .with_timings(recorder.sink())
            .with_summary_flag(summary_printed.clone());

            let server = ProxyServer::start(ctx, SocketAddr::new(bind_ip, 0), stop)
                .await
                .map_err(|e| BuildError::Transport(e.to_string()))?;
            nodes.push(ProxyNode { architecture, endpoint: server.endpoint() });
            proxies.push(server);
        }

        let (_, results) = tokio::try_join!(
            async { lifecycle.bootstrap_all().await.map_err(BuildError::from) },
            self.client.build(&nodes, export, cancel),
        )?;

        self.retrieve(request, architectures, export, lifecycle, &results, cancel)
            .await?;
        Ok(results)
    }

    async fn retrieve(
        &self,
        request: &BuildRequest,
        architectures: &[Architecture],
        export: &ExportStrategy,
        lifecycle: &BuilderLifecycle,
        results: &[BuildResult],
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        match export {
            ExportStrategy::ContentStore => {
                let loader = self
                    .loader
                    .as_ref()
                    .ok_or_else(|| BuildError::FastLoad("no local Docker daemon available".to_string()))?;
                // The primary node's image is the one loaded locally.
                let primary = architectures.first().copied().unwrap_or(self.host);
                let manifest = results
                    .iter()
                    .find(|r| r.architecture == primary)
                    .or_else(|| results.first())
                    .and_then(|r| r.manifest_for(primary))
                    .ok_or_else(|| BuildError::FastLoad("build produced no image manifest".to_string()))?;

                let connection = lifecycle.connection(primary).await?;
                let store = self
                    .stores
                    .open(connection, lifecycle.content_address(primary), cancel.child_token());
                loader.load(store, manifest, &request.tags, cancel).await?;
                self.reporter.print(&format!("Loaded image {}", manifest.digest));
                Ok(())
            }
            ExportStrategy::HostedRegistry { reference } => {
                let loader = self
                    .loader
                    .as_ref()
                    .ok_or_else(|| BuildError::Load("no local Docker daemon available".to_string()))?;
                let loaded = loader.load_hosted(reference, &request.tags).await;
                if let Err(e) = self
                    .service
                    .delete_temporary_tag(&request.build_id, &request.token, reference)
                    .await
                {
                    warn!(build_id = %request.build_id, reference = %reference, error = %e, "Failed to delete temporary tag");
                }
                loaded
            }
            ExportStrategy::DockerLoad | ExportStrategy::None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::testing::{FakeBuildService, FakeDialer};
    use crate::domain::build::ManifestConfig;
    use crate::domain::builder::BuilderId;
    use crate::domain::config::{ReadinessPolicy, RetryConfig};
    use crate::domain::content::testing::{sample_image, MemoryContentStore};
    use crate::domain::content::ContentDescriptor;
    use crate::domain::progress::ReporterError;
    use crate::infrastructure::bridge::testing::FakeDaemon;
    use crate::infrastructure::bridge::DesktopBridge;
    use async_trait::async_trait;
    use rand::SeedableRng;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Script = VecDeque<Result<(), BuildError>>;

    /// Answers each build call from a script; an empty script means success.
    #[derive(Default)]
    struct FakeBuildClient {
        script: Mutex<Script>,
        exports: Mutex<Vec<ExportStrategy>>,
        nodes: Mutex<Vec<Vec<ProxyNode>>>,
        manifest: Option<ContentDescriptor>,
    }

    impl FakeBuildClient {
        fn scripted(results: Vec<Result<(), BuildError>>) -> Self {
            Self { script: Mutex::new(results.into()), ..Default::default() }
        }

        fn exports(&self) -> Vec<ExportStrategy> {
            self.exports.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BuildClient for FakeBuildClient {
        async fn build(
            &self,
            nodes: &[ProxyNode],
            export: &ExportStrategy,
            cancel: &CancellationToken,
        ) -> Result<Vec<BuildResult>, BuildError> {
            self.exports.lock().unwrap().push(export.clone());
            self.nodes.lock().unwrap().push(nodes.to_vec());
            if cancel.is_cancelled() {
                return Err(BuildError::Canceled(CancelSource::User));
            }
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))?;

            Ok(nodes
                .iter()
                .map(|node| BuildResult {
                    architecture: node.architecture,
                    builder_id: BuilderId::new(format!("builder-{}", node.architecture)),
                    exporter_response: HashMap::new(),
                    attestation_index: None,
                    manifests: self
                        .manifest
                        .iter()
                        .map(|m| ManifestConfig { manifest: m.clone(), config: None })
                        .collect(),
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct CountingReporter {
        flushes: AtomicUsize,
        lines: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProgressReporter for CountingReporter {
        fn publish_status(&self, _message: &bytes::Bytes) {}

        fn print(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }

        async fn flush(&self) -> Result<(), ReporterError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SharedStore(Arc<MemoryContentStore>);

    impl ContentStoreFactory for SharedStore {
        fn open(&self, _: BuilderConnection, _: Option<String>, _: CancellationToken) -> Arc<dyn ContentStore> {
            self.0.clone()
        }
    }

    fn config() -> GateConfigSpec {
        let mut config = GateConfigSpec::default();
        config.retry = RetryConfig { max_retries: 2, backoff_ms: 10 };
        config.telemetry.flush_interval_ms = 50;
        config.proxy.shutdown_grace_ms = 10;
        config
    }

    fn request() -> BuildRequest {
        BuildRequest {
            build_id: "b1".to_string(),
            token: "t".to_string(),
            build_url: None,
            platforms: vec!["linux/amd64".to_string()],
            explicit_platforms: true,
            tags: vec!["myapp:latest".to_string()],
            load: false,
            can_use_local_registry: false,
            stdin_input: false,
            hosted_repository: None,
        }
    }

    struct Harness {
        service: Arc<FakeBuildService>,
        client: Arc<FakeBuildClient>,
        reporter: Arc<CountingReporter>,
        daemon: Arc<FakeDaemon>,
        orchestrator: BuildOrchestrator,
    }

    fn harness(service: FakeBuildService, client: FakeBuildClient, daemon: FakeDaemon) -> Harness {
        let service = Arc::new(service);
        let client = Arc::new(client);
        let reporter = Arc::new(CountingReporter::default());
        let daemon = Arc::new(daemon);

        let bridge = DesktopBridge::new(
            daemon.clone(),
            reqwest::Client::new(),
            "alpine/socat",
            ReadinessPolicy { attempts: 20, interval: Duration::from_millis(10) },
        );
        let loader = Arc::new(FastLoader::new(daemon.clone(), bridge, StdRng::seed_from_u64(3)));

        let orchestrator = BuildOrchestrator::new(
            service.clone(),
            client.clone(),
            Arc::new(FakeDialer::default()),
            reporter.clone(),
            config(),
            StdRng::seed_from_u64(7),
        )
        .with_loader(loader)
        .with_host(Architecture::Amd64);

        Harness { service, client, reporter, daemon, orchestrator }
    }

    #[tokio::test]
    async fn test_successful_build_finishes_once_and_flushes() {
        let h = harness(FakeBuildService::default(), FakeBuildClient::default(), FakeDaemon::default());

        let results = tokio_test::assert_ok!(h.orchestrator.build(&request(), &CancellationToken::new()).await);

        assert_eq!(results.len(), 1);
        assert_eq!(h.service.finished(), vec![BuildOutcome::Success]);
        assert_eq!(h.reporter.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(h.client.exports(), vec![ExportStrategy::None]);
        let nodes = h.client.nodes.lock().unwrap().clone();
        assert!(nodes[0][0].endpoint.starts_with("tcp://127.0.0.1:"));
    }

    #[tokio::test]
    async fn test_platform_error_is_still_recorded() {
        let h = harness(FakeBuildService::default(), FakeBuildClient::default(), FakeDaemon::default());
        let mut req = request();
        req.platforms = vec!["windows/amd64".to_string()];

        let err = h.orchestrator.build(&req, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, BuildError::Platform(_)));
        assert_eq!(h.service.finished().len(), 1);
        assert_eq!(h.service.finished()[0].kind(), "error");
        assert!(h.client.exports().is_empty());
        assert_eq!(h.reporter.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_whole_build() {
        let client = FakeBuildClient::scripted(vec![Err(BuildError::Build(
            "rpc error: code = Unavailable desc = transport is closing".to_string(),
        ))]);
        let h = harness(FakeBuildService::default(), client, FakeDaemon::default());

        h.orchestrator.build(&request(), &CancellationToken::new()).await.unwrap();

        assert_eq!(h.client.exports().len(), 2);
        assert_eq!(h.service.finished(), vec![BuildOutcome::Success]);
    }

    #[tokio::test]
    async fn test_build_error_is_not_retried() {
        let client = FakeBuildClient::scripted(vec![Err(BuildError::Build("failed to solve: exit code 2".to_string()))]);
        let h = harness(FakeBuildService::default(), client, FakeDaemon::default());

        let err = h.orchestrator.build(&request(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, BuildError::Build(_)));
        assert_eq!(h.client.exports().len(), 1);
        assert_eq!(
            h.service.finished(),
            vec![BuildOutcome::Error("failed to solve: exit code 2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_acquisition_failure_surfaces() {
        let service = FakeBuildService {
            reject: [Architecture::Amd64].into_iter().collect(),
            ..Default::default()
        };
        let h = harness(service, FakeBuildClient::default(), FakeDaemon::default());

        let err = h.orchestrator.build(&request(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, BuildError::Acquisition(_)));
        assert!(err.to_string().contains("no capacity"));
        assert_eq!(h.service.finished().len(), 1);
    }

    #[tokio::test]
    async fn test_canceled_build_reports_user_cancellation() {
        let h = harness(FakeBuildService::default(), FakeBuildClient::default(), FakeDaemon::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.orchestrator.build(&request(), &cancel).await.unwrap_err();

        assert!(err.is_cancellation());
        assert_eq!(h.service.finished(), vec![BuildOutcome::CanceledByUser]);
    }

    fn fast_load_harness(daemon: FakeDaemon) -> (Harness, BuildRequest) {
        let mut store = MemoryContentStore::default();
        let (manifest, _) = sample_image(&mut store);
        let client = FakeBuildClient { manifest: Some(manifest), ..Default::default() };

        let mut h = harness(FakeBuildService::default(), client, daemon);
        h.orchestrator = h.orchestrator.with_content_stores(Arc::new(SharedStore(Arc::new(store))));

        let mut req = request();
        req.load = true;
        req.can_use_local_registry = true;
        (h, req)
    }

    #[tokio::test]
    async fn test_fast_load_pulls_and_tags() {
        let (h, req) = fast_load_harness(FakeDaemon::default());

        h.orchestrator.build(&req, &CancellationToken::new()).await.unwrap();

        assert_eq!(h.client.exports(), vec![ExportStrategy::ContentStore]);
        let calls = h.daemon.calls();
        assert!(calls[0].starts_with("pull localhost:"));
        assert!(calls[1].ends_with(" myapp:latest"));
        assert_eq!(h.service.finished(), vec![BuildOutcome::Success]);
    }

    #[tokio::test]
    async fn test_fast_load_failure_falls_back_to_export() {
        let (h, req) = fast_load_harness(FakeDaemon {
            fail_pull: Some("connection refused".to_string()),
            ..Default::default()
        });

        h.orchestrator.build(&req, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            h.client.exports(),
            vec![ExportStrategy::ContentStore, ExportStrategy::DockerLoad]
        );
        assert_eq!(h.service.finished(), vec![BuildOutcome::Success]);
        assert!(h.reporter.lines.lock().unwrap().iter().any(|l| l.contains("falling back")));
    }

    #[tokio::test]
    async fn test_fast_load_failure_with_stdin_input_does_not_fall_back() {
        let (h, mut req) = fast_load_harness(FakeDaemon {
            fail_pull: Some("connection refused".to_string()),
            ..Default::default()
        });
        req.stdin_input = true;

        let err = h.orchestrator.build(&req, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, BuildError::FastLoad(_)));
        assert_eq!(h.client.exports(), vec![ExportStrategy::ContentStore]);
        assert_eq!(h.service.finished().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_fast_load_does_not_rebuild() {
        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_port = closed.local_addr().unwrap().port();
        drop(closed);
        let (h, req) = fast_load_harness(FakeDaemon {
            desktop: true,
            relay_port: Some(relay_port),
            ..Default::default()
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            trigger.cancel();
        });

        let err = h.orchestrator.build(&req, &cancel).await.unwrap_err();

        assert!(matches!(err, BuildError::Canceled(CancelSource::User)));
        assert_eq!(h.client.exports(), vec![ExportStrategy::ContentStore]);
        assert_eq!(h.service.finished(), vec![BuildOutcome::CanceledByUser]);
        assert!(!h.reporter.lines.lock().unwrap().iter().any(|l| l.contains("falling back")));
    }

    #[tokio::test]
    async fn test_builder_side_cancellation_is_remote() {
        let client = FakeBuildClient::scripted(vec![Err(BuildError::Build(
            "rpc error: code = Canceled desc = context canceled".to_string(),
        ))]);
        let h = harness(FakeBuildService::default(), client, FakeDaemon::default());

        let err = h.orchestrator.build(&request(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, BuildError::Canceled(CancelSource::Remote)));
        assert_eq!(h.client.exports().len(), 1);
        assert_eq!(h.service.finished(), vec![BuildOutcome::CanceledByRemote]);
    }

    #[tokio::test]
    async fn test_failure_prints_troubleshooting_guidance() {
        let client = FakeBuildClient::scripted(vec![Err(BuildError::Build(
            "rpc error: keepalive ping failed to receive ACK".to_string(),
        ))]);
        let h = harness(FakeBuildService::default(), client, FakeDaemon::default());

        h.orchestrator.build(&request(), &CancellationToken::new()).await.unwrap_err();

        let lines = h.reporter.lines.lock().unwrap().clone();
        assert!(lines.iter().any(|l| l.contains("ran out of memory")));
    }

    #[tokio::test]
    async fn test_hosted_registry_round_trip_deletes_temporary_tag() {
        let h = harness(FakeBuildService::default(), FakeBuildClient::default(), FakeDaemon::default());
        let mut req = request();
        req.load = true;
        req.hosted_repository = Some("registry.example.dev/acme/app".to_string());

        h.orchestrator.build(&req, &CancellationToken::new()).await.unwrap();

        let reference = match &h.client.exports()[0] {
            ExportStrategy::HostedRegistry { reference } => reference.clone(),
            other => panic!("unexpected export {:?}", other),
        };
        assert!(reference.starts_with("registry.example.dev/acme/app:tmp-"));
        assert_eq!(h.daemon.calls()[0], format!("pull {}", reference));
        assert_eq!(*h.service.deleted_tags.lock().unwrap(), vec![reference]);
    }
}
