// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # BuildKit Proxy Server
//!
//! Re-serves the BuildKit control plane of one remote builder on a local TCP
//! listener. The local build client connects to [`ProxyServer::endpoint`] as
//! if it were a local daemon; every call is forwarded to the builder over the
//! shared [`ConnectionState`], except for the few `Control` methods handled in
//! [`control`].
//!
//! Housekeeping calls the client makes after a build (`DiskUsage`, `Info`,
//! build-history methods) schedule shutdown of the proxy through a
//! [`ShutdownTrigger`] instead of keeping the ephemeral builder busy.

pub mod control;
pub mod service;

use crate::application::telemetry::TimingsSink;
use crate::domain::connection::ConnectionState;
use crate::domain::platform::Architecture;
use service::{
    Auth, Content, Control, FileSend, FileSync, GrpcProxy, Health, Leases, LlbBridge, Secrets, SshForward,
    TraceExport, Upload,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to bind build proxy on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Build proxy server failed: {0}")]
    Serve(String),
}

/// Asynchronous, idempotent proxy shutdown.
pub trait ShutdownTrigger: Send + Sync {
    fn schedule(&self);
}

/// Cancels `token` once `grace` has passed after the first `schedule` call.
pub struct ShutdownSignal {
    token: CancellationToken,
    grace: Duration,
    scheduled: AtomicBool,
}

impl ShutdownSignal {
    pub fn new(token: CancellationToken, grace: Duration) -> Self {
        Self { token, grace, scheduled: AtomicBool::new(false) }
    }
}

impl ShutdownTrigger for ShutdownSignal {
    fn schedule(&self) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = self.token.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            debug!("Shutting down build proxy after housekeeping call");
            token.cancel();
        });
    }
}

/// Everything a proxied call needs besides its own request.
pub struct ProxyContext {
    pub architecture: Architecture,
    pub connection: Arc<ConnectionState>,
    pub shutdown: Arc<dyn ShutdownTrigger>,
    pub timings: Option<TimingsSink>,
    /// Shared by all proxies of one build so the summary link prints once.
    pub summary_printed: Arc<AtomicBool>,
    calls: CancellationToken,
}

impl ProxyContext {
    pub fn new(
        architecture: Architecture,
        connection: Arc<ConnectionState>,
        shutdown: Arc<dyn ShutdownTrigger>,
        calls: CancellationToken,
    ) -> Self {
        Self {
            architecture,
            connection,
            shutdown,
            timings: None,
            summary_printed: Arc::new(AtomicBool::new(false)),
            calls,
        }
    }

    pub fn with_timings(mut self, timings: TimingsSink) -> Self {
        self.timings = Some(timings);
        self
    }

    pub fn with_summary_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.summary_printed = flag;
        self
    }

    /// Token for one upstream call; canceled when the proxy stops.
    pub fn call_token(&self) -> CancellationToken {
        self.calls.child_token()
    }
}

pub struct ProxyServer {
    addr: SocketAddr,
    stop: CancellationToken,
    calls: CancellationToken,
    task: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl ProxyServer {
    /// Bind `bind` and serve every proxied service until `stop` is canceled.
    pub async fn start(ctx: ProxyContext, bind: SocketAddr, stop: CancellationToken) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| ProxyError::Bind { addr: bind, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind { addr: bind, source })?;

        let calls = ctx.calls.clone();
        let architecture = ctx.architecture;
        let ctx = Arc::new(ctx);

        let router = Server::builder()
            .add_service(GrpcProxy::<Control>::new(ctx.clone()))
            .add_service(GrpcProxy::<LlbBridge>::new(ctx.clone()))
            .add_service(GrpcProxy::<Content>::new(ctx.clone()))
            .add_service(GrpcProxy::<Leases>::new(ctx.clone()))
            .add_service(GrpcProxy::<Health>::new(ctx.clone()))
            .add_service(GrpcProxy::<FileSync>::new(ctx.clone()))
            .add_service(GrpcProxy::<FileSend>::new(ctx.clone()))
            .add_service(GrpcProxy::<Auth>::new(ctx.clone()))
            .add_service(GrpcProxy::<Upload>::new(ctx.clone()))
            .add_service(GrpcProxy::<SshForward>::new(ctx.clone()))
            .add_service(GrpcProxy::<Secrets>::new(ctx.clone()))
            .add_service(GrpcProxy::<TraceExport>::new(ctx));

        let shutdown = stop.clone();
        let call_tokens = calls.clone();
        let task = tokio::spawn(async move {
            let result = router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    shutdown.cancelled().await;
                    // In-flight sessions would otherwise hold graceful shutdown open.
                    call_tokens.cancel();
                })
                .await;
            debug!("Build proxy stopped");
            result
        });

        info!(platform = %architecture, addr = %addr, "Build proxy listening");
        Ok(Self { addr, stop, calls, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address handed to the build client.
    pub fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub async fn shutdown(self) -> Result<(), ProxyError> {
        self.stop.cancel();
        self.calls.cancel();
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProxyError::Serve(e.to_string())),
            Err(e) => {
                warn!(error = %e, "Build proxy task failed");
                Err(ProxyError::Serve(e.to_string()))
            }
        }
    }
}
