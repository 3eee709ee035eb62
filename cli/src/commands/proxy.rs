// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Standalone proxy command
//!
//! Serves one build proxy in front of a fixed BuildKit daemon. There is no
//! bookkeeping service: the daemon address is the builder, and acquisition
//! succeeds immediately.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use buildgate_core::application::lifecycle::{BuilderDialer, GrpcDialer};
use buildgate_core::domain::builder::{BuilderEndpoint, BuilderId};
use buildgate_core::domain::connection::ConnectionState;
use buildgate_core::domain::platform::Architecture;
use buildgate_core::domain::progress::StderrReporter;
use buildgate_core::domain::GateConfigManifest;
use buildgate_core::infrastructure::poll_until;
use buildgate_core::presentation::{ProxyContext, ProxyServer, ShutdownSignal};

#[derive(Args)]
pub struct ProxyArgs {
    /// BuildKit daemon address (e.g. http://127.0.0.1:1234 or https://builder.example.dev)
    #[arg(long, value_name = "URL")]
    pub upstream: String,

    /// Platform served by the daemon (e.g. linux/amd64, arm64)
    #[arg(long, default_value = "linux/amd64")]
    pub platform: String,

    /// Listen address (default: the configured bind address on an ephemeral port)
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// Bearer token presented to the daemon
    #[arg(long, env = "BUILDGATE_BUILDER_TOKEN", default_value = "", hide_env_values = true)]
    pub token: String,

    /// Poll the daemon's health service before accepting calls
    #[arg(long)]
    pub wait_ready: bool,
}

pub async fn run(args: ProxyArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = GateConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    let spec = config.spec;

    let architecture = Architecture::from_platform(&args.platform)?;
    let listen = match args.listen {
        Some(addr) => addr,
        None => SocketAddr::new(
            spec.proxy
                .bind_address
                .parse()
                .context("Invalid proxy bind address")?,
            0,
        ),
    };

    let endpoint = BuilderEndpoint {
        builder_id: BuilderId::new(format!("standalone-{}", architecture)),
        address: args.upstream.clone(),
        token: args.token,
        content_address: None,
    };
    let dialer = GrpcDialer;
    let connection = dialer.dial(architecture, &endpoint)?;

    let cancel = CancellationToken::new();
    if args.wait_ready {
        let probe = dialer.probe(&connection);
        let attempts = poll_until(probe.as_ref(), spec.builder.readiness(), &cancel)
            .await
            .with_context(|| format!("Daemon at {} did not become ready", args.upstream))?;
        info!(attempts, "Daemon ready");
    }

    let reporter = Arc::new(StderrReporter::new());
    let state = Arc::new(ConnectionState::new(Arc::new(connection), None, reporter.clone()));
    let stop = cancel.child_token();
    let ctx = ProxyContext::new(
        architecture,
        state,
        Arc::new(ShutdownSignal::new(
            stop.clone(),
            Duration::from_millis(spec.proxy.shutdown_grace_ms),
        )),
        cancel.child_token(),
    );

    let server = ProxyServer::start(ctx, listen, stop.clone()).await?;
    println!(
        "{} {} -> {}",
        "✓ Build proxy listening:".green(),
        server.endpoint().bold(),
        args.upstream
    );
    println!("  Point BUILDKIT_HOST at this address. Press Ctrl-C to stop.");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Interrupted, stopping build proxy");
        }
        _ = stop.cancelled() => {
            info!("Shutdown requested by client");
        }
    }

    server.shutdown().await?;
    cancel.cancel();
    println!(
        "{} ({} status messages forwarded)",
        "✓ Build proxy stopped".green(),
        reporter.status_messages()
    );
    Ok(())
}
