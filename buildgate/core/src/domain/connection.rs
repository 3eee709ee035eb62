// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Connection acquisition for proxied services.
//!
//! Every proxied RPC starts by asking a [`ConnectionProvider`] for the builder
//! connection. [`ConnectionState`] memoizes the first outcome, success or
//! failure, so all service proxies share one live connection per builder and
//! fail identically once acquisition has failed.

use crate::domain::builder::BuilderId;
use crate::domain::platform::Architecture;
use crate::domain::progress::ProgressReporter;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::Status;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquisitionError {
    #[error("Failed to acquire {platform} builder: {message}")]
    Bookkeeping { platform: Architecture, message: String },

    #[error("Builder {builder} ({platform}) advertised an invalid address '{address}': {reason}")]
    InvalidEndpoint {
        platform: Architecture,
        builder: String,
        address: String,
        reason: String,
    },

    #[error(
        "Timed out waiting for {platform} builder {builder} to become ready after {attempts} attempts: {last_error}"
    )]
    NotReady {
        platform: Architecture,
        builder: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Acquisition of the {platform} builder was canceled")]
    Canceled { platform: Architecture },

    #[error("Builder connection unavailable: {0}")]
    Unavailable(String),
}

impl AcquisitionError {
    pub fn platform(&self) -> Option<Architecture> {
        match self {
            AcquisitionError::Bookkeeping { platform, .. }
            | AcquisitionError::InvalidEndpoint { platform, .. }
            | AcquisitionError::NotReady { platform, .. }
            | AcquisitionError::Canceled { platform } => Some(*platform),
            AcquisitionError::Unavailable(_) => None,
        }
    }
}

impl From<AcquisitionError> for Status {
    fn from(err: AcquisitionError) -> Self {
        match err {
            AcquisitionError::Canceled { .. } => Status::cancelled(err.to_string()),
            other => Status::unavailable(other.to_string()),
        }
    }
}

/// Live transport to one ready builder.
#[derive(Debug, Clone)]
pub struct BuilderConnection {
    pub builder_id: BuilderId,
    pub architecture: Architecture,
    pub channel: Channel,
    /// `Bearer <token>` attached to every upstream call
    pub authorization: Option<MetadataValue<Ascii>>,
}

impl BuilderConnection {
    pub fn new(builder_id: BuilderId, architecture: Architecture, channel: Channel, token: &str) -> Self {
        let authorization = if token.is_empty() {
            None
        } else {
            format!("Bearer {}", token).parse().ok()
        };

        Self { builder_id, architecture, channel, authorization }
    }
}

#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn acquire(&self) -> Result<BuilderConnection, AcquisitionError>;
}

/// Produces the connection the first time it is needed.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BuilderConnection, AcquisitionError>;
}

#[async_trait]
impl Connector for BuilderConnection {
    async fn connect(&self) -> Result<BuilderConnection, AcquisitionError> {
        Ok(self.clone())
    }
}

/// Per-builder connection state shared by every service proxy.
pub struct ConnectionState {
    connector: Arc<dyn Connector>,
    transport: OnceCell<Result<BuilderConnection, AcquisitionError>>,
    build_url: Option<String>,
    reporter: Arc<dyn ProgressReporter>,
}

impl ConnectionState {
    pub fn new(
        connector: Arc<dyn Connector>,
        build_url: Option<String>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            connector,
            transport: OnceCell::new(),
            build_url,
            reporter,
        }
    }

    pub fn build_url(&self) -> Option<&str> {
        self.build_url.as_deref()
    }

    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        self.reporter.clone()
    }

    /// The sticky acquisition error, if acquisition already failed.
    pub fn error(&self) -> Option<AcquisitionError> {
        match self.transport.get() {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl ConnectionProvider for ConnectionState {
    async fn acquire(&self) -> Result<BuilderConnection, AcquisitionError> {
        self.transport
            .get_or_init(|| async { self.connector.connect().await })
            .await
            .clone()
    }
}
