// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Build requests, results and the error taxonomy.
//!
//! `BuildError` is what the orchestrator surfaces. Its classification methods
//! drive the retry policy ([`BuildError::is_transient`]), the fast-load
//! fallback ([`BuildError::is_cancellation`]) and the outcome reported to the
//! bookkeeping service ([`BuildOutcome::from_result`]).

use crate::domain::builder::BuilderId;
use crate::domain::connection::AcquisitionError;
use crate::domain::content::ContentDescriptor;
use crate::domain::platform::{Architecture, PlatformError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error substrings known to come from a builder or network hiccup rather than
/// from the build definition itself. Only these trigger whole-build retries.
pub const TRANSIENT_ERROR_PATTERNS: &[&str] = &[
    "code = Unavailable",
    "status: Unavailable",
    "transport is closing",
    "connection reset by peer",
    "error reading from server: EOF",
    "no active session",
    "failed to dial gRPC",
    "closing transport due to",
    "h2 protocol error",
    "broken pipe",
];

/// Cancellation reported by the builder or its session while the local build
/// was still live.
const REMOTE_CANCEL_PATTERNS: &[&str] = &[
    "code = Canceled",
    "status: Cancelled",
    "status: 'Cancelled'",
    "context canceled",
];

const KEEPALIVE_PATTERNS: &[&str] = &[
    "keepalive ping",
    "exit code: 137",
    "signal: killed",
    "OOMKilled",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub build_id: String,
    pub token: String,
    /// Link to the build summary page, printed once the solve completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_url: Option<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
    /// Whether the platforms came from the user rather than from defaults
    #[serde(default)]
    pub explicit_platforms: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Load the result into the local daemon
    #[serde(default)]
    pub load: bool,
    /// Capability returned at build creation: the builder can expose its content store for fast load
    #[serde(default)]
    pub can_use_local_registry: bool,
    /// Build context or Dockerfile is read from stdin and cannot be replayed
    #[serde(default)]
    pub stdin_input: bool,
    /// Repository for temporary tags when the image cannot be fast loaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted_repository: Option<String>,
}

/// How the external build client is asked to export the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportStrategy {
    /// Keep the image in the builder's content store only (fast load follows)
    ContentStore,
    /// Push to a temporary tag on the hosted registry (pull follows)
    HostedRegistry { reference: String },
    /// Conventional export of a docker tarball streamed into the local daemon
    DockerLoad,
    /// No local retrieval requested
    None,
}

/// A proxy endpoint the external build client should use as one builder node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyNode {
    pub architecture: Architecture,
    pub endpoint: String,
}

/// The external build client: drives BuildKit's Control API through the proxies.
#[async_trait]
pub trait BuildClient: Send + Sync {
    async fn build(
        &self,
        nodes: &[ProxyNode],
        export: &ExportStrategy,
        cancel: &CancellationToken,
    ) -> Result<Vec<BuildResult>, BuildError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestConfig {
    pub manifest: ContentDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// Per-builder node response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub architecture: Architecture,
    pub builder_id: BuilderId,
    /// Solve response exporter metadata (`containerimage.digest`, ...)
    #[serde(default)]
    pub exporter_response: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation_index: Option<ContentDescriptor>,
    #[serde(default)]
    pub manifests: Vec<ManifestConfig>,
}

impl BuildResult {
    /// The manifest matching an architecture, falling back to the first one.
    pub fn manifest_for(&self, architecture: Architecture) -> Option<&ContentDescriptor> {
        self.manifests
            .iter()
            .map(|m| &m.manifest)
            .find(|m| {
                m.platform
                    .as_ref()
                    .map(|p| Architecture::from_platform(&p.architecture) == Ok(architecture))
                    .unwrap_or(false)
            })
            .or_else(|| self.manifests.first().map(|m| &m.manifest))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelSource {
    User,
    Remote,
}

impl fmt::Display for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelSource::User => f.write_str("user"),
            CancelSource::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("Proxy transport failure: {0}")]
    Transport(String),

    #[error("{0}")]
    Build(String),

    #[error("Fast load failed: {0}")]
    FastLoad(String),

    #[error("Failed to load image into the local Docker daemon: {0}")]
    Load(String),

    #[error("Build canceled by {0}")]
    Canceled(CancelSource),

    #[error("Build failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<BuildError> },
}

impl BuildError {
    /// Matches the explicit allow-list of transient failures.
    pub fn is_transient(&self) -> bool {
        match self {
            BuildError::Build(message) | BuildError::Transport(message) => TRANSIENT_ERROR_PATTERNS
                .iter()
                .any(|pattern| message.contains(pattern)),
            _ => false,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        match self {
            BuildError::Canceled(_) => true,
            BuildError::Acquisition(AcquisitionError::Canceled { .. }) => true,
            BuildError::RetriesExhausted { last, .. } => last.is_cancellation(),
            _ => false,
        }
    }

    /// Whether the failure is a cancellation that came from the remote side.
    pub fn is_remote_cancellation(&self) -> bool {
        match self {
            BuildError::Canceled(source) => *source == CancelSource::Remote,
            BuildError::Build(message) | BuildError::Transport(message) => REMOTE_CANCEL_PATTERNS
                .iter()
                .any(|pattern| message.contains(pattern)),
            BuildError::RetriesExhausted { last, .. } => last.is_remote_cancellation(),
            _ => false,
        }
    }

    /// Message shown to the user, with troubleshooting guidance where a known
    /// failure mode applies.
    pub fn user_message(&self) -> String {
        let message = self.to_string();
        if KEEPALIVE_PATTERNS.iter().any(|p| message.contains(p)) {
            format!(
                "{}\n\n\
                 The builder stopped responding. This usually means it ran out of memory\n\
                 or was terminated while the build was running.\n\n\
                 Try:\n\
                 - Reducing build parallelism or memory-hungry steps\n\
                 - Using a larger builder size\n\
                 - Re-running the build; the cache from the previous attempt is kept",
                message
            )
        } else {
            message
        }
    }
}

/// Terminal outcome reported to the bookkeeping service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum BuildOutcome {
    Success,
    CanceledByUser,
    CanceledByRemote,
    Error(String),
}

impl BuildOutcome {
    pub fn from_result<T>(result: &Result<T, BuildError>) -> Self {
        match result {
            Ok(_) => BuildOutcome::Success,
            Err(e) => Self::from_error(e),
        }
    }

    pub fn from_error(err: &BuildError) -> Self {
        match err {
            BuildError::Canceled(CancelSource::Remote) => BuildOutcome::CanceledByRemote,
            e if e.is_cancellation() => BuildOutcome::CanceledByUser,
            BuildError::RetriesExhausted { last, .. } => Self::from_error(last),
            other => BuildOutcome::Error(other.to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BuildOutcome::Success => "success",
            BuildOutcome::CanceledByUser => "canceled_by_user",
            BuildOutcome::CanceledByRemote => "canceled_by_remote",
            BuildOutcome::Error(_) => "error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            BuildOutcome::Error(message) => message,
            _ => "",
        }
    }
}

/// Timing of one completed BuildKit vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTiming {
    pub digest: String,
    pub name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::content::DescriptorPlatform;

    #[test]
    fn test_transient_classification() {
        assert!(BuildError::Build(
            "failed to receive status: rpc error: code = Unavailable desc = closing".to_string()
        )
        .is_transient());
        assert!(BuildError::Transport("read tcp: connection reset by peer".to_string()).is_transient());
        assert!(!BuildError::Build("failed to solve: process \"/bin/sh -c make\" did not complete".to_string())
            .is_transient());
        assert!(!BuildError::FastLoad("code = Unavailable".to_string()).is_transient());
        assert!(!BuildError::Canceled(CancelSource::User).is_transient());
    }

    #[test]
    fn test_outcome_classification() {
        let ok: Result<(), BuildError> = Ok(());
        assert_eq!(BuildOutcome::from_result(&ok), BuildOutcome::Success);

        let user: Result<(), BuildError> = Err(BuildError::Canceled(CancelSource::User));
        assert_eq!(BuildOutcome::from_result(&user), BuildOutcome::CanceledByUser);

        let remote: Result<(), BuildError> = Err(BuildError::Canceled(CancelSource::Remote));
        assert_eq!(BuildOutcome::from_result(&remote), BuildOutcome::CanceledByRemote);

        let acquisition: Result<(), BuildError> = Err(BuildError::Acquisition(AcquisitionError::Canceled {
            platform: Architecture::Amd64,
        }));
        assert_eq!(BuildOutcome::from_result(&acquisition), BuildOutcome::CanceledByUser);

        let failed: Result<(), BuildError> = Err(BuildError::Build("boom".to_string()));
        let outcome = BuildOutcome::from_result(&failed);
        assert_eq!(outcome.kind(), "error");
        assert_eq!(outcome.message(), "boom");
    }

    #[test]
    fn test_remote_cancellation_classification() {
        assert!(BuildError::Build("rpc error: code = Canceled desc = context canceled".to_string())
            .is_remote_cancellation());
        assert!(BuildError::Canceled(CancelSource::Remote).is_remote_cancellation());
        assert!(!BuildError::Canceled(CancelSource::User).is_remote_cancellation());
        assert!(!BuildError::Build("failed to solve: exit code 1".to_string()).is_remote_cancellation());
    }

    #[test]
    fn test_keepalive_failures_carry_guidance() {
        let err = BuildError::Build("rpc error: keepalive ping failed to receive ACK".to_string());
        assert!(err.user_message().contains("ran out of memory"));

        let plain = BuildError::Build("COPY failed".to_string());
        assert_eq!(plain.user_message(), "COPY failed");
    }

    #[test]
    fn test_manifest_for_prefers_matching_platform() {
        let mut amd = ContentDescriptor::new("m", "sha256:aa", 1);
        amd.platform = Some(DescriptorPlatform {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            variant: None,
        });
        let mut arm = ContentDescriptor::new("m", "sha256:bb", 1);
        arm.platform = Some(DescriptorPlatform {
            architecture: "arm64".to_string(),
            os: "linux".to_string(),
            variant: None,
        });

        let result = BuildResult {
            architecture: Architecture::Amd64,
            builder_id: BuilderId::new("b"),
            exporter_response: HashMap::new(),
            attestation_index: None,
            manifests: vec![
                ManifestConfig { manifest: amd, config: None },
                ManifestConfig { manifest: arm, config: None },
            ],
        };

        assert_eq!(result.manifest_for(Architecture::Arm64).unwrap().digest, "sha256:bb");
        assert_eq!(result.manifest_for(Architecture::Amd64).unwrap().digest, "sha256:aa");
    }
}
