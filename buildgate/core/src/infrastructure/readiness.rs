// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bounded readiness polling.
//!
//! Used for booting builders (gRPC health), the local content registry and the
//! desktop relay (HTTP). A target is probed at most `attempts` times,
//! `interval` apart; running out of attempts is an error.

use crate::domain::config::ReadinessPolicy;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadinessError {
    #[error("{target} not ready after {attempts} attempts: {last_error}")]
    Exhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },
    #[error("Waiting for {target} was canceled")]
    Canceled { target: String },
}

/// One liveness check against a target.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    fn target(&self) -> String;

    async fn probe(&self) -> Result<(), String>;
}

/// Probe until the target answers, returning the number of attempts used.
pub async fn poll_until(
    probe: &dyn LivenessProbe,
    policy: ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<u32, ReadinessError> {
    let target = probe.target();
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=policy.attempts {
        if cancel.is_cancelled() {
            return Err(ReadinessError::Canceled { target });
        }

        match probe.probe().await {
            Ok(()) => {
                info!(endpoint = %target, attempt, "Ready");
                return Ok(attempt);
            }
            Err(e) => {
                debug!(endpoint = %target, attempt, error = %e, "Not ready yet");
                last_error = e;
            }
        }

        if attempt < policy.attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ReadinessError::Canceled { target }),
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }
    }

    Err(ReadinessError::Exhausted {
        target,
        attempts: policy.attempts,
        last_error,
    })
}

/// Plain HTTP GET readiness check; any 2xx answer counts.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    fn target(&self) -> String {
        self.url.clone()
    }

    async fn probe(&self) -> Result<(), String> {
        let response = self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status()))
        }
    }
}
