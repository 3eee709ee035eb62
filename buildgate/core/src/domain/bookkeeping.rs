// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Build bookkeeping collaborator.
//!
//! Owned by the hosted API client outside this crate. The core only needs to
//! acquire builders, report the terminal outcome, push step timings and clean
//! up temporary registry tags.

use crate::domain::build::{BuildOutcome, StepTiming};
use crate::domain::builder::BuilderEndpoint;
use crate::domain::connection::AcquisitionError;
use crate::domain::platform::Architecture;
use async_trait::async_trait;

#[async_trait]
pub trait BuildService: Send + Sync {
    /// Reserve an ephemeral builder for one architecture.
    async fn acquire(
        &self,
        build_id: &str,
        token: &str,
        platform: Architecture,
    ) -> Result<BuilderEndpoint, AcquisitionError>;

    /// Record the terminal outcome of the build.
    async fn finish(&self, build_id: &str, token: &str, outcome: &BuildOutcome) -> anyhow::Result<()>;

    async fn report_timings(&self, build_id: &str, token: &str, steps: &[StepTiming]) -> anyhow::Result<()>;

    /// Delete a temporary tag pushed to the hosted registry.
    async fn delete_temporary_tag(&self, build_id: &str, token: &str, reference: &str) -> anyhow::Result<()>;
}
