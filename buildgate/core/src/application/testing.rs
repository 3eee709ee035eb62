// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared fakes for application-layer tests.

use crate::application::lifecycle::BuilderDialer;
use crate::domain::build::{BuildOutcome, StepTiming};
use crate::domain::builder::{BuilderEndpoint, BuilderId};
use crate::domain::connection::{AcquisitionError, BuilderConnection};
use crate::domain::platform::Architecture;
use crate::domain::BuildService;
use crate::infrastructure::readiness::LivenessProbe;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use tonic::transport::Endpoint;

#[derive(Default)]
pub struct FakeBuildService {
    pub reject: HashSet<Architecture>,
    pub acquired: Mutex<Vec<Architecture>>,
    pub finished: Mutex<Vec<BuildOutcome>>,
    pub timings: Mutex<Vec<StepTiming>>,
    pub deleted_tags: Mutex<Vec<String>>,
    pub fail_timings: bool,
}

impl FakeBuildService {
    pub fn finished(&self) -> Vec<BuildOutcome> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildService for FakeBuildService {
    async fn acquire(
        &self,
        build_id: &str,
        _token: &str,
        platform: Architecture,
    ) -> Result<BuilderEndpoint, AcquisitionError> {
        self.acquired.lock().unwrap().push(platform);
        if self.reject.contains(&platform) {
            return Err(AcquisitionError::Bookkeeping {
                platform,
                message: "no capacity".to_string(),
            });
        }
        Ok(BuilderEndpoint {
            builder_id: BuilderId::new(format!("{}-{}", build_id, platform)),
            address: format!("http://{}.builders.test:443", platform),
            token: "builder-token".to_string(),
            content_address: None,
        })
    }

    async fn finish(&self, _build_id: &str, _token: &str, outcome: &BuildOutcome) -> anyhow::Result<()> {
        self.finished.lock().unwrap().push(outcome.clone());
        Ok(())
    }

    async fn report_timings(&self, _build_id: &str, _token: &str, steps: &[StepTiming]) -> anyhow::Result<()> {
        if self.fail_timings {
            anyhow::bail!("telemetry endpoint unavailable");
        }
        self.timings.lock().unwrap().extend_from_slice(steps);
        Ok(())
    }

    async fn delete_temporary_tag(&self, _build_id: &str, _token: &str, reference: &str) -> anyhow::Result<()> {
        self.deleted_tags.lock().unwrap().push(reference.to_string());
        Ok(())
    }
}

/// Dials lazily (never touches the network) and reports the listed
/// architectures as never becoming healthy.
#[derive(Default)]
pub struct FakeDialer {
    pub unhealthy: HashSet<Architecture>,
}

struct StaticProbe {
    target: String,
    healthy: bool,
}

#[async_trait]
impl LivenessProbe for StaticProbe {
    fn target(&self) -> String {
        self.target.clone()
    }

    async fn probe(&self) -> Result<(), String> {
        if self.healthy {
            Ok(())
        } else {
            Err("connection refused".to_string())
        }
    }
}

impl BuilderDialer for FakeDialer {
    fn dial(
        &self,
        architecture: Architecture,
        endpoint: &BuilderEndpoint,
    ) -> Result<BuilderConnection, AcquisitionError> {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        Ok(BuilderConnection::new(
            endpoint.builder_id.clone(),
            architecture,
            channel,
            &endpoint.token,
        ))
    }

    fn probe(&self, connection: &BuilderConnection) -> Box<dyn LivenessProbe> {
        Box::new(StaticProbe {
            target: format!("builder {}", connection.builder_id),
            healthy: !self.unhealthy.contains(&connection.architecture),
        })
    }
}
