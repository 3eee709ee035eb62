// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::connection::BuilderConnection;
use crate::infrastructure::grpc::messages::{HealthCheckRequest, HealthCheckResponse, ServingStatus};
use crate::infrastructure::grpc::transport::{method_path, unary};
use crate::infrastructure::readiness::LivenessProbe;
use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use std::time::Duration;
use tonic::metadata::MetadataMap;

const HEALTH_CHECK: &str = "/grpc.health.v1.Health/Check";

/// Builder liveness via the standard gRPC health service.
pub struct GrpcHealthProbe {
    connection: BuilderConnection,
    timeout: Duration,
}

impl GrpcHealthProbe {
    pub fn new(connection: BuilderConnection) -> Self {
        Self { connection, timeout: Duration::from_secs(5) }
    }
}

#[async_trait]
impl LivenessProbe for GrpcHealthProbe {
    fn target(&self) -> String {
        format!("builder {}", self.connection.builder_id)
    }

    async fn probe(&self) -> Result<(), String> {
        let path = method_path(HEALTH_CHECK).map_err(|s| s.message().to_string())?;
        let request = Bytes::from(HealthCheckRequest::default().encode_to_vec());

        let call = unary(&self.connection, path, MetadataMap::new(), request);
        let response = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| format!("health check timed out after {:?}", self.timeout))?
            .map_err(|status| format!("{:?}: {}", status.code(), status.message()))?;

        let health = HealthCheckResponse::decode(response.into_inner())
            .map_err(|e| format!("malformed health response: {}", e))?;

        match ServingStatus::try_from(health.status) {
            Ok(ServingStatus::Serving) => Ok(()),
            Ok(other) => Err(format!("builder reports {:?}", other)),
            Err(_) => Err(format!("unknown serving status {}", health.status)),
        }
    }
}
