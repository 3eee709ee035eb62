// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The few protobuf messages the proxy builds or inspects itself.
//!
//! Field numbers match the upstream BuildKit, containerd and gRPC health
//! definitions. Only the fields that are read or written here are declared;
//! unknown fields are skipped on decode.

use crate::domain::build::StepTiming;
use crate::domain::platform::WorkerPlatform;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// `pb.Platform`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Platform {
    #[prost(string, tag = "1")]
    pub architecture: String,
    #[prost(string, tag = "2")]
    pub os: String,
    #[prost(string, tag = "3")]
    pub variant: String,
}

impl From<&WorkerPlatform> for Platform {
    fn from(platform: &WorkerPlatform) -> Self {
        Self {
            architecture: platform.architecture.to_string(),
            os: platform.os.to_string(),
            variant: platform.variant.unwrap_or_default().to_string(),
        }
    }
}

/// `moby.buildkit.v1.types.WorkerRecord`
#[derive(Clone, PartialEq, prost::Message)]
pub struct WorkerRecord {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(map = "string, string", tag = "2")]
    pub labels: HashMap<String, String>,
    #[prost(message, repeated, tag = "3")]
    pub platforms: Vec<Platform>,
}

/// `moby.buildkit.v1.ListWorkersResponse`
#[derive(Clone, PartialEq, prost::Message)]
pub struct ListWorkersResponse {
    #[prost(message, repeated, tag = "1")]
    pub record: Vec<WorkerRecord>,
}

/// `grpc.health.v1.HealthCheckRequest`
#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthCheckRequest {
    #[prost(string, tag = "1")]
    pub service: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ServingStatus {
    Unknown = 0,
    Serving = 1,
    NotServing = 2,
    ServiceUnknown = 3,
}

/// `grpc.health.v1.HealthCheckResponse`
#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthCheckResponse {
    #[prost(enumeration = "ServingStatus", tag = "1")]
    pub status: i32,
}

/// `containerd.services.content.v1.ReadContentRequest`
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReadContentRequest {
    #[prost(string, tag = "1")]
    pub digest: String,
    #[prost(int64, tag = "2")]
    pub offset: i64,
    /// Zero reads to the end of the blob
    #[prost(int64, tag = "3")]
    pub size: i64,
}

/// `containerd.services.content.v1.ReadContentResponse`
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReadContentResponse {
    #[prost(int64, tag = "1")]
    pub offset: i64,
    #[prost(bytes = "bytes", tag = "2")]
    pub data: bytes::Bytes,
}

/// `moby.buildkit.v1.Vertex`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Vertex {
    #[prost(string, tag = "1")]
    pub digest: String,
    #[prost(string, repeated, tag = "2")]
    pub inputs: Vec<String>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(bool, tag = "4")]
    pub cached: bool,
    #[prost(message, optional, tag = "5")]
    pub started: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "6")]
    pub completed: Option<prost_types::Timestamp>,
    #[prost(string, tag = "7")]
    pub error: String,
}

/// `moby.buildkit.v1.StatusResponse`, vertexes only.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StatusResponse {
    #[prost(message, repeated, tag = "1")]
    pub vertexes: Vec<Vertex>,
}

impl StatusResponse {
    /// Completed vertexes as step timings.
    pub fn completed_steps(&self) -> Vec<StepTiming> {
        self.vertexes
            .iter()
            .filter_map(|vertex| {
                let completed_at = vertex.completed.as_ref().and_then(to_datetime)?;
                Some(StepTiming {
                    digest: vertex.digest.clone(),
                    name: vertex.name.clone(),
                    started_at: vertex.started.as_ref().and_then(to_datetime),
                    completed_at,
                    cached: vertex.cached,
                    error: (!vertex.error.is_empty()).then(|| vertex.error.clone()),
                })
            })
            .collect()
    }
}

fn to_datetime(ts: &prost_types::Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)
}
