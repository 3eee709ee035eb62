// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Control-service interceptions.

use crate::application::telemetry::TimingsSink;
use crate::domain::platform::worker_platforms;
use crate::domain::progress::ProgressReporter;
use crate::infrastructure::grpc::messages::{ListWorkersResponse, Platform, StatusResponse, WorkerRecord};
use crate::infrastructure::grpc::pump::ClientSink;
use crate::infrastructure::grpc::RawCodec;
use crate::presentation::proxy::service::{forward_server_streaming, forward_unary, Interception};
use crate::presentation::proxy::ProxyContext;
use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::codegen::{http, Body, StdError};
use tonic::metadata::MetadataMap;
use tonic::server::Grpc;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

pub(crate) async fn intercept<B>(
    interception: Interception,
    ctx: Arc<ProxyContext>,
    path: PathAndQuery,
    mut grpc: Grpc<RawCodec>,
    req: http::Request<B>,
) -> http::Response<tonic::body::Body>
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    match interception {
        Interception::Solve => {
            let service =
                tower::service_fn(move |request: Request<Bytes>| solve(ctx.clone(), path.clone(), request));
            grpc.unary(service, req).await
        }
        Interception::Status => {
            let service = tower::service_fn(move |request: Request<Bytes>| {
                forward_server_streaming(ctx.clone(), path.clone(), request, StatusTee::wrap)
            });
            grpc.server_streaming(service, req).await
        }
        Interception::ListWorkers => {
            let service = tower::service_fn(move |_: Request<Bytes>| {
                let response = list_workers(ctx.architecture.as_str());
                async move { Ok::<_, Status>(Response::new(response)) }
            });
            grpc.unary(service, req).await
        }
        Interception::ShutdownEmpty | Interception::ShutdownUnimplemented => {
            let service = tower::service_fn(move |_: Request<Bytes>| {
                let method = path.path().to_string();
                debug!(method = %method, "Intercepted housekeeping call, scheduling proxy shutdown");
                ctx.shutdown.schedule();
                async move {
                    match interception {
                        Interception::ShutdownEmpty => Ok(Response::new(Bytes::new())),
                        _ => Err(Status::unimplemented(format!("{} is not served by the build proxy", method))),
                    }
                }
            });
            grpc.unary(service, req).await
        }
    }
}

async fn solve(ctx: Arc<ProxyContext>, path: PathAndQuery, request: Request<Bytes>) -> Result<Response<Bytes>, Status> {
    let result = forward_unary(ctx.clone(), path, request).await;

    if let Some(url) = ctx.connection.build_url() {
        if !ctx.summary_printed.swap(true, Ordering::SeqCst) {
            ctx.connection.reporter().print(&format!("View build summary: {}", url));
        }
    }
    result
}

/// Encoded `ListWorkersResponse` with one record per advertised platform.
pub fn list_workers(architecture: &str) -> Bytes {
    let record = worker_platforms(architecture)
        .iter()
        .enumerate()
        .map(|(i, platform)| WorkerRecord {
            id: format!("buildgate-{}-{}", architecture, i),
            labels: Default::default(),
            platforms: vec![Platform::from(platform)],
        })
        .collect();

    Bytes::from(ListWorkersResponse { record }.encode_to_vec())
}

/// Copies every status message to the reporter and the timing recorder
/// before it reaches the client.
pub(crate) struct StatusTee<C> {
    inner: C,
    reporter: Arc<dyn ProgressReporter>,
    timings: Option<TimingsSink>,
}

impl<C> StatusTee<C> {
    pub(crate) fn wrap(inner: C, ctx: &Arc<ProxyContext>) -> Self {
        Self {
            inner,
            reporter: ctx.connection.reporter(),
            timings: ctx.timings.clone(),
        }
    }
}

#[async_trait]
impl<C: ClientSink<Bytes>> ClientSink<Bytes> for StatusTee<C> {
    async fn send_headers(&mut self, headers: MetadataMap) -> Result<(), Status> {
        self.inner.send_headers(headers).await
    }

    async fn send(&mut self, message: Bytes) -> Result<(), Status> {
        self.reporter.publish_status(&message);
        if let Some(timings) = &self.timings {
            match StatusResponse::decode(message.clone()) {
                Ok(status) => timings.record(status.completed_steps()),
                Err(e) => info!(error = %e, "Skipping undecodable status message"),
            }
        }
        self.inner.send(message).await
    }

    async fn send_trailers(&mut self, trailers: MetadataMap) -> Result<(), Status> {
        self.inner.send_trailers(trailers).await
    }

    async fn fail(&mut self, status: Status) {
        self.inner.fail(status).await
    }
}
