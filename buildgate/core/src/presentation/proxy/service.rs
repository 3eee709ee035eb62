// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Service Proxy Set
//!
//! One generic [`GrpcProxy`] forwards every service. Each proxied service is a
//! marker type carrying its fully-qualified name and a method table mapping
//! method names to a call shape or an interception. Unlisted methods are
//! forwarded as full-duplex streams, which is wire-compatible with every
//! call shape.

use crate::domain::connection::ConnectionProvider;
use crate::infrastructure::grpc::pump::{forward_upstream_to_client, pump, ClientSink};
use crate::infrastructure::grpc::transport::{
    method_path, open_server_streaming, open_streaming, unary, ClientStream, ResponseSink, ResponseStream,
};
use crate::infrastructure::grpc::RawCodec;
use crate::presentation::proxy::control;
use crate::presentation::proxy::ProxyContext;
use bytes::Bytes;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::codegen::{http, Body, BoxFuture, Context, Poll, Service, StdError};
use tonic::server::{Grpc, NamedService};
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    Unary,
    ServerStreaming,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interception {
    /// Forward, then print the build summary link once
    Solve,
    /// Forward, teeing every status message to the reporter
    Status,
    /// Answer locally with the builder's platforms
    ListWorkers,
    /// Schedule shutdown and answer with an empty message
    ShutdownEmpty,
    /// Schedule shutdown and answer `Unimplemented`
    ShutdownUnimplemented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodRoute {
    Forward(CallShape),
    Intercept(Interception),
}

pub trait ProxiedService: Send + Sync + 'static {
    const NAME: &'static str;

    fn route(method: &str) -> MethodRoute;
}

use CallShape::{ServerStreaming, Unary};
use MethodRoute::{Forward, Intercept};

const DUPLEX: MethodRoute = Forward(CallShape::Streaming);

pub struct Control;

impl ProxiedService for Control {
    const NAME: &'static str = "moby.buildkit.v1.Control";

    fn route(method: &str) -> MethodRoute {
        match method {
            "Solve" => Intercept(Interception::Solve),
            "Status" => Intercept(Interception::Status),
            "ListWorkers" => Intercept(Interception::ListWorkers),
            "DiskUsage" | "UpdateBuildHistory" => Intercept(Interception::ShutdownEmpty),
            "Info" | "ListenBuildHistory" => Intercept(Interception::ShutdownUnimplemented),
            "Prune" => Forward(ServerStreaming),
            _ => DUPLEX,
        }
    }
}

pub struct LlbBridge;

impl ProxiedService for LlbBridge {
    const NAME: &'static str = "moby.buildkit.v1.frontend.LLBBridge";

    fn route(method: &str) -> MethodRoute {
        match method {
            "ResolveImageConfig" | "ResolveSourceMeta" | "Solve" | "ReadFile" | "ReadDir" | "StatFile"
            | "Evaluate" | "Ping" | "Return" | "Inputs" | "Warn" | "NewContainer" | "ReleaseContainer" => {
                Forward(Unary)
            }
            _ => DUPLEX,
        }
    }
}

pub struct Content;

impl ProxiedService for Content {
    const NAME: &'static str = "containerd.services.content.v1.Content";

    fn route(method: &str) -> MethodRoute {
        match method {
            "Info" | "Update" | "Delete" | "Status" | "ListStatuses" | "Abort" => Forward(Unary),
            "List" | "Read" => Forward(ServerStreaming),
            _ => DUPLEX,
        }
    }
}

pub struct Leases;

impl ProxiedService for Leases {
    const NAME: &'static str = "containerd.services.leases.v1.Leases";

    fn route(method: &str) -> MethodRoute {
        match method {
            "Create" | "Delete" | "List" | "AddResource" | "DeleteResource" | "ListResources" => Forward(Unary),
            _ => DUPLEX,
        }
    }
}

pub struct Health;

impl ProxiedService for Health {
    const NAME: &'static str = "grpc.health.v1.Health";

    fn route(method: &str) -> MethodRoute {
        match method {
            "Check" => Forward(Unary),
            "Watch" => Forward(ServerStreaming),
            _ => DUPLEX,
        }
    }
}

pub struct FileSync;

impl ProxiedService for FileSync {
    const NAME: &'static str = "moby.filesync.v1.FileSync";

    fn route(_method: &str) -> MethodRoute {
        DUPLEX
    }
}

pub struct FileSend;

impl ProxiedService for FileSend {
    const NAME: &'static str = "moby.filesync.v1.FileSend";

    fn route(_method: &str) -> MethodRoute {
        DUPLEX
    }
}

pub struct Auth;

impl ProxiedService for Auth {
    const NAME: &'static str = "moby.filesync.v1.Auth";

    fn route(method: &str) -> MethodRoute {
        match method {
            "Credentials" | "FetchToken" | "GetTokenAuthority" | "VerifyTokenAuthority" => Forward(Unary),
            _ => DUPLEX,
        }
    }
}

pub struct Upload;

impl ProxiedService for Upload {
    const NAME: &'static str = "moby.upload.v1.Upload";

    fn route(_method: &str) -> MethodRoute {
        DUPLEX
    }
}

pub struct SshForward;

impl ProxiedService for SshForward {
    const NAME: &'static str = "moby.sshforward.v1.SSH";

    fn route(method: &str) -> MethodRoute {
        match method {
            "CheckAgent" => Forward(Unary),
            _ => DUPLEX,
        }
    }
}

pub struct Secrets;

impl ProxiedService for Secrets {
    const NAME: &'static str = "moby.buildkit.secrets.v1.Secrets";

    fn route(method: &str) -> MethodRoute {
        match method {
            "GetSecret" => Forward(Unary),
            _ => DUPLEX,
        }
    }
}

pub struct TraceExport;

impl ProxiedService for TraceExport {
    const NAME: &'static str = "opentelemetry.proto.collector.trace.v1.TraceService";

    fn route(method: &str) -> MethodRoute {
        match method {
            "Export" => Forward(Unary),
            _ => DUPLEX,
        }
    }
}

/// Generic proxy for one service.
pub struct GrpcProxy<S> {
    ctx: Arc<ProxyContext>,
    _service: PhantomData<fn() -> S>,
}

impl<S> GrpcProxy<S> {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx, _service: PhantomData }
    }
}

impl<S> Clone for GrpcProxy<S> {
    fn clone(&self) -> Self {
        Self::new(self.ctx.clone())
    }
}

impl<S: ProxiedService> NamedService for GrpcProxy<S> {
    const NAME: &'static str = S::NAME;
}

pub(crate) fn raw_server() -> Grpc<RawCodec> {
    Grpc::new(RawCodec)
        .max_decoding_message_size(usize::MAX)
        .max_encoding_message_size(usize::MAX)
}

impl<S, B> Service<http::Request<B>> for GrpcProxy<S>
where
    S: ProxiedService,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let ctx = self.ctx.clone();
        let full_path = req.uri().path().to_string();

        Box::pin(async move {
            let method = full_path.rsplit('/').next().unwrap_or_default().to_string();
            let route = S::route(&method);
            debug!(
                service = S::NAME,
                method = %method,
                platform = %ctx.architecture,
                route = ?route,
                "Proxying call"
            );

            let path = match method_path(&full_path) {
                Ok(path) => path,
                Err(status) => return Ok(status.into_http()),
            };

            let mut grpc = raw_server();
            let response = match route {
                Forward(CallShape::Unary) => {
                    let service = tower::service_fn(move |request: Request<Bytes>| {
                        forward_unary(ctx.clone(), path.clone(), request)
                    });
                    grpc.unary(service, req).await
                }
                Forward(CallShape::ServerStreaming) => {
                    let service = tower::service_fn(move |request: Request<Bytes>| {
                        forward_server_streaming(ctx.clone(), path.clone(), request, |sink, _| sink)
                    });
                    grpc.server_streaming(service, req).await
                }
                Forward(CallShape::Streaming) => {
                    let service = tower::service_fn(move |request: Request<Streaming<Bytes>>| {
                        forward_streaming(ctx.clone(), path.clone(), request)
                    });
                    grpc.streaming(service, req).await
                }
                Intercept(interception) => control::intercept(interception, ctx, path, grpc, req).await,
            };
            Ok(response)
        })
    }
}

/// Plain unary passthrough.
pub(crate) async fn forward_unary(
    ctx: Arc<ProxyContext>,
    path: PathAndQuery,
    request: Request<Bytes>,
) -> Result<Response<Bytes>, Status> {
    let connection = ctx.connection.acquire().await?;
    let (metadata, _, message) = request.into_parts();
    unary(&connection, path, metadata, message).await
}

/// Server-streaming passthrough; `wrap` may decorate the client sink.
pub(crate) async fn forward_server_streaming<C, W>(
    ctx: Arc<ProxyContext>,
    path: PathAndQuery,
    request: Request<Bytes>,
    wrap: W,
) -> Result<Response<ResponseStream>, Status>
where
    C: ClientSink<Bytes> + Send + 'static,
    W: FnOnce(ResponseSink, &Arc<ProxyContext>) -> C,
{
    let connection = ctx.connection.acquire().await?;
    let (metadata, _, message) = request.into_parts();
    let mut upstream = open_server_streaming(&connection, path, metadata, message, ctx.call_token());

    let (sink, pending) = ResponseSink::channel();
    let mut sink = wrap(sink, &ctx);
    tokio::spawn(async move {
        if let Err(status) = forward_upstream_to_client(&mut upstream, &mut sink).await {
            sink.fail(status).await;
        }
    });

    pending.into_response().await
}

/// Full-duplex passthrough through the stream pump.
pub(crate) async fn forward_streaming(
    ctx: Arc<ProxyContext>,
    path: PathAndQuery,
    request: Request<Streaming<Bytes>>,
) -> Result<Response<ResponseStream>, Status> {
    let connection = ctx.connection.acquire().await?;
    let (metadata, _, inbound) = request.into_parts();
    let cancel = ctx.call_token();
    let (upstream_tx, upstream_rx) = open_streaming(&connection, path.clone(), metadata, cancel.clone());

    let (sink, pending) = ResponseSink::channel();
    tokio::spawn(async move {
        if let Err(status) = pump(ClientStream(inbound), sink, upstream_tx, upstream_rx, cancel).await {
            debug!(path = %path, code = ?status.code(), "Proxied stream ended with error");
        }
    });

    pending.into_response().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_method_table() {
        assert_eq!(Control::route("Solve"), Intercept(Interception::Solve));
        assert_eq!(Control::route("Status"), Intercept(Interception::Status));
        assert_eq!(Control::route("ListWorkers"), Intercept(Interception::ListWorkers));
        assert_eq!(Control::route("DiskUsage"), Intercept(Interception::ShutdownEmpty));
        assert_eq!(Control::route("UpdateBuildHistory"), Intercept(Interception::ShutdownEmpty));
        assert_eq!(Control::route("Info"), Intercept(Interception::ShutdownUnimplemented));
        assert_eq!(Control::route("ListenBuildHistory"), Intercept(Interception::ShutdownUnimplemented));
        assert_eq!(Control::route("Session"), DUPLEX);
        assert_eq!(Control::route("Prune"), Forward(ServerStreaming));
    }

    #[test]
    fn test_unknown_methods_are_full_duplex() {
        assert_eq!(LlbBridge::route("ExecProcess"), DUPLEX);
        assert_eq!(Content::route("Write"), DUPLEX);
        assert_eq!(FileSync::route("DiffCopy"), DUPLEX);
        assert_eq!(Health::route("SomethingNew"), DUPLEX);
        assert_eq!(Content::route("Read"), Forward(ServerStreaming));
    }
}
