// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! tonic adapters for the stream pump.
//!
//! The downstream side is a [`ResponseSink`] feeding the handler's response
//! stream, paired with a [`PendingResponse`] the handler awaits for headers.
//! The upstream side opens raw calls over the builder [`Channel`] and splits
//! them into an [`UpstreamSender`] and an [`UpstreamReceiver`].

use crate::domain::connection::BuilderConnection;
use crate::infrastructure::grpc::codec::RawCodec;
use crate::infrastructure::grpc::pump::{ClientSink, MessageSource, UpstreamRecv, UpstreamSend};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::{Code, Request, Response, Status, Streaming};

/// Buffered responses between the pump and the downstream HTTP/2 stream.
const RESPONSE_BUFFER: usize = 64;

/// Upstream messages queued ahead of the HTTP/2 send window.
const REQUEST_BUFFER: usize = 64;

/// Headers that describe the hop rather than the call and must not be copied.
const HOP_HEADERS: &[&str] = &["grpc-encoding", "grpc-accept-encoding", "content-length"];

pub type ResponseStream = ReceiverStream<Result<Bytes, Status>>;

/// Strip per-hop headers from metadata copied between peers.
pub fn sanitize(mut metadata: MetadataMap) -> MetadataMap {
    for header in HOP_HEADERS {
        metadata.remove(*header);
    }
    metadata
}

/// Build the outbound request: inbound metadata plus the builder credential.
pub fn outbound_request<T>(metadata: MetadataMap, message: T, connection: &BuilderConnection) -> Request<T> {
    let mut request = Request::new(message);
    *request.metadata_mut() = sanitize(metadata);
    if let Some(auth) = &connection.authorization {
        request.metadata_mut().insert("authorization", auth.clone());
    }
    request
}

pub fn method_path(path: &str) -> Result<PathAndQuery, Status> {
    PathAndQuery::try_from(path).map_err(|e| Status::internal(format!("invalid method path {}: {}", path, e)))
}

/// Client-facing half of a streaming response.
pub struct ResponseSink {
    headers: Option<oneshot::Sender<Result<MetadataMap, Status>>>,
    tx: mpsc::Sender<Result<Bytes, Status>>,
}

/// What the handler waits on before it can return its `Response`.
pub struct PendingResponse {
    headers: oneshot::Receiver<Result<MetadataMap, Status>>,
    rx: mpsc::Receiver<Result<Bytes, Status>>,
}

impl ResponseSink {
    pub fn channel() -> (ResponseSink, PendingResponse) {
        let (headers_tx, headers_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        (
            ResponseSink { headers: Some(headers_tx), tx },
            PendingResponse { headers: headers_rx, rx },
        )
    }

    fn closed() -> Status {
        Status::cancelled("client closed the response stream")
    }
}

impl PendingResponse {
    /// Resolve once headers are known, or with the error that ended the call first.
    pub async fn into_response(self) -> Result<Response<ResponseStream>, Status> {
        let headers = match self.headers.await {
            Ok(result) => result?,
            Err(_) => return Err(Status::internal("proxy stream ended before sending headers")),
        };
        let mut response = Response::new(ReceiverStream::new(self.rx));
        *response.metadata_mut() = headers;
        Ok(response)
    }
}

#[async_trait]
impl ClientSink<Bytes> for ResponseSink {
    async fn send_headers(&mut self, headers: MetadataMap) -> Result<(), Status> {
        match self.headers.take() {
            Some(tx) => tx.send(Ok(sanitize(headers))).map_err(|_| Self::closed()),
            None => Ok(()),
        }
    }

    async fn send(&mut self, message: Bytes) -> Result<(), Status> {
        self.tx.send(Ok(message)).await.map_err(|_| Self::closed())
    }

    async fn send_trailers(&mut self, trailers: MetadataMap) -> Result<(), Status> {
        // An Ok-coded status at the end of the stream becomes the trailers frame.
        let status = Status::with_metadata(Code::Ok, "", sanitize(trailers));
        self.tx.send(Err(status)).await.map_err(|_| Self::closed())
    }

    async fn fail(&mut self, status: Status) {
        match self.headers.take() {
            Some(tx) => {
                let _ = tx.send(Err(status));
            }
            None => {
                let _ = self.tx.send(Err(status)).await;
            }
        }
    }
}

/// Inbound client stream.
pub struct ClientStream(pub Streaming<Bytes>);

#[async_trait]
impl MessageSource<Bytes> for ClientStream {
    async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
        self.0.message().await
    }
}

/// Upstream send half. Dropping the channel half-closes the request stream.
pub struct UpstreamSender {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl UpstreamSend<Bytes> for UpstreamSender {
    async fn send(&mut self, message: Bytes) -> Result<(), Status> {
        match &self.tx {
            Some(tx) => tx
                .send(message)
                .await
                .map_err(|_| Status::unavailable("upstream request stream closed")),
            None => Err(Status::failed_precondition("send after close")),
        }
    }

    async fn close_send(&mut self) {
        self.tx.take();
    }
}

type PendingCall = BoxFuture<'static, Result<Response<Streaming<Bytes>>, Status>>;

enum CallState {
    Pending(PendingCall),
    Open { headers: Option<MetadataMap>, stream: Streaming<Bytes> },
    Failed(Status),
}

/// Upstream receive half: the in-flight call, then its response stream.
pub struct UpstreamReceiver {
    state: CallState,
    cancel: CancellationToken,
}

impl UpstreamReceiver {
    pub fn new(call: PendingCall, cancel: CancellationToken) -> Self {
        Self { state: CallState::Pending(call), cancel }
    }

    async fn open(&mut self) -> Result<&mut Streaming<Bytes>, Status> {
        if let CallState::Pending(call) = &mut self.state {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => Err(Status::cancelled("proxied call canceled")),
                response = call => response,
            };
            self.state = match outcome {
                Ok(response) => {
                    let (metadata, stream, _) = response.into_parts();
                    CallState::Open { headers: Some(metadata), stream }
                }
                Err(status) => CallState::Failed(status),
            };
        }

        match &mut self.state {
            CallState::Open { stream, .. } => Ok(stream),
            CallState::Failed(status) => Err(status.clone()),
            CallState::Pending(_) => Err(Status::internal("upstream call not started")),
        }
    }
}

#[async_trait]
impl MessageSource<Bytes> for UpstreamReceiver {
    async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
        let cancel = self.cancel.clone();
        let stream = self.open().await?;
        tokio::select! {
            _ = cancel.cancelled() => Err(Status::cancelled("proxied call canceled")),
            message = stream.message() => message,
        }
    }
}

#[async_trait]
impl UpstreamRecv<Bytes> for UpstreamReceiver {
    async fn headers(&mut self) -> Result<MetadataMap, Status> {
        self.open().await?;
        match &mut self.state {
            CallState::Open { headers, .. } => Ok(headers.take().unwrap_or_default()),
            _ => Ok(MetadataMap::new()),
        }
    }

    async fn trailers(&mut self) -> Result<MetadataMap, Status> {
        let stream = self.open().await?;
        Ok(stream.trailers().await?.unwrap_or_default())
    }
}

/// Open a full-duplex raw call. Nothing is awaited until the receiver is polled.
pub fn open_streaming(
    connection: &BuilderConnection,
    path: PathAndQuery,
    metadata: MetadataMap,
    cancel: CancellationToken,
) -> (UpstreamSender, UpstreamReceiver) {
    let (tx, rx) = mpsc::channel::<Bytes>(REQUEST_BUFFER);
    let request = outbound_request(metadata, ReceiverStream::new(rx), connection);
    let mut grpc = raw_client(connection.channel.clone());

    let call: PendingCall = Box::pin(async move {
        grpc.ready().await.map_err(ready_error)?;
        grpc.streaming(request, path, RawCodec).await
    });

    (UpstreamSender { tx: Some(tx) }, UpstreamReceiver::new(call, cancel))
}

/// Open a server-streaming raw call carrying one request message.
pub fn open_server_streaming(
    connection: &BuilderConnection,
    path: PathAndQuery,
    metadata: MetadataMap,
    message: Bytes,
    cancel: CancellationToken,
) -> UpstreamReceiver {
    let request = outbound_request(metadata, message, connection);
    let mut grpc = raw_client(connection.channel.clone());

    let call: PendingCall = Box::pin(async move {
        grpc.ready().await.map_err(ready_error)?;
        grpc.server_streaming(request, path, RawCodec).await
    });

    UpstreamReceiver::new(call, cancel)
}

/// Forward one unary call. Upstream trailers come back merged into the response metadata.
pub async fn unary(
    connection: &BuilderConnection,
    path: PathAndQuery,
    metadata: MetadataMap,
    message: Bytes,
) -> Result<Response<Bytes>, Status> {
    let request = outbound_request(metadata, message, connection);
    let mut grpc = raw_client(connection.channel.clone());
    grpc.ready().await.map_err(ready_error)?;

    let response = grpc.unary(request, path, RawCodec).await?;
    let (metadata, message, extensions) = response.into_parts();
    Ok(Response::from_parts(sanitize(metadata), message, extensions))
}

fn raw_client(channel: Channel) -> tonic::client::Grpc<Channel> {
    tonic::client::Grpc::new(channel)
        .max_decoding_message_size(usize::MAX)
        .max_encoding_message_size(usize::MAX)
}

fn ready_error(e: tonic::transport::Error) -> Status {
    Status::unavailable(format!("builder connection not ready: {}", e))
}
