// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Stream Pump
//!
//! Relays one RPC between the client-facing stream and the upstream stream
//! without looking at the payload. Two directions run concurrently:
//!
//! - client -> upstream: forward every message; on client EOF half-close the
//!   upstream send side; any other client error cancels the call and becomes
//!   `Internal`.
//! - upstream -> client: copy response headers once before the first message,
//!   forward messages in order, copy trailers once at upstream EOF.
//!
//! The first terminal error from either direction decides the RPC status. A
//! clean finish requires upstream EOF on the upstream -> client direction.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::Status;
use tracing::debug;

/// Receiving side of a stream. `Ok(None)` is a clean EOF.
#[async_trait]
pub trait MessageSource<M>: Send {
    async fn recv(&mut self) -> Result<Option<M>, Status>;
}

/// The client-facing response stream.
#[async_trait]
pub trait ClientSink<M>: Send {
    async fn send_headers(&mut self, headers: MetadataMap) -> Result<(), Status>;
    async fn send(&mut self, message: M) -> Result<(), Status>;
    async fn send_trailers(&mut self, trailers: MetadataMap) -> Result<(), Status>;
    /// Terminate the client stream with an error status.
    async fn fail(&mut self, status: Status);
}

/// Sending side of the upstream call.
#[async_trait]
pub trait UpstreamSend<M>: Send {
    async fn send(&mut self, message: M) -> Result<(), Status>;
    /// Half-close: no more messages will be sent.
    async fn close_send(&mut self);
}

/// Receiving side of the upstream call.
#[async_trait]
pub trait UpstreamRecv<M>: MessageSource<M> {
    async fn headers(&mut self) -> Result<MetadataMap, Status>;
    async fn trailers(&mut self) -> Result<MetadataMap, Status>;
}

/// Forward client messages upstream until the client finishes.
pub async fn forward_client_to_upstream<M, S, U>(
    mut source: S,
    mut upstream: U,
    cancel: CancellationToken,
) -> Result<(), Status>
where
    M: Send,
    S: MessageSource<M>,
    U: UpstreamSend<M>,
{
    loop {
        match source.recv().await {
            Ok(Some(message)) => {
                if let Err(status) = upstream.send(message).await {
                    // The upstream stream is gone; its real status shows up on
                    // the receiving direction.
                    debug!(code = ?status.code(), "Upstream stopped accepting messages");
                    upstream.close_send().await;
                    return Ok(());
                }
            }
            Ok(None) => {
                upstream.close_send().await;
                return Ok(());
            }
            Err(status) => {
                cancel.cancel();
                return Err(Status::internal(format!(
                    "failed proxying client stream: {}",
                    status.message()
                )));
            }
        }
    }
}

/// Forward upstream responses to the client until upstream EOF.
///
/// Upstream errors are returned verbatim.
pub async fn forward_upstream_to_client<M, U, C>(upstream: &mut U, client: &mut C) -> Result<(), Status>
where
    M: Send,
    U: UpstreamRecv<M>,
    C: ClientSink<M>,
{
    let mut headers_sent = false;
    loop {
        match upstream.recv().await? {
            Some(message) => {
                if !headers_sent {
                    client.send_headers(upstream.headers().await?).await?;
                    headers_sent = true;
                }
                client.send(message).await?;
            }
            None => {
                if !headers_sent {
                    client.send_headers(upstream.headers().await?).await?;
                }
                let trailers = upstream.trailers().await?;
                client.send_trailers(trailers).await?;
                return Ok(());
            }
        }
    }
}

/// Run both directions of a full-duplex call to completion.
///
/// The client -> upstream half runs on its own task; the upstream -> client
/// half runs on the caller's task. Whatever terminal status results is also
/// delivered to the client sink.
pub async fn pump<M, S, C, US, UR>(
    source: S,
    mut client: C,
    upstream_tx: US,
    mut upstream_rx: UR,
    cancel: CancellationToken,
) -> Result<(), Status>
where
    M: Send + 'static,
    S: MessageSource<M> + 'static,
    C: ClientSink<M>,
    US: UpstreamSend<M> + 'static,
    UR: UpstreamRecv<M>,
{
    let outbound = tokio::spawn(forward_client_to_upstream(source, upstream_tx, cancel.clone()));
    tokio::pin!(outbound);

    let result = {
        let inbound = forward_upstream_to_client(&mut upstream_rx, &mut client);
        tokio::pin!(inbound);

        let mut outbound_done = false;
        let result = loop {
            tokio::select! {
                joined = &mut outbound, if !outbound_done => {
                    outbound_done = true;
                    match joined {
                        Ok(Ok(())) => continue,
                        Ok(Err(status)) => break Err(status),
                        Err(e) => {
                            cancel.cancel();
                            break Err(Status::internal(format!("client stream task failed: {}", e)));
                        }
                    }
                }
                finished = &mut inbound => break finished,
            }
        };

        if !outbound_done {
            outbound.abort();
        }
        result
    };

    if let Err(status) = &result {
        client.fail(status.clone()).await;
    }
    result
}
