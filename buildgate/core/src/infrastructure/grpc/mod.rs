// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Raw gRPC plumbing shared by the proxy, the health probe and the content store.

pub mod codec;
pub mod health;
pub mod messages;
pub mod pump;
pub mod transport;

pub use codec::RawCodec;
pub use health::GrpcHealthProbe;
pub use pump::{pump, ClientSink, MessageSource, UpstreamRecv, UpstreamSend};
