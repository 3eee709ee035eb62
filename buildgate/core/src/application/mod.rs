// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Application Layer (`buildgate-core`)
//!
//! Use cases built on the domain contracts: bringing builders up and down,
//! retrying transient failures, reporting step timings, loading the built
//! image locally and the orchestrator that ties them into one build.

pub mod lifecycle;
pub mod retry;
pub mod telemetry;
pub mod fast_load;
pub mod orchestrator;

#[cfg(test)]
pub(crate) mod testing;

pub use fast_load::FastLoader;
pub use lifecycle::{BuilderDialer, BuilderLifecycle, GrpcDialer};
pub use orchestrator::{BuildOrchestrator, BuilderContentStores, ContentStoreFactory};
pub use retry::with_retry;
pub use telemetry::{TimingsRecorder, TimingsSink};
