// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Layer (`buildgate-core`)
//!
//! Plain types and collaborator contracts. Nothing in here performs I/O on its
//! own; every side effect goes through one of the traits declared here and is
//! implemented in `crate::infrastructure` or supplied by the host CLI.

pub mod platform;
pub mod builder;
pub mod connection;
pub mod content;
pub mod build;
pub mod bookkeeping;
pub mod progress;
pub mod config;

pub use platform::{Architecture, PlatformError, WorkerPlatform};
pub use builder::{Builder, BuilderEndpoint, BuilderId, BuilderState};
pub use connection::{AcquisitionError, BuilderConnection, ConnectionProvider};
pub use content::{ContentDescriptor, ContentError, ContentStore, ImageIdentity, OciManifest};
pub use build::{BuildError, BuildOutcome, BuildRequest, BuildResult, CancelSource, StepTiming};
pub use bookkeeping::BuildService;
pub use progress::ProgressReporter;
pub use config::{GateConfigManifest, ReadinessPolicy, RetryPolicy};
