// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod grpc;
pub mod readiness;
pub mod content_store;
pub mod packet;
pub mod registry;
pub mod docker;
pub mod bridge;

pub use bridge::{BridgeError, DesktopBridge, RegistryRoute};
pub use content_store::GrpcContentStore;
pub use docker::{DaemonError, DockerDaemon, LocalDaemon};
pub use packet::PacketContentStore;
pub use readiness::{poll_until, HttpProbe, LivenessProbe, ReadinessError};
pub use registry::{ContentRegistry, RegistryError, RegistryHandle};
