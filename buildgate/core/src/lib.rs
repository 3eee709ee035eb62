// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # buildgate-core
//!
//! Runs container image builds on ephemeral remote BuildKit daemons while the
//! local build client believes it is talking to a local daemon.
//!
//! | Layer | Contents |
//! |-------|----------|
//! | [`domain`] | Builders, platforms, content descriptors, build results, collaborator traits |
//! | [`application`] | Builder lifecycle, bounded retry, timing telemetry, fast load, build orchestration |
//! | [`infrastructure`] | gRPC stream pump and transports, content registry, content stores, Docker access |
//! | [`presentation`] | The BuildKit proxy server re-serving the control plane on a local listener |

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
