// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the buildgate CLI

pub mod config;
pub mod proxy;

pub use self::config::ConfigCommand;
pub use self::proxy::ProxyArgs;
