// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod proxy;

pub use proxy::{ProxyContext, ProxyError, ProxyServer, ShutdownSignal, ShutdownTrigger};
