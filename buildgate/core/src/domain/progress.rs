// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Progress reporting contract.
//!
//! Terminal rendering is owned by the host CLI. The core only pushes raw
//! `Control.Status` messages and human-readable lines into a reporter, and
//! waits for it to drain before a build returns.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("Progress output failed: {0}")]
    Output(String),
}

#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Side-channel copy of one encoded `moby.buildkit.v1.StatusResponse`.
    fn publish_status(&self, message: &Bytes);

    /// A line meant for the user (build summary links, load notices).
    fn print(&self, line: &str);

    /// Wait until everything published so far has been rendered.
    async fn flush(&self) -> Result<(), ReporterError>;
}

pub struct NoopReporter;

#[async_trait]
impl ProgressReporter for NoopReporter {
    fn publish_status(&self, _message: &Bytes) {}

    fn print(&self, _line: &str) {}

    async fn flush(&self) -> Result<(), ReporterError> {
        Ok(())
    }
}

/// Writes user lines to stderr and only counts status messages.
#[derive(Default)]
pub struct StderrReporter {
    status_messages: AtomicU64,
}

impl StderrReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_messages(&self) -> u64 {
        self.status_messages.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ProgressReporter for StderrReporter {
    fn publish_status(&self, _message: &Bytes) {
        self.status_messages.fetch_add(1, Ordering::Relaxed);
    }

    fn print(&self, line: &str) {
        eprintln!("{}", line);
    }

    async fn flush(&self) -> Result<(), ReporterError> {
        std::io::stderr()
            .flush()
            .map_err(|e| ReporterError::Output(e.to_string()))
    }
}
