// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Build-step timing telemetry.
//!
//! Completed vertexes observed on `Control.Status` are buffered and reported
//! to the bookkeeping service on a fixed tick. On cancellation the ticker
//! drains whatever is still queued, flushes once more and exits.

use crate::domain::build::StepTiming;
use crate::domain::BuildService;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cheap handle handed to the status tee.
#[derive(Clone)]
pub struct TimingsSink {
    tx: mpsc::UnboundedSender<StepTiming>,
}

impl TimingsSink {
    pub fn record(&self, steps: Vec<StepTiming>) {
        for step in steps {
            // The recorder may already have stopped; late steps are dropped.
            let _ = self.tx.send(step);
        }
    }
}

pub struct TimingsRecorder {
    sink: TimingsSink,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TimingsRecorder {
    pub fn start(
        service: Arc<dyn BuildService>,
        build_id: String,
        token: String,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(service, build_id, token, interval, rx, cancel.clone()));
        Self { sink: TimingsSink { tx }, cancel, task }
    }

    pub fn sink(&self) -> TimingsSink {
        self.sink.clone()
    }

    /// Stop the ticker and wait for the final flush.
    pub async fn finish(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Timing recorder task failed");
        }
    }
}

struct Buffer {
    pending: Vec<StepTiming>,
    seen: HashSet<String>,
}

impl Buffer {
    fn push(&mut self, step: StepTiming) {
        if self.seen.insert(step.digest.clone()) {
            self.pending.push(step);
        }
    }
}

async fn run(
    service: Arc<dyn BuildService>,
    build_id: String,
    token: String,
    interval: Duration,
    mut rx: mpsc::UnboundedReceiver<StepTiming>,
    cancel: CancellationToken,
) {
    let mut buffer = Buffer { pending: Vec::new(), seen: HashSet::new() };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            step = rx.recv() => match step {
                Some(step) => buffer.push(step),
                None => break,
            },
            _ = ticker.tick() => flush(service.as_ref(), &build_id, &token, &mut buffer.pending).await,
        }
    }

    while let Ok(step) = rx.try_recv() {
        buffer.push(step);
    }
    flush(service.as_ref(), &build_id, &token, &mut buffer.pending).await;
    if !buffer.pending.is_empty() {
        warn!(build_id = %build_id, dropped = buffer.pending.len(), "Dropping unreported step timings");
    }
}

async fn flush(service: &dyn BuildService, build_id: &str, token: &str, pending: &mut Vec<StepTiming>) {
    if pending.is_empty() {
        return;
    }
    match service.report_timings(build_id, token, pending).await {
        Ok(()) => {
            debug!(build_id = %build_id, steps = pending.len(), "Reported step timings");
            pending.clear();
        }
        Err(e) => {
            warn!(build_id = %build_id, error = %e, "Failed to report step timings, will retry");
        }
    }
}
