// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::build::{BuildError, CancelSource};
use crate::domain::config::RetryPolicy;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Run `attempt` until it succeeds, fails with a non-transient error, or the
/// retry budget runs out. Only allow-listed transient errors are retried.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, BuildError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BuildError>>,
{
    let mut retries = 0;
    loop {
        match attempt(retries + 1).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && retries < policy.max_retries => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = policy.max_retries,
                    error = %err,
                    "Transient build failure, retrying in {:?}",
                    policy.backoff
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BuildError::Canceled(CancelSource::User)),
                    _ = tokio::time::sleep(policy.backoff) => {}
                }
            }
            Err(err) if err.is_transient() && retries > 0 => {
                return Err(BuildError::RetriesExhausted {
                    attempts: retries + 1,
                    last: Box::new(err),
                })
            }
            Err(err) => return Err(err),
        }
    }
}
