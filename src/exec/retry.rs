//! Bounded exponential backoff around store attempts.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::context::ExecContext;
use super::error::{StoreError, StoreResult};

const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 25;
const DEFAULT_MAX_BACKOFF_MS: u64 = 250;
const DEFAULT_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: usize) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exp = (retry - 1).min(i32::MAX as usize) as i32;
        let factor = self.multiplier.max(1.0).powi(exp);
        let delay_ms = (self.initial_backoff.as_millis() as f64 * factor)
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, exhausts
/// the policy, or the caller gives up.
///
/// The outer context is checked after every failed attempt. A caller that
/// has been cancelled or whose deadline passed gets `Cancelled` or
/// `DeadlineExceeded` instead of whatever the attempt reported, so an
/// attempt timeout that happened to coincide with caller cancellation is
/// never retried.
pub async fn retry_with_backoff<T, Op, Fut>(
    operation: &'static str,
    ctx: &ExecContext,
    policy: &RetryPolicy,
    mut op: Op,
) -> StoreResult<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut retry = 0usize;
    loop {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.class().is_retryable() {
            return Err(err);
        }
        if let Some(ctx_err) = ctx.err() {
            return Err(ctx_err);
        }
        if retry >= policy.max_retries {
            return Err(err);
        }
        retry += 1;
        let delay = policy.backoff_for(retry);
        warn!(
            operation,
            attempt = retry,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "transient store error; retrying"
        );
        // Never sleep past the caller's deadline.
        let mut wake = tokio::time::Instant::now() + delay;
        if let Some(deadline) = ctx.deadline() {
            wake = wake.min(deadline);
        }
        tokio::select! {
            _ = ctx.cancelled() => return Err(StoreError::Cancelled),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}
