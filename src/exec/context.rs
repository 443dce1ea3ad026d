//! Caller context for store operations: cancellation plus optional deadline.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::StoreError;

/// The outer context a store call runs under.
///
/// Per-attempt timeouts are derived from this but never reported as a
/// caller failure: only [`ExecContext::err`] decides whether the caller
/// itself has given up.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl ExecContext {
    /// Context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Narrow the deadline to at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// The caller-side failure, if the caller has given up.
    pub fn err(&self) -> Option<StoreError> {
        if self.is_cancelled() {
            Some(StoreError::Cancelled)
        } else if self.deadline_exceeded() {
            Some(StoreError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Time one attempt may use: `min(remaining deadline, attempt_timeout)`.
    pub fn attempt_budget(&self, attempt_timeout: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => attempt_timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => attempt_timeout,
        }
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn attempt_budget_is_capped_by_deadline() {
        let ctx = ExecContext::background().with_timeout(Duration::from_millis(300));
        assert_eq!(
            ctx.attempt_budget(Duration::from_secs(10)),
            Duration::from_millis(300)
        );
        assert_eq!(
            ctx.attempt_budget(Duration::from_millis(50)),
            Duration::from_millis(50)
        );

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(ctx.attempt_budget(Duration::from_secs(10)), Duration::ZERO);
        assert!(matches!(ctx.err(), Some(StoreError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn nested_timeout_never_extends_deadline() {
        let outer = ExecContext::background().with_timeout(Duration::from_millis(100));
        let inner = outer.with_timeout(Duration::from_secs(5));
        assert_eq!(inner.deadline(), outer.deadline());
    }

    #[tokio::test]
    async fn cancellation_wins_over_deadline() {
        let token = CancellationToken::new();
        let ctx = ExecContext::with_cancellation(token.clone()).with_timeout(Duration::ZERO);
        token.cancel();
        assert!(matches!(ctx.err(), Some(StoreError::Cancelled)));
    }

    #[tokio::test]
    async fn background_context_never_fails() {
        let ctx = ExecContext::background();
        assert!(ctx.err().is_none());
        assert_eq!(
            ctx.attempt_budget(Duration::from_secs(3)),
            Duration::from_secs(3)
        );
    }
}
