//! Store facade shared by the pipeline stages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::exec::{ExecContext, StoreError};
use crate::model::{NewItem, QueueItem, QueueZone};
use crate::query::{DequeueItemsParams, ObtainTopLevelQueueParams, PeekTopLevelQueuesParams};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Result of a lease compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Obtained(QueueZone),
    /// Another consumer changed the lease first.
    Missed,
}

impl LeaseOutcome {
    pub fn is_obtained(&self) -> bool {
        matches!(self, Self::Obtained(_))
    }
}

/// Operations the scanner, managers, workers and producers need from the
/// coordination store.
///
/// Expected misses are folded into return values (`Missed`, empty vectors,
/// `false`); every `Err` is a real failure.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Vested zones on one ring token, capped at `params.limit`.
    async fn peek_zones(
        &self,
        ctx: &ExecContext,
        params: &PeekTopLevelQueuesParams,
    ) -> BackendResult<Vec<QueueZone>>;

    /// Every vested zone on one ring token, oldest first.
    async fn select_vested_zones(
        &self,
        ctx: &ExecContext,
        hash_token: i64,
        now: DateTime<Utc>,
    ) -> BackendResult<Vec<QueueZone>>;

    async fn obtain_lease(
        &self,
        ctx: &ExecContext,
        params: &ObtainTopLevelQueueParams,
    ) -> BackendResult<LeaseOutcome>;

    /// Claim up to `params.limit` visible items. Empty means nothing visible.
    async fn dequeue_items(
        &self,
        ctx: &ExecContext,
        params: &DequeueItemsParams,
    ) -> BackendResult<Vec<QueueItem>>;

    /// Delete a processed item. `false` if its claim was superseded.
    async fn ack_item(&self, ctx: &ExecContext, item: &QueueItem) -> BackendResult<bool>;

    /// Insert an item and make sure its zone pointer will be scanned.
    async fn enqueue(&self, ctx: &ExecContext, item: &NewItem) -> BackendResult<QueueItem>;
}
