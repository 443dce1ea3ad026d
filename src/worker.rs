//! Worker pool: run the caller's handler and ack on success.
//!
//! A failed or timed-out handler leaves the item alone. Its claim lapses at
//! the stamped vesting time and the item is dequeued again.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backends::QueueBackend;
use crate::error::FatalError;
use crate::exec::ExecContext;
use crate::manager::{SharedReceiver, WorkItem, recv_shared};
use crate::model::QueueItem;
use crate::observability::obs;
use crate::stats::PipelineStats;

/// Processes one queue item. `Ok` acks the item; `Err` leaves it for
/// redelivery.
#[async_trait]
pub trait ItemHandler: Send + Sync + 'static {
    async fn handle(&self, item: &QueueItem) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> ItemHandler for F
where
    F: Fn(QueueItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, item: &QueueItem) -> anyhow::Result<()> {
        (self)(item.clone()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Acked,
    /// Handler succeeded but the claim had been superseded.
    AckMissed,
    Failed,
    TimedOut,
    /// The claim lapsed before the item reached a worker.
    Expired,
}

pub struct WorkerTask<B> {
    pub id: usize,
    pub backend: B,
    pub handler: Arc<dyn ItemHandler>,
    pub receiver: SharedReceiver<WorkItem>,
    pub stats: Arc<PipelineStats>,
}

impl<B> WorkerTask<B>
where
    B: QueueBackend + Clone + 'static,
{
    /// Workers never fail the pipeline; every item error is logged and left
    /// to redelivery.
    pub async fn run(
        self,
        shutdown: tokio_util::sync::WaitForCancellationFutureOwned,
    ) -> Result<(), FatalError> {
        debug!(worker = self.id, "worker started");
        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            let work = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!(worker = self.id, "worker shutting down");
                    break;
                }
                work = recv_shared(&self.receiver) => match work {
                    Some(work) => work,
                    None => break,
                },
            };
            self.process(work).await;
        }
        Ok(())
    }

    #[obs]
    pub async fn process(&self, work: WorkItem) -> ItemOutcome {
        let WorkItem {
            item,
            claim_expires_at,
            zone_claim,
            ..
        } = work;
        if tokio::time::Instant::now() >= claim_expires_at {
            debug!(
                queue_zone = %item.queue_zone,
                item_id = item.id,
                "item claim lapsed before processing; leaving for redelivery"
            );
            return ItemOutcome::Expired;
        }

        let started = std::time::Instant::now();
        let result = tokio::time::timeout_at(claim_expires_at, self.handler.handle(&item)).await;
        self.stats.record_handled(started.elapsed());

        let outcome = match result {
            Ok(Ok(())) => match self.backend.ack_item(&ExecContext::background(), &item).await {
                Ok(true) => ItemOutcome::Acked,
                Ok(false) => {
                    warn!(
                        queue_zone = %item.queue_zone,
                        item_id = item.id,
                        "item claim superseded before ack; it will be redelivered"
                    );
                    ItemOutcome::AckMissed
                }
                Err(err) => {
                    warn!(
                        queue_zone = %item.queue_zone,
                        item_id = item.id,
                        error = %err,
                        "failed to ack item; it will be redelivered"
                    );
                    ItemOutcome::AckMissed
                }
            },
            Ok(Err(err)) => {
                warn!(
                    queue_zone = %item.queue_zone,
                    item_id = item.id,
                    error = %err,
                    "item handler failed; leaving for redelivery"
                );
                ItemOutcome::Failed
            }
            Err(_) => {
                warn!(
                    queue_zone = %item.queue_zone,
                    item_id = item.id,
                    "item handler exceeded the item lease; leaving for redelivery"
                );
                ItemOutcome::TimedOut
            }
        };
        match outcome {
            ItemOutcome::Acked => self.stats.record_ack(true),
            ItemOutcome::AckMissed => self.stats.record_ack(false),
            _ => self.stats.record_failure(),
        }
        if let Some(claim) = Arc::into_inner(zone_claim) {
            debug!(queue_zone = claim.queue_zone(), "zone batch finished; releasing zone");
        }
        outcome
    }
}

/// Build a handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ItemHandler>
where
    F: Fn(QueueItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    Arc::new(f)
}

/// Channel pair feeding a worker pool from the managers.
pub fn work_channel(capacity: usize) -> (mpsc::Sender<WorkItem>, SharedReceiver<WorkItem>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (sender, Arc::new(tokio::sync::Mutex::new(receiver)))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::backends::MemoryBackend;
    use crate::model::{NewItem, vesting_after};
    use crate::processing::ProcessingZones;
    use crate::query::DequeueItemsParams;

    async fn claimed_item(backend: &MemoryBackend, lease: Duration) -> QueueItem {
        let ctx = ExecContext::background();
        backend
            .enqueue(
                &ctx,
                &NewItem::new("z1", "payload", 63).visible_at(Utc::now() - ChronoDuration::seconds(1)),
            )
            .await
            .expect("enqueue");
        let now = Utc::now();
        backend
            .dequeue_items(
                &ctx,
                &DequeueItemsParams {
                    queue_zone: "z1".to_string(),
                    limit: 1,
                    now,
                    vesting_time: vesting_after(now, lease),
                },
            )
            .await
            .expect("dequeue")
            .remove(0)
    }

    fn work(item: QueueItem, processing: &ProcessingZones, lease: Duration) -> WorkItem {
        WorkItem {
            zone_claim: Arc::new(
                processing
                    .try_register(&item.queue_zone, usize::MAX)
                    .expect("claim"),
            ),
            item,
            lease_id: Uuid::new_v4(),
            claim_expires_at: tokio::time::Instant::now() + lease,
        }
    }

    fn worker(backend: MemoryBackend, handler: Arc<dyn ItemHandler>) -> WorkerTask<MemoryBackend> {
        let (_sender, receiver) = work_channel(1);
        WorkerTask {
            id: 0,
            backend,
            handler,
            receiver,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    #[tokio::test]
    async fn successful_handler_acks_item() {
        let backend = MemoryBackend::new();
        let processing = ProcessingZones::new();
        let lease = Duration::from_secs(30);
        let item = claimed_item(&backend, lease).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let task = worker(
            backend.clone(),
            handler_fn(move |_item| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }),
        );

        let outcome = task.process(work(item, &processing, lease)).await;
        assert_eq!(outcome, ItemOutcome::Acked);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(backend.items().is_empty());
        assert!(processing.is_empty());
        assert_eq!(task.stats.snapshot().items_acked, 1);
    }

    #[tokio::test]
    async fn failing_handler_leaves_item_claimed() {
        let backend = MemoryBackend::new();
        let processing = ProcessingZones::new();
        let lease = Duration::from_secs(30);
        let item = claimed_item(&backend, lease).await;
        let task = worker(
            backend.clone(),
            handler_fn(|_item| async { Err::<(), _>(anyhow::anyhow!("boom")) }),
        );

        let outcome = task.process(work(item.clone(), &processing, lease)).await;
        assert_eq!(outcome, ItemOutcome::Failed);
        let stored = backend.items();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].vesting_time, item.vesting_time);
        assert!(!stored[0].is_visible(Utc::now()));
        assert_eq!(task.stats.snapshot().items_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_at_claim_expiry() {
        let backend = MemoryBackend::new();
        let processing = ProcessingZones::new();
        let lease = Duration::from_millis(50);
        let item = claimed_item(&backend, Duration::from_secs(30)).await;
        let task = worker(
            backend.clone(),
            handler_fn(|_item| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                anyhow::Ok(())
            }),
        );

        let outcome = task.process(work(item, &processing, lease)).await;
        assert_eq!(outcome, ItemOutcome::TimedOut);
        assert_eq!(backend.items().len(), 1);
    }

    #[tokio::test]
    async fn lapsed_claim_is_not_processed() {
        let backend = MemoryBackend::new();
        let processing = ProcessingZones::new();
        let item = claimed_item(&backend, Duration::from_secs(30)).await;
        let task = worker(
            backend.clone(),
            handler_fn(|_item| async { Err::<(), _>(anyhow::anyhow!("handler must not run")) }),
        );
        let outcome = task.process(work(item, &processing, Duration::ZERO)).await;
        assert_eq!(outcome, ItemOutcome::Expired);
    }

    #[tokio::test]
    async fn superseded_claim_is_not_deleted() {
        let backend = MemoryBackend::new();
        let processing = ProcessingZones::new();
        let lease = Duration::from_secs(30);
        let mut item = claimed_item(&backend, lease).await;
        item.vesting_time = Some(Utc::now() - ChronoDuration::seconds(60));
        let task = worker(backend.clone(), handler_fn(|_item| async { anyhow::Ok(()) }));
        let outcome = task.process(work(item, &processing, lease)).await;
        assert_eq!(outcome, ItemOutcome::AckMissed);
        assert_eq!(backend.items().len(), 1);
    }
}
