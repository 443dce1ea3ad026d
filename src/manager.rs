//! Lease-acquisition managers.
//!
//! Each manager takes zone pointers off the shared channel, tries to swap
//! in a fresh lease, and on success claims a batch of items for the worker
//! pool.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backends::{LeaseOutcome, QueueBackend};
use crate::config::QueueConfig;
use crate::error::FatalError;
use crate::exec::ExecContext;
use crate::model::{QueueItem, vesting_after};
use crate::observability::obs;
use crate::processing::ZoneClaim;
use crate::query::{DequeueItemsParams, ObtainTopLevelQueueParams};
use crate::scanner::ZonePointer;
use crate::stats::PipelineStats;

/// An item claimed under a zone lease, on its way to a worker.
#[derive(Debug)]
pub struct WorkItem {
    pub item: QueueItem,
    pub lease_id: Uuid,
    /// When the item's claim lapses and another consumer may take it.
    pub claim_expires_at: tokio::time::Instant,
    /// Keeps the zone in the processing set until the whole batch is done.
    pub zone_claim: Arc<ZoneClaim>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneOutcome {
    /// Someone else changed the lease first.
    Missed,
    /// Lease obtained but nothing was visible.
    Empty,
    /// Items handed to the worker pool.
    Dispatched(usize),
}

pub type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

pub struct ManagerTask<B> {
    pub id: usize,
    pub backend: B,
    pub config: Arc<QueueConfig>,
    pub receiver: SharedReceiver<ZonePointer>,
    pub sender: mpsc::Sender<WorkItem>,
    pub stats: Arc<PipelineStats>,
}

impl<B> ManagerTask<B>
where
    B: QueueBackend + Clone + 'static,
{
    pub async fn run(
        self,
        shutdown: tokio_util::sync::WaitForCancellationFutureOwned,
    ) -> Result<(), FatalError> {
        debug!(manager = self.id, "manager started");
        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            let pointer = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!(manager = self.id, "manager shutting down");
                    break;
                }
                pointer = recv_shared(&self.receiver) => match pointer {
                    Some(pointer) => pointer,
                    None => break,
                },
            };
            self.handle_zone(pointer).await?;
        }
        Ok(())
    }

    #[obs]
    pub async fn handle_zone(&self, pointer: ZonePointer) -> Result<ZoneOutcome, FatalError> {
        let ZonePointer { zone, claim } = pointer;
        let fatal = |source| FatalError::Manager {
            manager: self.id,
            queue_zone: zone.queue_zone.clone(),
            source,
        };
        let ctx = ExecContext::background();

        let lease_id = Uuid::new_v4();
        let now = Utc::now();
        let obtain = ObtainTopLevelQueueParams {
            new_lease: lease_id,
            vesting_time: vesting_after(now, self.config.zone_lease_duration),
            queue_zone: zone.queue_zone.clone(),
            known_lease: zone.lease_id,
        };
        match self.backend.obtain_lease(&ctx, &obtain).await.map_err(fatal)? {
            LeaseOutcome::Missed => {
                debug!(
                    queue_zone = %zone.queue_zone,
                    "failed to obtain queue zone (another consumer probably obtained it first)"
                );
                self.stats.record_lease_miss();
                return Ok(ZoneOutcome::Missed);
            }
            LeaseOutcome::Obtained(_) => self.stats.record_lease_obtained(),
        }

        let now = Utc::now();
        let claim_expires_at = tokio::time::Instant::now() + self.config.item_lease_duration;
        let items = self
            .backend
            .dequeue_items(
                &ctx,
                &DequeueItemsParams {
                    queue_zone: zone.queue_zone.clone(),
                    limit: self.config.dequeue_max as i64,
                    now,
                    vesting_time: vesting_after(now, self.config.item_lease_duration),
                },
            )
            .await
            .map_err(fatal)?;
        if items.is_empty() {
            debug!(queue_zone = %zone.queue_zone, "queue zone has no visible items");
            self.stats.record_empty_zone();
            return Ok(ZoneOutcome::Empty);
        }
        self.stats.record_dequeued(items.len() as u64);

        let zone_claim = Arc::new(claim);
        let mut dispatched = 0usize;
        for item in items {
            let work = WorkItem {
                item,
                lease_id,
                claim_expires_at,
                zone_claim: Arc::clone(&zone_claim),
            };
            if self.sender.send(work).await.is_err() {
                warn!(
                    queue_zone = %zone.queue_zone,
                    dispatched,
                    "worker channel closed; remaining items will be redelivered"
                );
                break;
            }
            dispatched += 1;
        }
        Ok(ZoneOutcome::Dispatched(dispatched))
    }
}

pub(crate) async fn recv_shared<T>(receiver: &SharedReceiver<T>) -> Option<T> {
    receiver.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::backends::MemoryBackend;
    use crate::model::{NewItem, QueueZone};
    use crate::processing::ProcessingZones;

    const RING: u32 = 63;

    struct Fixture {
        backend: MemoryBackend,
        processing: ProcessingZones,
        manager: ManagerTask<MemoryBackend>,
        work: mpsc::Receiver<WorkItem>,
    }

    fn fixture(config: QueueConfig) -> Fixture {
        let backend = MemoryBackend::new();
        let (_pointer_tx, pointer_rx) = mpsc::channel(4);
        let (sender, work) = mpsc::channel(64);
        Fixture {
            backend: backend.clone(),
            processing: ProcessingZones::new(),
            manager: ManagerTask {
                id: 0,
                backend,
                config: Arc::new(config),
                receiver: Arc::new(Mutex::new(pointer_rx)),
                sender,
                stats: Arc::new(PipelineStats::default()),
            },
            work,
        }
    }

    fn pointer(fixture: &Fixture, zone: QueueZone) -> ZonePointer {
        let claim = fixture
            .processing
            .try_register(&zone.queue_zone, usize::MAX)
            .expect("claim");
        ZonePointer { zone, claim }
    }

    async fn enqueue(backend: &MemoryBackend, zone: &str, payload: &str) {
        let visible = Utc::now() - ChronoDuration::seconds(1);
        backend
            .enqueue(
                &ExecContext::background(),
                &NewItem::new(zone, payload, RING).visible_at(visible),
            )
            .await
            .expect("enqueue");
    }

    #[tokio::test]
    async fn obtained_zone_dispatches_batch_to_workers() {
        let mut fixture = fixture(QueueConfig::default().with_dequeue_max(2));
        for payload in ["a", "b", "c"] {
            enqueue(&fixture.backend, "z1", payload).await;
        }
        let zone = fixture.backend.zone("z1").expect("zone");
        let outcome = fixture
            .manager
            .handle_zone(pointer(&fixture, zone))
            .await
            .expect("handle");
        assert_eq!(outcome, ZoneOutcome::Dispatched(2));

        let leased = fixture.backend.zone("z1").expect("zone");
        let first = fixture.work.recv().await.expect("first");
        let second = fixture.work.recv().await.expect("second");
        assert_eq!(leased.lease_id, Some(first.lease_id));
        assert_eq!(first.item.payload, "a");
        assert_eq!(second.item.payload, "b");
        assert!(fixture.processing.contains("z1"));

        drop(first);
        assert!(fixture.processing.contains("z1"));
        drop(second);
        assert!(!fixture.processing.contains("z1"));
    }

    #[tokio::test]
    async fn stale_known_lease_is_an_expected_miss() {
        let fixture = fixture(QueueConfig::default());
        enqueue(&fixture.backend, "z1", "a").await;
        let mut zone = fixture.backend.zone("z1").expect("zone");
        zone.lease_id = Some(Uuid::new_v4());

        let outcome = fixture
            .manager
            .handle_zone(pointer(&fixture, zone))
            .await
            .expect("handle");
        assert_eq!(outcome, ZoneOutcome::Missed);
        assert!(!fixture.processing.contains("z1"));
        assert_eq!(fixture.manager.stats.snapshot().lease_misses, 1);
        assert_eq!(fixture.backend.zone("z1").expect("zone").lease_id, None);
    }

    #[tokio::test]
    async fn racing_managers_admit_one_lease() {
        let fixture = fixture(QueueConfig::default());
        enqueue(&fixture.backend, "z1", "a").await;
        let zone = fixture.backend.zone("z1").expect("zone");

        // Two processes each believe they hold the only pointer.
        let other_processing = ProcessingZones::new();
        let first = pointer(&fixture, zone.clone());
        let second = ZonePointer {
            claim: other_processing
                .try_register("z1", usize::MAX)
                .expect("other claim"),
            zone,
        };
        let (left, right) = tokio::join!(
            fixture.manager.handle_zone(first),
            fixture.manager.handle_zone(second)
        );
        let outcomes = [left.expect("left"), right.expect("right")];
        assert_eq!(
            outcomes
                .iter()
                .filter(|outcome| **outcome == ZoneOutcome::Missed)
                .count(),
            1
        );
        assert!(outcomes.contains(&ZoneOutcome::Dispatched(1)));
    }

    #[tokio::test]
    async fn run_exits_when_pointer_channel_closes() {
        let backend = MemoryBackend::new();
        let (pointer_tx, pointer_rx) = mpsc::channel::<ZonePointer>(1);
        let (sender, _work) = mpsc::channel(1);
        let manager = ManagerTask {
            id: 1,
            backend,
            config: Arc::new(QueueConfig::default()),
            receiver: Arc::new(Mutex::new(pointer_rx)),
            sender,
            stats: Arc::new(PipelineStats::default()),
        };
        drop(pointer_tx);
        let shutdown = tokio_util::sync::CancellationToken::new();
        manager
            .run(shutdown.cancelled_owned())
            .await
            .expect("clean exit");
    }

    #[tokio::test]
    async fn empty_zone_releases_claim() {
        let fixture = fixture(QueueConfig::default());
        let zone = QueueZone {
            queue_zone: "idle".to_string(),
            vesting_time: Utc::now() - ChronoDuration::seconds(1),
            lease_id: None,
            hash_token: 0,
        };
        fixture.backend.put_zone(zone.clone());
        let outcome = fixture
            .manager
            .handle_zone(pointer(&fixture, zone))
            .await
            .expect("handle");
        assert_eq!(outcome, ZoneOutcome::Empty);
        assert!(fixture.processing.is_empty());
        assert!(fixture.backend.zone("idle").expect("zone").lease_id.is_some());
    }
}
