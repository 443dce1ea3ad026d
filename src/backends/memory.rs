//! In-memory backend with the same lease and visibility rules as Postgres.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;

use super::base::{BackendError, BackendResult, LeaseOutcome, QueueBackend};
use crate::exec::ExecContext;
use crate::model::{NewItem, QueueItem, QueueZone};
use crate::query::{DequeueItemsParams, ObtainTopLevelQueueParams, PeekTopLevelQueuesParams};

type ItemKey = (String, i64);

#[derive(Default)]
struct MemoryState {
    zones: BTreeMap<String, QueueZone>,
    items: BTreeMap<ItemKey, QueueItem>,
    next_item_id: i64,
}

/// Backend that keeps queue state in memory for tests or local runs.
///
/// One mutex guards zones and items together, which gives every call the
/// all-or-nothing behaviour of a serializable transaction.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    peek_failure: Arc<Mutex<Option<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent peek fail with `message`.
    pub fn fail_peeks(&self, message: impl Into<String>) {
        *self.peek_failure.lock().expect("peek failure poisoned") = Some(message.into());
    }

    pub fn zones(&self) -> Vec<QueueZone> {
        let state = self.state.lock().expect("memory state poisoned");
        state.zones.values().cloned().collect()
    }

    pub fn zone(&self, queue_zone: &str) -> Option<QueueZone> {
        let state = self.state.lock().expect("memory state poisoned");
        state.zones.get(queue_zone).cloned()
    }

    pub fn items(&self) -> Vec<QueueItem> {
        let state = self.state.lock().expect("memory state poisoned");
        state.items.values().cloned().collect()
    }

    /// Insert or overwrite a zone row as-is.
    pub fn put_zone(&self, zone: QueueZone) {
        let mut state = self.state.lock().expect("memory state poisoned");
        state.zones.insert(zone.queue_zone.clone(), zone);
    }
}

fn check_context(ctx: &ExecContext) -> BackendResult<()> {
    match ctx.err() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn peek_zones(
        &self,
        ctx: &ExecContext,
        params: &PeekTopLevelQueuesParams,
    ) -> BackendResult<Vec<QueueZone>> {
        check_context(ctx)?;
        if let Some(message) = self
            .peek_failure
            .lock()
            .expect("peek failure poisoned")
            .clone()
        {
            return Err(BackendError::Message(message));
        }
        let mut zones: Vec<QueueZone> = {
            let state = self.state.lock().expect("memory state poisoned");
            state
                .zones
                .values()
                .filter(|zone| zone.hash_token == params.hash_token && zone.is_vested(params.now))
                .cloned()
                .collect()
        };
        if params.sequential {
            zones.sort_by(|a, b| {
                (a.vesting_time, &a.queue_zone).cmp(&(b.vesting_time, &b.queue_zone))
            });
        } else {
            zones.shuffle(&mut rand::thread_rng());
        }
        zones.truncate(params.limit.max(0) as usize);
        Ok(zones)
    }

    async fn select_vested_zones(
        &self,
        ctx: &ExecContext,
        hash_token: i64,
        now: DateTime<Utc>,
    ) -> BackendResult<Vec<QueueZone>> {
        check_context(ctx)?;
        let state = self.state.lock().expect("memory state poisoned");
        let mut zones: Vec<QueueZone> = state
            .zones
            .values()
            .filter(|zone| zone.hash_token == hash_token && zone.is_vested(now))
            .cloned()
            .collect();
        zones.sort_by(|a, b| (a.vesting_time, &a.queue_zone).cmp(&(b.vesting_time, &b.queue_zone)));
        Ok(zones)
    }

    async fn obtain_lease(
        &self,
        ctx: &ExecContext,
        params: &ObtainTopLevelQueueParams,
    ) -> BackendResult<LeaseOutcome> {
        check_context(ctx)?;
        let mut state = self.state.lock().expect("memory state poisoned");
        let Some(zone) = state.zones.get_mut(&params.queue_zone) else {
            return Ok(LeaseOutcome::Missed);
        };
        if zone.lease_id != params.known_lease {
            return Ok(LeaseOutcome::Missed);
        }
        zone.lease_id = Some(params.new_lease);
        zone.vesting_time = params.vesting_time;
        Ok(LeaseOutcome::Obtained(zone.clone()))
    }

    async fn dequeue_items(
        &self,
        ctx: &ExecContext,
        params: &DequeueItemsParams,
    ) -> BackendResult<Vec<QueueItem>> {
        check_context(ctx)?;
        let mut state = self.state.lock().expect("memory state poisoned");
        let limit = params.limit.max(0) as usize;
        let claimed: Vec<QueueItem> = state
            .items
            .range((params.queue_zone.clone(), i64::MIN)..=(params.queue_zone.clone(), i64::MAX))
            .map(|(_, item)| item)
            .filter(|item| item.is_visible(params.now))
            .take(limit)
            .map(|item| QueueItem {
                vesting_time: Some(params.vesting_time),
                ..item.clone()
            })
            .collect();
        for item in &claimed {
            state
                .items
                .insert((item.queue_zone.clone(), item.id), item.clone());
        }
        Ok(claimed)
    }

    async fn ack_item(&self, ctx: &ExecContext, item: &QueueItem) -> BackendResult<bool> {
        check_context(ctx)?;
        let mut state = self.state.lock().expect("memory state poisoned");
        let key = (item.queue_zone.clone(), item.id);
        match state.items.get(&key) {
            Some(stored) if stored.vesting_time == item.vesting_time => {
                state.items.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn enqueue(&self, ctx: &ExecContext, item: &NewItem) -> BackendResult<QueueItem> {
        check_context(ctx)?;
        let now = Utc::now();
        let mut state = self.state.lock().expect("memory state poisoned");
        state
            .zones
            .entry(item.queue_zone.clone())
            .and_modify(|zone| {
                if zone.lease_id.is_none() || zone.is_vested(now) {
                    zone.vesting_time = zone.vesting_time.min(item.visible_at);
                }
            })
            .or_insert_with(|| QueueZone {
                queue_zone: item.queue_zone.clone(),
                vesting_time: item.visible_at,
                lease_id: None,
                hash_token: item.hash_token,
            });
        state.next_item_id += 1;
        let stored = QueueItem {
            queue_zone: item.queue_zone.clone(),
            id: state.next_item_id,
            payload: item.payload.clone(),
            vesting_time: Some(item.visible_at),
        };
        state
            .items
            .insert((stored.queue_zone.clone(), stored.id), stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;

    const RING: u32 = 63;

    fn obtain(zone: &str, known: Option<Uuid>, new_lease: Uuid) -> ObtainTopLevelQueueParams {
        ObtainTopLevelQueueParams {
            new_lease,
            vesting_time: Utc::now() + Duration::seconds(1),
            queue_zone: zone.to_string(),
            known_lease: known,
        }
    }

    #[tokio::test]
    async fn obtain_lease_is_compare_and_swap() {
        let backend = MemoryBackend::new();
        let ctx = ExecContext::background();
        backend
            .enqueue(&ctx, &NewItem::new("z1", "p", RING))
            .await
            .expect("enqueue");

        let l1 = Uuid::new_v4();
        let first = backend
            .obtain_lease(&ctx, &obtain("z1", None, l1))
            .await
            .expect("first");
        assert!(first.is_obtained());
        let second = backend
            .obtain_lease(&ctx, &obtain("z1", None, Uuid::new_v4()))
            .await
            .expect("second");
        assert_eq!(second, LeaseOutcome::Missed);
        let chained = backend
            .obtain_lease(&ctx, &obtain("z1", Some(l1), Uuid::new_v4()))
            .await
            .expect("chained");
        assert!(chained.is_obtained());
    }

    #[tokio::test]
    async fn dequeue_claims_in_id_order_and_ack_needs_current_claim() {
        let backend = MemoryBackend::new();
        let ctx = ExecContext::background();
        let past = Utc::now() - Duration::seconds(1);
        for payload in ["a", "b", "c"] {
            backend
                .enqueue(&ctx, &NewItem::new("z1", payload, RING).visible_at(past))
                .await
                .expect("enqueue");
        }
        let now = Utc::now();
        let params = DequeueItemsParams {
            queue_zone: "z1".to_string(),
            limit: 2,
            now,
            vesting_time: now + Duration::seconds(5),
        };
        let items = backend.dequeue_items(&ctx, &params).await.expect("dequeue");
        assert_eq!(
            items.iter().map(|item| item.payload.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        let mut stale = items[0].clone();
        stale.vesting_time = Some(past);
        assert!(!backend.ack_item(&ctx, &stale).await.expect("stale ack"));
        assert!(backend.ack_item(&ctx, &items[0]).await.expect("ack"));

        // b is still claimed, only c is visible.
        let rest = backend.dequeue_items(&ctx, &params).await.expect("rest");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload, "c");

        // Once the claim lapses, b comes back.
        let later = DequeueItemsParams {
            now: now + Duration::seconds(6),
            vesting_time: now + Duration::seconds(11),
            ..params
        };
        let redelivered = backend.dequeue_items(&ctx, &later).await.expect("redeliver");
        assert_eq!(
            redelivered
                .iter()
                .map(|item| item.payload.as_str())
                .collect::<Vec<_>>(),
            vec!["b", "c"]
        );
    }

    #[tokio::test]
    async fn enqueue_respects_live_lease() {
        let backend = MemoryBackend::new();
        let ctx = ExecContext::background();
        let later = Utc::now() + Duration::seconds(30);
        backend
            .enqueue(&ctx, &NewItem::new("z1", "delayed", RING).visible_at(later))
            .await
            .expect("enqueue delayed");
        assert_eq!(backend.zone("z1").expect("zone").vesting_time, later);

        backend
            .enqueue(&ctx, &NewItem::new("z1", "now", RING))
            .await
            .expect("enqueue now");
        let pulled = backend.zone("z1").expect("zone");
        assert!(pulled.vesting_time < later);

        let lease_until = Utc::now() + Duration::seconds(10);
        backend
            .obtain_lease(
                &ctx,
                &ObtainTopLevelQueueParams {
                    new_lease: Uuid::new_v4(),
                    vesting_time: lease_until,
                    queue_zone: "z1".to_string(),
                    known_lease: None,
                },
            )
            .await
            .expect("lease");
        backend
            .enqueue(&ctx, &NewItem::new("z1", "during lease", RING))
            .await
            .expect("enqueue during lease");
        assert_eq!(backend.zone("z1").expect("zone").vesting_time, lease_until);
        assert_eq!(backend.items().len(), 3);
    }

    #[tokio::test]
    async fn peek_respects_token_vesting_and_limit() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        for (name, token, offset) in [("a", 3, -2), ("b", 3, -1), ("c", 3, 5), ("d", 4, -1)] {
            backend.put_zone(QueueZone {
                queue_zone: name.to_string(),
                vesting_time: now + Duration::seconds(offset),
                lease_id: None,
                hash_token: token,
            });
        }
        let ctx = ExecContext::background();
        let sequential = backend
            .peek_zones(
                &ctx,
                &PeekTopLevelQueuesParams {
                    hash_token: 3,
                    limit: 10,
                    now,
                    sequential: true,
                },
            )
            .await
            .expect("peek");
        assert_eq!(
            sequential
                .iter()
                .map(|zone| zone.queue_zone.as_str())
                .collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        let limited = backend
            .peek_zones(
                &ctx,
                &PeekTopLevelQueuesParams {
                    hash_token: 3,
                    limit: 1,
                    now,
                    sequential: false,
                },
            )
            .await
            .expect("peek random");
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_context_is_reported() {
        let backend = MemoryBackend::new();
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let ctx = ExecContext::with_cancellation(token);
        let err = backend
            .select_vested_zones(&ctx, 0, Utc::now())
            .await
            .expect_err("cancelled");
        assert!(matches!(
            err,
            BackendError::Store(crate::exec::StoreError::Cancelled)
        ));
    }
}
