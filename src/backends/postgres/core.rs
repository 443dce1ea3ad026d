use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;

use super::PostgresBackend;
use crate::backends::base::{BackendResult, LeaseOutcome, QueueBackend};
use crate::exec::ExecContext;
use crate::model::{NewItem, QueueItem, QueueZone};
use crate::observability::obs;
use crate::query::{
    DequeueItemsParams, ObtainTopLevelQueueParams, PeekTopLevelQueuesParams, Queries,
    UpsertTopLevelQueueParams,
};

impl PostgresBackend {
    #[obs]
    async fn peek_zones_impl(
        &self,
        ctx: &ExecContext,
        params: &PeekTopLevelQueuesParams,
    ) -> BackendResult<Vec<QueueZone>> {
        self.count_query("select:peek_top_level_queues");
        let zones = self
            .executor
            .exec_in_read_committed_tx("peek_top_level_queues", ctx, |conn| {
                let params = params.clone();
                async move { Queries::new(conn).peek_top_level_queues(&params).await }.boxed()
            })
            .await?;
        self.count_batch_size("select:peek_top_level_queues", zones.len());
        Ok(zones)
    }

    #[obs]
    async fn select_vested_zones_impl(
        &self,
        ctx: &ExecContext,
        hash_token: i64,
        now: DateTime<Utc>,
    ) -> BackendResult<Vec<QueueZone>> {
        self.count_query("select:vested_top_level_queues");
        let zones = self
            .executor
            .exec_in_read_committed_tx("select_vested_top_level_queues", ctx, |conn| {
                async move {
                    Queries::new(conn)
                        .select_vested_top_level_queues(hash_token, now)
                        .await
                }
                .boxed()
            })
            .await?;
        Ok(zones)
    }

    #[obs]
    async fn obtain_lease_impl(
        &self,
        ctx: &ExecContext,
        params: &ObtainTopLevelQueueParams,
    ) -> BackendResult<LeaseOutcome> {
        self.count_query("update:obtain_top_level_queue");
        let result = self
            .executor
            .exec_in_serialized_tx("obtain_top_level_queue", ctx, |conn| {
                let params = params.clone();
                async move { Queries::new(conn).obtain_top_level_queue(&params).await }.boxed()
            })
            .await;
        match result {
            Ok(zone) => Ok(LeaseOutcome::Obtained(zone)),
            Err(err) if err.is_expected_miss() => Ok(LeaseOutcome::Missed),
            Err(err) => Err(err.into()),
        }
    }

    #[obs]
    async fn dequeue_items_impl(
        &self,
        ctx: &ExecContext,
        params: &DequeueItemsParams,
    ) -> BackendResult<Vec<QueueItem>> {
        self.count_query("update:dequeue_items");
        let result = self
            .executor
            .exec_in_serialized_tx("dequeue_items", ctx, |conn| {
                let params = params.clone();
                async move { Queries::new(conn).dequeue_items(&params).await }.boxed()
            })
            .await;
        match result {
            Ok(items) => {
                self.count_batch_size("update:dequeue_items", items.len());
                Ok(items)
            }
            Err(err) if err.is_expected_miss() => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    #[obs]
    async fn ack_item_impl(&self, ctx: &ExecContext, item: &QueueItem) -> BackendResult<bool> {
        self.count_query("delete:queue_item");
        let result = self
            .executor
            .exec("delete_item", ctx, |conn| {
                let queue_zone = item.queue_zone.clone();
                let (id, vesting_time) = (item.id, item.vesting_time);
                async move {
                    Queries::new(conn)
                        .delete_item(&queue_zone, id, vesting_time)
                        .await
                }
                .boxed()
            })
            .await;
        match result {
            Ok(()) => Ok(true),
            Err(err) if err.is_expected_miss() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    #[obs]
    async fn enqueue_impl(&self, ctx: &ExecContext, item: &NewItem) -> BackendResult<QueueItem> {
        self.count_query("insert:queue_item");
        let inserted = self
            .executor
            .exec_in_serialized_tx("enqueue", ctx, |conn| {
                let item = item.clone();
                async move {
                    let upsert = UpsertTopLevelQueueParams {
                        queue_zone: item.queue_zone.clone(),
                        vesting_time: item.visible_at,
                        hash_token: item.hash_token,
                        now: Utc::now(),
                    };
                    match Queries::new(&mut *conn).upsert_top_level_queue(&upsert).await {
                        // A live lease keeps its vesting time; the item waits for it.
                        Err(err) if err.is_expected_miss() => {}
                        other => {
                            other?;
                        }
                    }
                    Queries::new(conn)
                        .insert_queue_item(&item.queue_zone, &item.payload, item.visible_at)
                        .await
                }
                .boxed()
            })
            .await?;
        Ok(inserted)
    }
}

#[async_trait]
impl QueueBackend for PostgresBackend {
    async fn peek_zones(
        &self,
        ctx: &ExecContext,
        params: &PeekTopLevelQueuesParams,
    ) -> BackendResult<Vec<QueueZone>> {
        self.peek_zones_impl(ctx, params).await
    }

    async fn select_vested_zones(
        &self,
        ctx: &ExecContext,
        hash_token: i64,
        now: DateTime<Utc>,
    ) -> BackendResult<Vec<QueueZone>> {
        self.select_vested_zones_impl(ctx, hash_token, now).await
    }

    async fn obtain_lease(
        &self,
        ctx: &ExecContext,
        params: &ObtainTopLevelQueueParams,
    ) -> BackendResult<LeaseOutcome> {
        self.obtain_lease_impl(ctx, params).await
    }

    async fn dequeue_items(
        &self,
        ctx: &ExecContext,
        params: &DequeueItemsParams,
    ) -> BackendResult<Vec<QueueItem>> {
        self.dequeue_items_impl(ctx, params).await
    }

    async fn ack_item(&self, ctx: &ExecContext, item: &QueueItem) -> BackendResult<bool> {
        self.ack_item_impl(ctx, item).await
    }

    async fn enqueue(&self, ctx: &ExecContext, item: &NewItem) -> BackendResult<QueueItem> {
        self.enqueue_impl(ctx, item).await
    }
}
