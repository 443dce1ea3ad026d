//! Typed statements against the queue tables.
//!
//! Conditional statements that match nothing return [`StoreError::NoRows`]
//! rather than an empty value, so callers can tell a lost race from a
//! successful no-op.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::exec::{StoreError, StoreResult};
use crate::model::{QueueItem, QueueZone};

const ZONE_COLUMNS: &str = "queue_zone, vesting_time, lease_id, hash_token";

const OBTAIN_TOP_LEVEL_QUEUE: &str = r#"
UPDATE quick_top_level_queue
SET lease_id = $1,
    vesting_time = $2
WHERE queue_zone = $3
  AND lease_id IS NOT DISTINCT FROM $4
RETURNING queue_zone, vesting_time, lease_id, hash_token
"#;

const DEQUEUE_ITEMS: &str = r#"
UPDATE quick_queue_item AS item
SET vesting_time = $4
FROM (
    SELECT queue_zone, id
    FROM quick_queue_item
    WHERE queue_zone = $1
      AND (vesting_time IS NULL OR vesting_time <= $3)
    ORDER BY id
    LIMIT $2
) AS visible
WHERE item.queue_zone = visible.queue_zone
  AND item.id = visible.id
RETURNING item.queue_zone, item.id, item.payload, item.vesting_time
"#;

const DELETE_ITEM: &str = r#"
DELETE FROM quick_queue_item
WHERE queue_zone = $1
  AND id = $2
  AND vesting_time IS NOT DISTINCT FROM $3
"#;

const UPSERT_TOP_LEVEL_QUEUE: &str = r#"
INSERT INTO quick_top_level_queue (queue_zone, vesting_time, hash_token)
VALUES ($1, $2, $3)
ON CONFLICT (queue_zone) DO UPDATE
SET vesting_time = LEAST(quick_top_level_queue.vesting_time, EXCLUDED.vesting_time)
WHERE quick_top_level_queue.lease_id IS NULL
   OR quick_top_level_queue.vesting_time <= $4
RETURNING queue_zone, vesting_time, lease_id, hash_token
"#;

const INSERT_QUEUE_ITEM: &str = r#"
INSERT INTO quick_queue_item (queue_zone, payload, vesting_time)
VALUES ($1, $2, $3)
RETURNING queue_zone, id, payload, vesting_time
"#;

/// Compare-and-swap of a zone's lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObtainTopLevelQueueParams {
    pub new_lease: Uuid,
    pub vesting_time: DateTime<Utc>,
    pub queue_zone: String,
    /// Lease observed when the zone was peeked. `None` matches a NULL lease.
    pub known_lease: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeueItemsParams {
    pub queue_zone: String,
    pub limit: i64,
    pub now: DateTime<Utc>,
    /// Claim stamped on every returned item.
    pub vesting_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeekTopLevelQueuesParams {
    pub hash_token: i64,
    pub limit: i64,
    pub now: DateTime<Utc>,
    pub sequential: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertTopLevelQueueParams {
    pub queue_zone: String,
    pub vesting_time: DateTime<Utc>,
    pub hash_token: i64,
    pub now: DateTime<Utc>,
}

/// Statements bound to one connection or open transaction.
pub struct Queries<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> Queries<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    pub async fn obtain_top_level_queue(
        self,
        params: &ObtainTopLevelQueueParams,
    ) -> StoreResult<QueueZone> {
        let zone = sqlx::query_as::<_, QueueZone>(OBTAIN_TOP_LEVEL_QUEUE)
            .bind(params.new_lease)
            .bind(params.vesting_time)
            .bind(&params.queue_zone)
            .bind(params.known_lease)
            .fetch_one(self.conn)
            .await?;
        Ok(zone)
    }

    pub async fn dequeue_items(self, params: &DequeueItemsParams) -> StoreResult<Vec<QueueItem>> {
        let mut items = sqlx::query_as::<_, QueueItem>(DEQUEUE_ITEMS)
            .bind(&params.queue_zone)
            .bind(params.limit)
            .bind(params.now)
            .bind(params.vesting_time)
            .fetch_all(self.conn)
            .await?;
        if items.is_empty() {
            return Err(StoreError::NoRows);
        }
        // UPDATE ... RETURNING carries no ordering guarantee.
        items.sort_by_key(|item| item.id);
        Ok(items)
    }

    pub async fn peek_top_level_queues(
        self,
        params: &PeekTopLevelQueuesParams,
    ) -> StoreResult<Vec<QueueZone>> {
        let order = if params.sequential {
            "vesting_time, queue_zone"
        } else {
            "random()"
        };
        let sql = format!(
            "SELECT {ZONE_COLUMNS} FROM quick_top_level_queue \
             WHERE hash_token = $1 AND vesting_time <= $2 \
             ORDER BY {order} LIMIT $3"
        );
        let zones = sqlx::query_as::<_, QueueZone>(&sql)
            .bind(params.hash_token)
            .bind(params.now)
            .bind(params.limit)
            .fetch_all(self.conn)
            .await?;
        Ok(zones)
    }

    pub async fn select_vested_top_level_queues(
        self,
        hash_token: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<QueueZone>> {
        let sql = format!(
            "SELECT {ZONE_COLUMNS} FROM quick_top_level_queue \
             WHERE hash_token = $1 AND vesting_time <= $2 \
             ORDER BY vesting_time, queue_zone"
        );
        let zones = sqlx::query_as::<_, QueueZone>(&sql)
            .bind(hash_token)
            .bind(now)
            .fetch_all(self.conn)
            .await?;
        Ok(zones)
    }

    /// Ack: delete only while the item still carries the claim we stamped.
    pub async fn delete_item(
        self,
        queue_zone: &str,
        id: i64,
        vesting_time: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let result = sqlx::query(DELETE_ITEM)
            .bind(queue_zone)
            .bind(id)
            .bind(vesting_time)
            .execute(self.conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NoRows);
        }
        Ok(())
    }

    /// Create the zone pointer, or pull its vesting time forward while no
    /// live lease holds it. Returns `NoRows` when a live lease blocked the
    /// update.
    pub async fn upsert_top_level_queue(
        self,
        params: &UpsertTopLevelQueueParams,
    ) -> StoreResult<QueueZone> {
        let zone = sqlx::query_as::<_, QueueZone>(UPSERT_TOP_LEVEL_QUEUE)
            .bind(&params.queue_zone)
            .bind(params.vesting_time)
            .bind(params.hash_token)
            .bind(params.now)
            .fetch_one(self.conn)
            .await?;
        Ok(zone)
    }

    pub async fn insert_queue_item(
        self,
        queue_zone: &str,
        payload: &str,
        visible_at: DateTime<Utc>,
    ) -> StoreResult<QueueItem> {
        let item = sqlx::query_as::<_, QueueItem>(INSERT_QUEUE_ITEM)
            .bind(queue_zone)
            .bind(payload)
            .bind(visible_at)
            .fetch_one(self.conn)
            .await?;
        Ok(item)
    }
}
