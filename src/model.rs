//! Row types for queue zones and queue items, plus the hash-ring mapping.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// A named partition of work. Leasable once `vesting_time` has passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct QueueZone {
    pub queue_zone: String,
    pub vesting_time: DateTime<Utc>,
    /// Last lease written for this zone. Only meaningful while
    /// `vesting_time` is in the future.
    pub lease_id: Option<Uuid>,
    pub hash_token: i64,
}

impl QueueZone {
    pub fn is_vested(&self, now: DateTime<Utc>) -> bool {
        self.vesting_time <= now
    }
}

/// A unit of payload within a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct QueueItem {
    pub queue_zone: String,
    pub id: i64,
    pub payload: String,
    /// `None` or elapsed: visible. Future: claimed by an in-flight consumer.
    pub vesting_time: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.vesting_time.is_none_or(|vesting| vesting <= now)
    }
}

/// Producer-side description of an item to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub queue_zone: String,
    pub hash_token: i64,
    pub payload: String,
    /// Instant from which the item may be dequeued.
    pub visible_at: DateTime<Utc>,
}

impl NewItem {
    /// Item visible immediately, placed on a ring of `ring_size + 1` tokens.
    pub fn new(queue_zone: impl Into<String>, payload: impl Into<String>, ring_size: u32) -> Self {
        let queue_zone = queue_zone.into();
        Self {
            hash_token: hash_token(&queue_zone, ring_size),
            queue_zone,
            payload: payload.into(),
            visible_at: Utc::now(),
        }
    }

    pub fn visible_at(mut self, visible_at: DateTime<Utc>) -> Self {
        self.visible_at = visible_at;
        self
    }
}

/// Map a zone key onto `[0, ring_size]`.
///
/// Uses the first eight bytes of the key's SHA-256 so every process, in any
/// build, agrees on the slice a zone lives in.
pub fn hash_token(queue_zone: &str, ring_size: u32) -> i64 {
    let digest = Sha256::digest(queue_zone.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let slots = u64::from(ring_size) + 1;
    (u64::from_be_bytes(prefix) % slots) as i64
}

/// `now + lease`, saturating at the latest representable instant.
pub fn vesting_after(now: DateTime<Utc>, lease: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Token the scanner visits after `token`.
pub fn next_token(token: u32, ring_size: u32) -> u32 {
    if token >= ring_size { 0 } else { token + 1 }
}
