//! Postgres backend for queue coordination.

mod core;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sqlx::PgPool;
use tracing::info;

use super::base::BackendResult;
use crate::config::DatabaseConfig;
use crate::db;
use crate::exec::Executor;
use crate::observability::obs;

/// Coordinate queue zones through Postgres.
///
/// Scans run read-committed; lease, dequeue and enqueue run serializable;
/// acks autocommit.
#[derive(Clone)]
pub struct PostgresBackend {
    executor: Executor,
    query_counts: Arc<Mutex<HashMap<String, usize>>>,
    batch_size_counts: Arc<Mutex<HashMap<String, HashMap<usize, usize>>>>,
}

impl PostgresBackend {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            query_counts: Arc::new(Mutex::new(HashMap::new())),
            batch_size_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Connect, migrate, and wrap the pool with the configured retry policy.
    #[obs]
    pub async fn connect(config: &DatabaseConfig) -> BackendResult<Self> {
        let pool = db::connect(config).await?;
        db::run_migrations(&pool).await?;
        let executor = Executor::new(pool)
            .with_retry(config.retry.clone())
            .with_attempt_timeout(config.attempt_timeout);
        info!(
            max_retries = executor.retry_policy().max_retries,
            attempt_timeout_ms = executor.attempt_timeout().as_millis() as u64,
            "connected to queue store"
        );
        Ok(Self::new(executor))
    }

    pub fn pool(&self) -> &PgPool {
        self.executor.pool()
    }

    pub fn query_counts(&self) -> HashMap<String, usize> {
        self.query_counts
            .lock()
            .expect("query counts poisoned")
            .clone()
    }

    pub fn batch_size_counts(&self) -> HashMap<String, HashMap<usize, usize>> {
        self.batch_size_counts
            .lock()
            .expect("batch size counts poisoned")
            .clone()
    }

    fn count_query(&self, label: &str) {
        let mut guard = self.query_counts.lock().expect("query counts poisoned");
        *guard.entry(label.to_string()).or_insert(0) += 1;
    }

    fn count_batch_size(&self, label: &str, size: usize) {
        if size == 0 {
            return;
        }
        let mut guard = self
            .batch_size_counts
            .lock()
            .expect("batch size counts poisoned");
        let entry = guard.entry(label.to_string()).or_default();
        *entry.entry(size).or_insert(0) += 1;
    }
}
