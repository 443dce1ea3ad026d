//! Shared Postgres fixture for store-level tests.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio::sync::OnceCell;

use crate::db;

const DATABASE_URL_ENV: &str = "QUICKQ_DATABASE_URL";
const POOL_MAX_CONNECTIONS: u32 = 8;
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(15);

static MIGRATED: OnceCell<()> = OnceCell::const_new();

/// Connect to the test database with empty queue tables, or `None` when
/// `QUICKQ_DATABASE_URL` is unset.
pub async fn postgres_setup() -> Option<PgPool> {
    let Ok(database_url) = env::var(DATABASE_URL_ENV) else {
        eprintln!("skipping test: {DATABASE_URL_ENV} not set");
        return None;
    };
    let pool = connect_pool(&database_url)
        .await
        .unwrap_or_else(|err| panic!("postgres_setup connect failed: {err:#}"));
    MIGRATED
        .get_or_init(|| async {
            db::run_migrations(&pool)
                .await
                .unwrap_or_else(|err| panic!("postgres_setup migrations failed: {err}"))
        })
        .await;
    truncate_tables(&pool)
        .await
        .unwrap_or_else(|err| panic!("postgres_setup truncate failed: {err:#}"));
    Some(pool)
}

async fn connect_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await
        .with_context(|| format!("connect to {DATABASE_URL_ENV}"))
}

async fn truncate_tables(pool: &PgPool) -> Result<()> {
    sqlx::query("TRUNCATE quick_queue_item, quick_top_level_queue RESTART IDENTITY CASCADE")
        .execute(pool)
        .await
        .context("truncate queue tables")?;
    Ok(())
}
