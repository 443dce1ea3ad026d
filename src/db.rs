//! Database helpers shared across the backend and the CLI.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::exec::{StoreError, StoreResult};

/// Build a pool from `config`. Fails if the first connection cannot be
/// established.
pub async fn connect(config: &DatabaseConfig) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await?;
    Ok(pool)
}

/// Run the embedded SQLx migrations.
pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!()
        .run(pool)
        .await
        .map_err(|err| StoreError::Message(err.to_string()))?;
    Ok(())
}
