//! quickq - operate a queue stored in Postgres.
//!
//! Configuration is via environment variables (a `.env` file is read first):
//! - QUICKQ_DATABASE_URL: PostgreSQL connection string (required)
//! - QUICKQ_DB_MAX_CONNECTIONS / QUICKQ_DB_ACQUIRE_TIMEOUT_MS: pool sizing
//! - QUICKQ_HASH_RING_SIZE, QUICKQ_MANAGERS, QUICKQ_WORKERS and the other
//!   QUICKQ_* settings documented in `quickq::config`
//! - RUST_LOG, QUICKQ_DEBUG, QUICKQ_INFO, QUICKQ_LOG_JSON: logging

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::{select, signal};
use tracing::info;

use quickq::query::PeekTopLevelQueuesParams;
use quickq::{
    DatabaseConfig, ExecContext, NewItem, ObservabilityOptions, PostgresBackend, QueueBackend,
    QueueConfig, QueueItem, QueueWorker, handler_fn, init_logging,
};

#[derive(Parser, Debug)]
#[command(name = "quickq", about = "Sharded, lease-coordinated queue")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply the embedded schema migrations
    Migrate,
    /// Add one item to a zone
    Enqueue {
        #[arg(long)]
        zone: String,
        #[arg(long)]
        payload: String,
        /// Keep the item invisible for this long
        #[arg(long, default_value = "0")]
        delay_ms: u64,
    },
    /// Show vested zones on one ring token, as the scanner would see them
    Peek {
        #[arg(long)]
        token: u32,
        #[arg(long, default_value = "100")]
        limit: i64,
    },
    /// Show every vested zone on one ring token
    Vested {
        #[arg(long)]
        token: u32,
    },
    /// Consume items until interrupted, logging each payload
    Run {
        /// Fraction of items to fail on purpose, exercising redelivery
        #[arg(long, default_value = "0.0")]
        fail_rate: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging(ObservabilityOptions::from_env());
    let args = Args::parse();

    let db_config = DatabaseConfig::from_env().context("failed to load database config")?;
    let config = QueueConfig::from_env().context("failed to load queue config")?;
    let backend = PostgresBackend::connect(&db_config)
        .await
        .context("failed to connect to database")?;
    let ctx = ExecContext::background();

    match args.command {
        Command::Migrate => {
            info!("migrations applied");
        }
        Command::Enqueue {
            zone,
            payload,
            delay_ms,
        } => {
            let visible_at = Utc::now()
                + chrono::Duration::from_std(Duration::from_millis(delay_ms))
                    .context("delay out of range")?;
            let item = NewItem::new(zone, payload, config.hash_ring_size).visible_at(visible_at);
            let stored = backend.enqueue(&ctx, &item).await?;
            println!("{}", serde_json::to_string_pretty(&stored)?);
        }
        Command::Peek { token, limit } => {
            let zones = backend
                .peek_zones(
                    &ctx,
                    &PeekTopLevelQueuesParams {
                        hash_token: i64::from(token),
                        limit,
                        now: Utc::now(),
                        sequential: true,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&zones)?);
        }
        Command::Vested { token } => {
            let zones = backend
                .select_vested_zones(&ctx, i64::from(token), Utc::now())
                .await?;
            println!("{}", serde_json::to_string_pretty(&zones)?);
        }
        Command::Run { fail_rate } => run(backend, config, fail_rate).await?,
    }
    Ok(())
}

async fn run(backend: PostgresBackend, config: QueueConfig, fail_rate: f64) -> Result<()> {
    let handler = handler_fn(move |item: QueueItem| async move {
        if fail_rate > 0.0 && rand::random::<f64>() < fail_rate {
            anyhow::bail!("simulated failure for item {}", item.id);
        }
        info!(
            queue_zone = %item.queue_zone,
            item_id = item.id,
            payload = %item.payload,
            "handled item"
        );
        Ok(())
    });

    let worker = QueueWorker::start(backend, config, handler)?;
    let handle = worker.shutdown_handle();
    let mut finished = std::pin::pin!(worker.wait());

    select! {
        result = &mut finished => return result.context("queue worker failed"),
        signal = wait_for_shutdown() => {
            signal?;
            info!("shutdown signal received - stopping queue worker");
            handle.stop();
        }
    }
    finished.await.context("queue worker failed")?;
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut terminate = unix_signal(SignalKind::terminate())?;
        select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received");
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}
