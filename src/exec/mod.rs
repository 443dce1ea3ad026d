//! Reliable-execution layer.
//!
//! Every store interaction goes through [`Executor`]: one pooled connection
//! per attempt, acquired under `min(outer deadline, attempt timeout)`,
//! optionally wrapped in a transaction at an explicit isolation level, and
//! retried on transient failures.

mod context;
mod error;
mod retry;

use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::{Connection, PgConnection, PgPool};
use tokio::time::Instant;

use crate::observability::obs;

pub use context::ExecContext;
pub use error::{ErrorClass, StoreError, StoreResult};
pub use retry::{RetryPolicy, retry_with_backoff};

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    Serializable,
    ReadCommitted,
}

impl IsolationLevel {
    pub fn set_statement(self) -> &'static str {
        match self {
            Self::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
            Self::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
        }
    }
}

/// Runs closures against pooled connections with retry and budgeting.
///
/// Closures may run more than once, so they must clone whatever they bind
/// into the returned future.
#[derive(Clone)]
pub struct Executor {
    pool: PgPool,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl Executor {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Run `f` on a bare connection (autocommit).
    #[obs]
    pub async fn exec<T, F>(&self, operation: &'static str, ctx: &ExecContext, f: F) -> StoreResult<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<T>> + Send + Sync,
    {
        self.run(operation, ctx, None, &f).await
    }

    #[obs]
    pub async fn exec_in_serialized_tx<T, F>(
        &self,
        operation: &'static str,
        ctx: &ExecContext,
        f: F,
    ) -> StoreResult<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<T>> + Send + Sync,
    {
        self.run(operation, ctx, Some(IsolationLevel::Serializable), &f)
            .await
    }

    #[obs]
    pub async fn exec_in_read_committed_tx<T, F>(
        &self,
        operation: &'static str,
        ctx: &ExecContext,
        f: F,
    ) -> StoreResult<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<T>> + Send + Sync,
    {
        self.run(operation, ctx, Some(IsolationLevel::ReadCommitted), &f)
            .await
    }

    async fn run<T, F>(
        &self,
        operation: &'static str,
        ctx: &ExecContext,
        isolation: Option<IsolationLevel>,
        f: &F,
    ) -> StoreResult<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<T>> + Send + Sync,
    {
        retry_with_backoff(operation, ctx, &self.retry, || {
            self.attempt(ctx, isolation, f)
        })
        .await
    }

    async fn attempt<T, F>(
        &self,
        ctx: &ExecContext,
        isolation: Option<IsolationLevel>,
        f: &F,
    ) -> StoreResult<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<T>> + Send + Sync,
    {
        let budget = ctx.attempt_budget(self.attempt_timeout);
        if budget.is_zero() {
            return Err(ctx.err().unwrap_or(StoreError::AttemptTimeout(budget)));
        }
        let deadline = Instant::now() + budget;

        let mut conn = match tokio::time::timeout_at(deadline, self.pool.acquire()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => return Err(ctx.err().unwrap_or_else(|| StoreError::from(err))),
            Err(_) => return Err(ctx.err().unwrap_or(StoreError::AcquireTimeout(budget))),
        };

        // Dropping `conn` on any path returns it to the pool; an uncommitted
        // transaction is rolled back first.
        match tokio::time::timeout_at(deadline, run_on_connection(&mut *conn, isolation, f)).await {
            Ok(result) => result,
            Err(_) => Err(ctx.err().unwrap_or(StoreError::AttemptTimeout(budget))),
        }
    }
}

async fn run_on_connection<T, F>(
    conn: &mut PgConnection,
    isolation: Option<IsolationLevel>,
    f: &F,
) -> StoreResult<T>
where
    F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<T>>,
{
    let Some(level) = isolation else {
        return f(conn).await;
    };
    let mut tx = conn.begin().await?;
    sqlx::query(level.set_statement()).execute(&mut *tx).await?;
    let value = f(&mut *tx).await?;
    tx.commit().await?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use serial_test::serial;
    use sqlx::Row;

    use super::*;
    use crate::test_support::postgres_setup;

    #[test]
    fn isolation_statements_name_the_level() {
        assert!(
            IsolationLevel::Serializable
                .set_statement()
                .ends_with("SERIALIZABLE")
        );
        assert!(
            IsolationLevel::ReadCommitted
                .set_statement()
                .ends_with("READ COMMITTED")
        );
    }

    #[tokio::test]
    async fn builders_override_retry_and_attempt_timeout() {
        let pool = PgPool::connect_lazy("postgres://localhost/quickq_unused").expect("lazy pool");
        let executor = Executor::new(pool);
        assert_eq!(executor.retry_policy(), &RetryPolicy::default());
        assert_eq!(executor.attempt_timeout(), DEFAULT_ATTEMPT_TIMEOUT);

        let executor = executor
            .with_retry(RetryPolicy {
                max_retries: 2,
                ..RetryPolicy::default()
            })
            .with_attempt_timeout(Duration::from_millis(250));
        assert_eq!(executor.retry_policy().max_retries, 2);
        assert_eq!(executor.attempt_timeout(), Duration::from_millis(250));
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn serialized_tx_runs_at_serializable_isolation() {
        let Some(pool) = postgres_setup().await else {
            return;
        };
        let executor = Executor::new(pool);
        let level: String = executor
            .exec_in_serialized_tx("isolation_probe", &ExecContext::background(), |conn| {
                async move {
                    let row = sqlx::query("SHOW transaction_isolation")
                        .fetch_one(conn)
                        .await?;
                    Ok(row.get::<String, _>(0))
                }
                .boxed()
            })
            .await
            .expect("isolation probe");
        assert_eq!(level, "serializable");

        let level: String = executor
            .exec_in_read_committed_tx("isolation_probe", &ExecContext::background(), |conn| {
                async move {
                    let row = sqlx::query("SHOW transaction_isolation")
                        .fetch_one(conn)
                        .await?;
                    Ok(row.get::<String, _>(0))
                }
                .boxed()
            })
            .await
            .expect("isolation probe");
        assert_eq!(level, "read committed");
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn no_rows_is_surfaced_without_retry() {
        let Some(pool) = postgres_setup().await else {
            return;
        };
        let executor = Executor::new(pool);
        let result: StoreResult<i64> = executor
            .exec("missing_row", &ExecContext::background(), |conn| {
                async move {
                    let row = sqlx::query("SELECT 1::BIGINT WHERE false")
                        .fetch_one(conn)
                        .await?;
                    Ok(row.get::<i64, _>(0))
                }
                .boxed()
            })
            .await;
        assert!(matches!(result, Err(StoreError::NoRows)));
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn cancelled_context_fails_before_acquiring() {
        let Some(pool) = postgres_setup().await else {
            return;
        };
        let executor = Executor::new(pool);
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let result: StoreResult<()> = executor
            .exec("cancelled", &ExecContext::with_cancellation(token), |_conn| {
                async move { Ok(()) }.boxed()
            })
            .await;
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }
}
