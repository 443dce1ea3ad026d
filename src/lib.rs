//! quickq - a sharded queue coordinated through a relational store.
//!
//! Producers enqueue items into named zones. Consumers scan a hash ring of
//! zone pointers, lease vested zones with a compare-and-swap, claim a batch
//! of items by stamping a vesting time, and delete each item once the
//! handler succeeds. Unacked items reappear when their vesting time passes.

pub mod backends;
pub mod config;
pub mod db;
pub mod error;
pub mod exec;
pub mod manager;
pub mod model;
pub mod observability;
pub mod processing;
pub mod query;
pub mod queue;
pub mod scanner;
pub mod stats;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use backends::{BackendError, LeaseOutcome, MemoryBackend, PostgresBackend, QueueBackend};
pub use config::{ConfigError, DatabaseConfig, QueueConfig};
pub use error::FatalError;
pub use exec::{ExecContext, Executor, IsolationLevel, RetryPolicy, StoreError, StoreResult};
pub use model::{NewItem, QueueItem, QueueZone, hash_token};
pub use observability::{ObservabilityOptions, init_logging, obs};
pub use processing::ProcessingZones;
pub use queue::{QueueWorker, ShutdownHandle};
pub use stats::{PipelineStats, StatsSnapshot};
pub use worker::{ItemHandler, handler_fn};
