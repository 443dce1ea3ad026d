//! Configuration for the consumer pipeline and the database connection.
//!
//! Both structs can be built in code (`Default` plus `with_*` options) or
//! loaded from environment variables:
//! - `QUICKQ_DATABASE_URL`: PostgreSQL connection string (required for `DatabaseConfig`)
//! - `QUICKQ_DB_MAX_CONNECTIONS`: pool size (default: 10)
//! - `QUICKQ_DB_ACQUIRE_TIMEOUT_MS`: pool acquire timeout (default: 10000)
//! - `QUICKQ_DB_ATTEMPT_TIMEOUT_MS`: per-attempt budget for store calls (default: 10000)
//! - `QUICKQ_DB_MAX_RETRIES`: transient retries per store call (default: 3)
//! - `QUICKQ_HASH_RING_SIZE`: highest ring token (default: 63)
//! - `QUICKQ_ZONE_LEASE_MS`: zone lease duration (default: 1000)
//! - `QUICKQ_ITEM_LEASE_MS`: item claim duration (default: 30000)
//! - `QUICKQ_SCAN_INTERVAL_MS`: scanner tick (default: 100)
//! - `QUICKQ_SCAN_DEADLINE_MS`: outer deadline of one token scan (default: 10000)
//! - `QUICKQ_MANAGERS`: manager tasks (default: num_cpus)
//! - `QUICKQ_WORKERS`: worker tasks (default: num_cpus)
//! - `QUICKQ_SEQUENTIAL`: scan zones oldest first instead of randomly (default: false)
//! - `QUICKQ_PEEK_MAX`: zones read per token scan (default: 100)
//! - `QUICKQ_SELECTION_FRAC`: keep this fraction of peeked zones (optional)
//! - `QUICKQ_SELECTION_MAX`: cap on kept zones when selecting (default: peek max)
//! - `QUICKQ_PROCESSING_BOUND`: zones in flight per process (default: num_cpus)
//! - `QUICKQ_DEQUEUE_MAX`: items claimed per lease (default: 10)
//! - `QUICKQ_MANAGER_BUFFER`: zone pointer channel capacity (default: 100)
//! - `QUICKQ_WORKER_BUFFER`: item channel capacity (default: dequeue max * workers)

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::exec::{DEFAULT_ATTEMPT_TIMEOUT, RetryPolicy};

pub const DEFAULT_HASH_RING_SIZE: u32 = 63;
pub const DEFAULT_ZONE_LEASE: Duration = Duration::from_secs(1);
pub const DEFAULT_ITEM_LEASE: Duration = Duration::from_secs(30);
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_SCAN_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_PEEK_MAX: usize = 100;
pub const DEFAULT_DEQUEUE_MAX: usize = 10;
pub const DEFAULT_MANAGER_BUFFER: usize = 100;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DB_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("selection_frac must be in (0, 1], got {0}")]
    SelectionFrac(f64),
    #[error("{field} must not exceed {limit}")]
    TooLarge { field: &'static str, limit: String },
}

/// Immutable settings for one [`crate::QueueWorker`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Highest ring token; the ring has `hash_ring_size + 1` slices.
    pub hash_ring_size: u32,
    /// How long an obtained zone lease stays valid.
    pub zone_lease_duration: Duration,
    /// How long a dequeued item stays invisible to other consumers.
    pub item_lease_duration: Duration,
    pub scan_interval: Duration,
    /// Outer deadline for the store calls of one token scan.
    pub scan_deadline: Duration,
    pub manager_routines: usize,
    pub worker_routines: usize,
    pub sequential: bool,
    pub peek_max: usize,
    pub selection_frac: Option<f64>,
    pub selection_max: usize,
    pub processing_bound: usize,
    pub dequeue_max: usize,
    pub manager_recv_buffer: usize,
    pub worker_recv_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            hash_ring_size: DEFAULT_HASH_RING_SIZE,
            zone_lease_duration: DEFAULT_ZONE_LEASE,
            item_lease_duration: DEFAULT_ITEM_LEASE,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            scan_deadline: DEFAULT_SCAN_DEADLINE,
            manager_routines: cpus,
            worker_routines: cpus,
            sequential: false,
            peek_max: DEFAULT_PEEK_MAX,
            selection_frac: None,
            selection_max: DEFAULT_PEEK_MAX,
            processing_bound: cpus,
            dequeue_max: DEFAULT_DEQUEUE_MAX,
            manager_recv_buffer: DEFAULT_MANAGER_BUFFER,
            worker_recv_buffer: DEFAULT_DEQUEUE_MAX * cpus,
        }
    }
}

impl QueueConfig {
    pub fn with_hash_ring_size(mut self, hash_ring_size: u32) -> Self {
        self.hash_ring_size = hash_ring_size;
        self
    }

    pub fn with_zone_lease(mut self, duration: Duration) -> Self {
        self.zone_lease_duration = duration;
        self
    }

    pub fn with_item_lease(mut self, duration: Duration) -> Self {
        self.item_lease_duration = duration;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_scan_deadline(mut self, deadline: Duration) -> Self {
        self.scan_deadline = deadline;
        self
    }

    pub fn with_managers(mut self, managers: usize) -> Self {
        self.manager_routines = managers;
        self
    }

    /// Also resizes the worker channel to `dequeue_max * workers`.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.worker_routines = workers;
        self.worker_recv_buffer = self.dequeue_max.saturating_mul(workers);
        self
    }

    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    pub fn with_peek_max(mut self, peek_max: usize) -> Self {
        self.peek_max = peek_max;
        self
    }

    pub fn with_selection(mut self, frac: f64, max: usize) -> Self {
        self.selection_frac = Some(frac);
        self.selection_max = max;
        self
    }

    pub fn with_processing_bound(mut self, bound: usize) -> Self {
        self.processing_bound = bound;
        self
    }

    /// Also resizes the worker channel to `dequeue_max * workers`.
    pub fn with_dequeue_max(mut self, dequeue_max: usize) -> Self {
        self.dequeue_max = dequeue_max;
        self.worker_recv_buffer = dequeue_max.saturating_mul(self.worker_routines);
        self
    }

    pub fn with_manager_buffer(mut self, capacity: usize) -> Self {
        self.manager_recv_buffer = capacity;
        self
    }

    pub fn with_worker_buffer(mut self, capacity: usize) -> Self {
        self.worker_recv_buffer = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("manager_routines", self.manager_routines),
            ("worker_routines", self.worker_routines),
            ("peek_max", self.peek_max),
            ("processing_bound", self.processing_bound),
            ("dequeue_max", self.dequeue_max),
            ("manager_recv_buffer", self.manager_recv_buffer),
            ("worker_recv_buffer", self.worker_recv_buffer),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        let durations = [
            ("zone_lease_duration", self.zone_lease_duration),
            ("item_lease_duration", self.item_lease_duration),
            ("scan_interval", self.scan_interval),
            ("scan_deadline", self.scan_deadline),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.hash_ring_size > i32::MAX as u32 {
            return Err(ConfigError::TooLarge {
                field: "hash_ring_size",
                limit: i32::MAX.to_string(),
            });
        }
        if let Some(frac) = self.selection_frac {
            if !(frac > 0.0 && frac <= 1.0) {
                return Err(ConfigError::SelectionFrac(frac));
            }
            if self.selection_max == 0 {
                return Err(ConfigError::Zero {
                    field: "selection_max",
                });
            }
        }
        Ok(())
    }

    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys keep their defaults;
    /// set but unparsable keys are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let dequeue_max = parse_or(&lookup, "QUICKQ_DEQUEUE_MAX", defaults.dequeue_max)?;
        let worker_routines = parse_or(&lookup, "QUICKQ_WORKERS", defaults.worker_routines)?;
        let peek_max = parse_or(&lookup, "QUICKQ_PEEK_MAX", defaults.peek_max)?;
        let config = Self {
            hash_ring_size: parse_or(&lookup, "QUICKQ_HASH_RING_SIZE", defaults.hash_ring_size)?,
            zone_lease_duration: millis_or(&lookup, "QUICKQ_ZONE_LEASE_MS", defaults.zone_lease_duration)?,
            item_lease_duration: millis_or(&lookup, "QUICKQ_ITEM_LEASE_MS", defaults.item_lease_duration)?,
            scan_interval: millis_or(&lookup, "QUICKQ_SCAN_INTERVAL_MS", defaults.scan_interval)?,
            scan_deadline: millis_or(&lookup, "QUICKQ_SCAN_DEADLINE_MS", defaults.scan_deadline)?,
            manager_routines: parse_or(&lookup, "QUICKQ_MANAGERS", defaults.manager_routines)?,
            worker_routines,
            sequential: flag_or(&lookup, "QUICKQ_SEQUENTIAL", defaults.sequential),
            peek_max,
            selection_frac: parse_optional(&lookup, "QUICKQ_SELECTION_FRAC")?,
            selection_max: parse_or(&lookup, "QUICKQ_SELECTION_MAX", peek_max)?,
            processing_bound: parse_or(&lookup, "QUICKQ_PROCESSING_BOUND", defaults.processing_bound)?,
            dequeue_max,
            manager_recv_buffer: parse_or(&lookup, "QUICKQ_MANAGER_BUFFER", defaults.manager_recv_buffer)?,
            worker_recv_buffer: parse_or(
                &lookup,
                "QUICKQ_WORKER_BUFFER",
                dequeue_max.saturating_mul(worker_routines),
            )?,
        };
        config.validate().context("invalid queue configuration")?;
        Ok(config)
    }
}

/// Connection settings for the Postgres backend.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Budget for one attempt of a store call, acquisition included.
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
}

impl DatabaseConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_DB_ACQUIRE_TIMEOUT,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("QUICKQ_DATABASE_URL")
            .context("QUICKQ_DATABASE_URL environment variable not set")?;
        let defaults = Self::new(database_url);
        Ok(Self {
            max_connections: parse_or(&lookup, "QUICKQ_DB_MAX_CONNECTIONS", defaults.max_connections)?,
            acquire_timeout: millis_or(&lookup, "QUICKQ_DB_ACQUIRE_TIMEOUT_MS", defaults.acquire_timeout)?,
            attempt_timeout: millis_or(&lookup, "QUICKQ_DB_ATTEMPT_TIMEOUT_MS", defaults.attempt_timeout)?,
            retry: RetryPolicy {
                max_retries: parse_or(&lookup, "QUICKQ_DB_MAX_RETRIES", defaults.retry.max_retries)?,
                ..defaults.retry.clone()
            },
            ..defaults
        })
    }
}

fn parse_optional<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("invalid {key}={raw:?}: {err}")),
        None => Ok(None),
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    Ok(parse_optional(lookup, key)?.unwrap_or(default))
}

fn millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_optional::<F, u64>(lookup, key)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

fn flag_or<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}
