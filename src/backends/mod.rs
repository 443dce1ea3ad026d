//! Backend implementations for queue coordination.

mod base;
mod memory;
mod postgres;

pub use base::{BackendError, BackendResult, LeaseOutcome, QueueBackend};
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
