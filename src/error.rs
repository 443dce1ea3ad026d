//! Errors that stop the consumer pipeline.

use crate::backends::BackendError;
use crate::config::ConfigError;

/// An unexpected failure in a pipeline stage.
///
/// The first one reported stops every other stage and is returned from
/// [`crate::QueueWorker::wait`].
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("scan of hash token {token} failed: {source}")]
    Scan {
        token: u32,
        #[source]
        source: BackendError,
    },
    #[error("manager {manager} failed on zone {queue_zone}: {source}")]
    Manager {
        manager: usize,
        queue_zone: String,
        #[source]
        source: BackendError,
    },
    #[error("pipeline task panicked: {0}")]
    Panicked(String),
    #[error("invalid queue configuration: {0}")]
    Config(#[from] ConfigError),
}
