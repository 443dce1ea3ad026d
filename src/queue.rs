//! Pipeline lifecycle: start every stage, supervise, stop once.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backends::QueueBackend;
use crate::config::QueueConfig;
use crate::error::FatalError;
use crate::manager::ManagerTask;
use crate::processing::ProcessingZones;
use crate::scanner::ScannerTask;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::worker::{ItemHandler, WorkerTask, work_channel};

/// Cloneable stop switch for a running [`QueueWorker`].
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    stopping: Arc<AtomicBool>,
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal every stage to stop. Returns `true` only for the caller that
    /// flipped the flag; later calls are no-ops.
    pub fn stop(&self) -> bool {
        if self
            .stopping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        info!("queue worker stopping");
        self.token.cancel();
        true
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn signal(&self) -> tokio_util::sync::WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }
}

/// A running consumer: one scanner, a manager pool and a worker pool.
pub struct QueueWorker {
    config: Arc<QueueConfig>,
    processing: ProcessingZones,
    stats: Arc<PipelineStats>,
    shutdown: ShutdownHandle,
    tasks: JoinSet<Result<(), FatalError>>,
}

impl QueueWorker {
    /// Spawn the pipeline on the current tokio runtime.
    pub fn start<B>(
        backend: B,
        config: QueueConfig,
        handler: Arc<dyn ItemHandler>,
    ) -> Result<Self, FatalError>
    where
        B: QueueBackend + Clone + 'static,
    {
        config.validate()?;
        let config = Arc::new(config);
        let processing = ProcessingZones::new();
        let stats = Arc::new(PipelineStats::default());
        let shutdown = ShutdownHandle::new();
        let mut tasks = JoinSet::new();

        let (pointer_tx, pointer_rx) = mpsc::channel(config.manager_recv_buffer);
        let pointer_rx = Arc::new(Mutex::new(pointer_rx));
        let (work_tx, work_rx) = work_channel(config.worker_recv_buffer);

        let scanner = ScannerTask {
            backend: backend.clone(),
            config: Arc::clone(&config),
            processing: processing.clone(),
            sender: pointer_tx,
            stats: Arc::clone(&stats),
        };
        tasks.spawn(scanner.run(shutdown.signal()));

        for id in 0..config.manager_routines {
            let manager = ManagerTask {
                id,
                backend: backend.clone(),
                config: Arc::clone(&config),
                receiver: Arc::clone(&pointer_rx),
                sender: work_tx.clone(),
                stats: Arc::clone(&stats),
            };
            tasks.spawn(manager.run(shutdown.signal()));
        }
        drop(work_tx);

        for id in 0..config.worker_routines {
            let worker = WorkerTask {
                id,
                backend: backend.clone(),
                handler: Arc::clone(&handler),
                receiver: Arc::clone(&work_rx),
                stats: Arc::clone(&stats),
            };
            tasks.spawn(worker.run(shutdown.signal()));
        }

        info!(
            managers = config.manager_routines,
            workers = config.worker_routines,
            ring_size = config.hash_ring_size,
            "queue worker started"
        );
        Ok(Self {
            config,
            processing,
            stats,
            shutdown,
            tasks,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn stop(&self) -> bool {
        self.shutdown.stop()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn processing(&self) -> &ProcessingZones {
        &self.processing
    }

    /// Run until every stage has exited. The first fatal error stops the
    /// rest of the pipeline and is returned once they have drained.
    pub async fn wait(mut self) -> Result<(), FatalError> {
        let mut first: Option<FatalError> = None;
        while let Some(joined) = self.tasks.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(join_err) if join_err.is_cancelled() => continue,
                Err(join_err) => FatalError::Panicked(panic_message(join_err)),
            };
            error!(error = %err, "pipeline stage failed");
            self.shutdown.stop();
            first.get_or_insert(err);
        }
        let stats = self.stats.snapshot();
        info!(
            scan_latency = %stats.scan_latency.format(),
            handler_latency = %stats.handler_latency.format(),
            stats = ?stats,
            "queue worker stopped"
        );
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn panic_message(err: JoinError) -> String {
    let payload: Box<dyn Any + Send> = match err.try_into_panic() {
        Ok(payload) => payload,
        Err(err) => return err.to_string(),
    };
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
