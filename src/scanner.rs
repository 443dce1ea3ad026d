//! Hash-ring scanner.
//!
//! Visits one ring token per tick, peeks vested zones on that token and
//! offers each to the manager pool without blocking.

use std::sync::Arc;

use chrono::Utc;
use rand::seq::SliceRandom;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::backends::{BackendResult, QueueBackend};
use crate::config::QueueConfig;
use crate::error::FatalError;
use crate::exec::ExecContext;
use crate::model::{QueueZone, next_token};
use crate::observability::obs;
use crate::processing::{ProcessingZones, ZoneClaim};
use crate::query::PeekTopLevelQueuesParams;
use crate::stats::PipelineStats;

/// A vested zone handed to the manager pool, registered in the local
/// processing set for as long as the claim lives.
#[derive(Debug)]
pub struct ZonePointer {
    pub zone: QueueZone,
    pub claim: ZoneClaim,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub peeked: usize,
    /// Zones skipped because this process is already handling them.
    pub in_flight: usize,
    pub sent: usize,
    /// Pointers dropped on a full manager channel.
    pub dropped: usize,
    /// Zones not offered because the processing bound was reached.
    pub bounded: usize,
    pub channel_closed: bool,
}

pub struct ScannerTask<B> {
    pub backend: B,
    pub config: Arc<QueueConfig>,
    pub processing: ProcessingZones,
    pub sender: mpsc::Sender<ZonePointer>,
    pub stats: Arc<PipelineStats>,
}

impl<B> ScannerTask<B>
where
    B: QueueBackend + Clone + 'static,
{
    /// Scan tokens `0, 1, .., ring_size, 0, ..` until shutdown. A slow scan
    /// delays the next tick rather than bunching ticks up.
    pub async fn run(
        self,
        shutdown: tokio_util::sync::WaitForCancellationFutureOwned,
    ) -> Result<(), FatalError> {
        info!(
            ring_size = self.config.hash_ring_size,
            interval_ms = self.config.scan_interval.as_millis() as u64,
            sequential = self.config.sequential,
            "scanner started"
        );
        let mut shutdown = std::pin::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut token = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("scanner shutting down");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let report = self
                .scan_hash_token(token)
                .await
                .map_err(|source| FatalError::Scan { token, source })?;
            if report.channel_closed {
                info!("manager channel closed; scanner exiting");
                break;
            }
            token = next_token(token, self.config.hash_ring_size);
        }
        Ok(())
    }

    #[obs]
    pub async fn scan_hash_token(&self, token: u32) -> BackendResult<ScanReport> {
        let started = std::time::Instant::now();
        let ctx = ExecContext::background().with_timeout(self.config.scan_deadline);
        let zones = self
            .backend
            .peek_zones(
                &ctx,
                &PeekTopLevelQueuesParams {
                    hash_token: i64::from(token),
                    limit: self.config.peek_max as i64,
                    now: Utc::now(),
                    sequential: self.config.sequential,
                },
            )
            .await?;

        let mut report = ScanReport {
            peeked: zones.len(),
            ..ScanReport::default()
        };
        let zones = self
            .processing
            .retain_unprocessed(zones, |zone| zone.queue_zone.as_str());
        report.in_flight = report.peeked - zones.len();
        let zones = select_zones(zones, &self.config);

        let total = zones.len();
        for (index, zone) in zones.into_iter().enumerate() {
            let Some(claim) = self
                .processing
                .try_register(&zone.queue_zone, self.config.processing_bound)
            else {
                if self.processing.len() >= self.config.processing_bound {
                    report.bounded = total - index;
                    break;
                }
                report.in_flight += 1;
                continue;
            };
            match self.sender.try_send(ZonePointer { zone, claim }) {
                Ok(()) => report.sent += 1,
                Err(TrySendError::Full(pointer)) => {
                    debug!(
                        queue_zone = %pointer.zone.queue_zone,
                        "manager channel full; dropping zone pointer"
                    );
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    report.channel_closed = true;
                    break;
                }
            }
        }

        self.stats.record_scan(
            started.elapsed(),
            report.sent as u64,
            report.dropped as u64,
        );
        if report.peeked > 0 {
            debug!(
                token,
                peeked = report.peeked,
                sent = report.sent,
                dropped = report.dropped,
                in_flight = report.in_flight,
                bounded = report.bounded,
                "scanned hash token"
            );
        }
        Ok(report)
    }
}

/// Narrow peeked zones to `ceil(len * selection_frac)`, at most
/// `selection_max`. Sequential scans keep the oldest; others pick at random.
pub fn select_zones(mut zones: Vec<QueueZone>, config: &QueueConfig) -> Vec<QueueZone> {
    let Some(frac) = config.selection_frac else {
        return zones;
    };
    let keep = ((zones.len() as f64 * frac).ceil() as usize)
        .min(config.selection_max)
        .min(zones.len());
    if config.sequential {
        zones.truncate(keep);
        return zones;
    }
    zones.shuffle(&mut rand::thread_rng());
    zones.truncate(keep);
    zones
}
