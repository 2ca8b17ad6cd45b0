//! Progress monitor: a read-only view over the state store.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sw_types::{BatchId, BatchStatus, SwResult, TrialResult};

use crate::store::{JobStateStore, ProgressSnapshot};

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    /// Number of parameter sets in the batch.
    pub total: usize,
    /// Parameter sets whose latest attempt is terminal, whatever the outcome.
    pub completed: usize,
    pub running: usize,
    pub queued: usize,
    /// Failed or timed out.
    pub failed: usize,
    pub succeeded: usize,
    pub cancelled: usize,
    pub percent_complete: f64,
    pub best_result_so_far: Option<TrialResult>,
    /// `None` until at least one job duration has been observed.
    pub eta_seconds: Option<f64>,
    pub peak_running: usize,
}

/// Remaining time: smoothed job duration times queued jobs, spread over the
/// concurrency limit.
pub fn estimate_eta(
    mean_duration_secs: Option<f64>,
    queued: usize,
    max_concurrency: usize,
) -> Option<f64> {
    let mean = mean_duration_secs?;
    Some(mean * queued as f64 / max_concurrency.max(1) as f64)
}

/// Computes status reports from store snapshots. A report copies the batch
/// aggregates under a short `parking_lot` read lock. Writers hold that lock
/// only for the counter update of a single transition and never across an
/// await, so a query waits at most one such update and never waits on a
/// running job or on admission.
#[derive(Debug, Clone)]
pub struct ProgressMonitor {
    store: Arc<JobStateStore>,
}

impl ProgressMonitor {
    pub fn new(store: Arc<JobStateStore>) -> Self {
        Self { store }
    }

    pub fn report(&self, batch_id: BatchId) -> SwResult<StatusReport> {
        let progress = self.store.progress(batch_id)?;
        Ok(Self::from_snapshot(batch_id, progress))
    }

    fn from_snapshot(batch_id: BatchId, progress: ProgressSnapshot) -> StatusReport {
        let counts = progress.counts;
        let completed = counts.terminal();
        let percent_complete = if progress.total_jobs == 0 {
            100.0
        } else {
            completed as f64 * 100.0 / progress.total_jobs as f64
        };

        StatusReport {
            batch_id,
            status: progress.status,
            total: progress.total_jobs,
            completed,
            running: counts.running,
            queued: counts.queued,
            failed: counts.failed + counts.timed_out,
            succeeded: counts.succeeded,
            cancelled: counts.cancelled,
            percent_complete,
            best_result_so_far: progress.best,
            eta_seconds: estimate_eta(
                progress.mean_duration_secs,
                counts.queued,
                progress.max_concurrency,
            ),
            peak_running: progress.peak_running,
        }
    }
}
