//! Job state store: the single source of truth for job and batch lifecycle.
//!
//! Every status write is a compare-and-set on one job record, applied while
//! holding that record's shard lock. Batch aggregates (status counts, derived
//! status, best result, duration EMA) are updated under the same lock, so a
//! reader never sees counts that disagree with the job table.
//!
//! Lock order is job shard, then batch state. Nothing takes them the other
//! way around.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sw_optimizer::{BatchRequest, ResultAggregator};
use sw_types::{
    internal_error, BatchId, BatchRecord, BatchStatus, JobId, JobRecord, JobStatus, ParameterSet,
    ResultId, StatusCounts, SwError, SwResult, TrialResult,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default smoothing factor for the per-job duration EMA.
pub const DEFAULT_EMA_ALPHA: f64 = 0.2;

/// Emitted for every applied status change and every new job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub batch_id: BatchId,
    pub job_id: JobId,
    pub parameter_index: usize,
    pub attempt: u32,
    /// `None` when the job record was just created.
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    /// Derived batch status after the change.
    pub batch_status: BatchStatus,
    pub at: DateTime<Utc>,
}

/// What a finished job reports back to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Succeeded(TrialResult),
    Failed(String),
    TimedOut(String),
    Cancelled,
}

impl TerminalOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Succeeded(_) => JobStatus::Succeeded,
            Self::Failed(_) => JobStatus::Failed,
            Self::TimedOut(_) => JobStatus::TimedOut,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Point-in-time view of one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSnapshot {
    /// Batch record with the status cache refreshed.
    pub record: BatchRecord,
    pub counts: StatusCounts,
    /// Results of the latest attempt per parameter set, in enumeration order.
    pub results: Vec<TrialResult>,
    pub peak_running: usize,
}

/// The inputs the progress monitor needs, read in one critical section.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub status: BatchStatus,
    pub counts: StatusCounts,
    pub total_jobs: usize,
    pub max_concurrency: usize,
    /// EMA of per-job wall-clock duration; `None` until a job has finished.
    pub mean_duration_secs: Option<f64>,
    pub best: Option<TrialResult>,
    pub peak_running: usize,
}

/// Serialized store contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub batches: Vec<BatchRecord>,
    /// Every job record, grouped by batch in creation order.
    pub jobs: Vec<JobRecord>,
    pub results: Vec<TrialResult>,
}

struct BatchEntry {
    record: BatchRecord,
    aggregator: ResultAggregator,
    state: RwLock<BatchState>,
}

struct BatchState {
    counts: StatusCounts,
    status: BatchStatus,
    /// Latest attempt per parameter set index.
    latest: BTreeMap<usize, JobId>,
    /// Every job record of the batch, in creation order.
    jobs: Vec<JobId>,
    ema_secs: Option<f64>,
    best: Option<TrialResult>,
    peak_running: usize,
    /// Set once any job of the batch has left `Queued`.
    started: bool,
}

impl BatchState {
    fn new() -> Self {
        Self {
            counts: StatusCounts::default(),
            status: BatchStatus::Pending,
            latest: BTreeMap::new(),
            jobs: Vec::new(),
            ema_secs: None,
            best: None,
            peak_running: 0,
            started: false,
        }
    }

    fn refresh_status(&mut self) -> BatchStatus {
        self.status = self.counts.derive_status(self.started);
        self.status
    }

    fn track(&mut self, job: &JobRecord) {
        self.jobs.push(job.id);
        self.latest.insert(job.parameter_set.index, job.id);
    }
}

/// Concurrently-safe storage for every job, batch and result.
pub struct JobStateStore {
    jobs: DashMap<JobId, JobRecord>,
    batches: DashMap<BatchId, Arc<BatchEntry>>,
    results: DashMap<ResultId, TrialResult>,
    subscribers: Mutex<Vec<Sender<JobEvent>>>,
    persist_lock: Mutex<()>,
    ema_alpha: f64,
}

impl Default for JobStateStore {
    fn default() -> Self {
        Self::new(DEFAULT_EMA_ALPHA)
    }
}

impl JobStateStore {
    pub fn new(ema_alpha: f64) -> Self {
        Self {
            jobs: DashMap::new(),
            batches: DashMap::new(),
            results: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
            persist_lock: Mutex::new(()),
            ema_alpha: ema_alpha.clamp(f64::EPSILON, 1.0),
        }
    }

    /// Create a batch and one queued job per parameter set.
    pub fn create_batch(
        &self,
        request: &BatchRequest,
        sets: Vec<ParameterSet>,
    ) -> SwResult<(BatchRecord, Vec<JobRecord>)> {
        let config = serde_json::to_value(request)?;
        let batch_id = Uuid::new_v4();
        let jobs: Vec<JobRecord> = sets
            .into_iter()
            .map(|set| JobRecord::new(batch_id, set))
            .collect();

        let mut state = BatchState::new();
        for job in &jobs {
            state.track(job);
        }
        state.counts.queued = jobs.len();
        state.refresh_status();

        let record = BatchRecord {
            id: batch_id,
            strategy_reference: request.strategy_reference.clone(),
            max_concurrency: request.max_concurrency,
            total_jobs: jobs.len(),
            config,
            status: state.status,
            created_at: Utc::now(),
        };

        for job in &jobs {
            self.jobs.insert(job.id, job.clone());
        }
        self.batches.insert(
            batch_id,
            Arc::new(BatchEntry {
                record: record.clone(),
                aggregator: request.aggregator(),
                state: RwLock::new(state),
            }),
        );

        info!(
            batch_id = %batch_id,
            strategy = %record.strategy_reference,
            jobs = record.total_jobs,
            "batch created"
        );
        for job in &jobs {
            self.publish(JobEvent {
                batch_id,
                job_id: job.id,
                parameter_index: job.parameter_set.index,
                attempt: job.attempt,
                from: None,
                to: JobStatus::Queued,
                batch_status: record.status,
                at: job.created_at,
            });
        }
        Ok((record, jobs))
    }

    fn entry(&self, batch_id: BatchId) -> SwResult<Arc<BatchEntry>> {
        self.batches
            .get(&batch_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(SwError::BatchNotFound { batch_id })
    }

    pub fn job(&self, job_id: JobId) -> SwResult<JobRecord> {
        self.jobs
            .get(&job_id)
            .map(|j| j.value().clone())
            .ok_or(SwError::JobNotFound { job_id })
    }

    pub fn contains_batch(&self, batch_id: BatchId) -> bool {
        self.batches.contains_key(&batch_id)
    }

    pub fn batch_ids(&self) -> Vec<BatchId> {
        self.batches.iter().map(|e| *e.key()).collect()
    }

    /// Every job record of a batch, retries included, in creation order.
    pub fn batch_jobs(&self, batch_id: BatchId) -> SwResult<Vec<JobRecord>> {
        let ids = self.entry(batch_id)?.state.read().jobs.clone();
        Ok(self.collect_jobs(&ids))
    }

    /// Latest attempt per parameter set, in enumeration order.
    pub fn latest_jobs(&self, batch_id: BatchId) -> SwResult<Vec<JobRecord>> {
        let ids: Vec<JobId> = self
            .entry(batch_id)?
            .state
            .read()
            .latest
            .values()
            .copied()
            .collect();
        Ok(self.collect_jobs(&ids))
    }

    fn collect_jobs(&self, ids: &[JobId]) -> Vec<JobRecord> {
        ids.iter()
            .filter_map(|id| self.jobs.get(id).map(|j| j.value().clone()))
            .collect()
    }

    pub fn aggregator(&self, batch_id: BatchId) -> SwResult<ResultAggregator> {
        Ok(self.entry(batch_id)?.aggregator.clone())
    }

    /// Per-status counts plus every terminal result so far.
    pub fn batch(&self, batch_id: BatchId) -> SwResult<BatchSnapshot> {
        let entry = self.entry(batch_id)?;
        let (counts, status, peak_running, latest) = {
            let state = entry.state.read();
            let latest: Vec<JobId> = state.latest.values().copied().collect();
            (state.counts, state.status, state.peak_running, latest)
        };

        let results = latest
            .iter()
            .filter_map(|id| self.jobs.get(id).and_then(|j| j.result_id))
            .filter_map(|rid| self.results.get(&rid).map(|r| r.value().clone()))
            .collect();

        let mut record = entry.record.clone();
        record.status = status;
        Ok(BatchSnapshot {
            record,
            counts,
            results,
            peak_running,
        })
    }

    /// Copy of the batch aggregates, taken under the batch read lock. The
    /// copy is detached, so callers never hold store locks.
    pub fn progress(&self, batch_id: BatchId) -> SwResult<ProgressSnapshot> {
        let entry = self.entry(batch_id)?;
        let state = entry.state.read();
        Ok(ProgressSnapshot {
            status: state.status,
            counts: state.counts,
            total_jobs: entry.record.total_jobs,
            max_concurrency: entry.record.max_concurrency,
            mean_duration_secs: state.ema_secs,
            best: state.best.clone(),
            peak_running: state.peak_running,
        })
    }

    pub fn result(&self, result_id: ResultId) -> Option<TrialResult> {
        self.results.get(&result_id).map(|r| r.value().clone())
    }

    /// Compare-and-set a job's status. Returns `Ok(false)` when the job is no
    /// longer in `expected`.
    pub fn try_transition(
        &self,
        job_id: JobId,
        expected: JobStatus,
        next: JobStatus,
    ) -> SwResult<bool> {
        self.transition(job_id, expected, next, |_, _, _| {})
    }

    /// Record a running job's terminal outcome. A second completion for the
    /// same job is ignored and returns `Ok(false)`.
    pub fn complete(
        &self,
        job_id: JobId,
        outcome: TerminalOutcome,
        elapsed: Duration,
    ) -> SwResult<bool> {
        let next = outcome.status();
        let alpha = self.ema_alpha;
        let applied = self.transition(job_id, JobStatus::Running, next, |job, state, aggregator| {
            match outcome {
                TerminalOutcome::Succeeded(result) => {
                    job.result_id = Some(result.id);
                    if aggregator.is_better(&result, state.best.as_ref()) {
                        state.best = Some(result.clone());
                    }
                    self.results.insert(result.id, result);
                }
                TerminalOutcome::Failed(diagnostic) | TerminalOutcome::TimedOut(diagnostic) => {
                    job.diagnostic = Some(diagnostic);
                }
                TerminalOutcome::Cancelled => {}
            }
            if next != JobStatus::Cancelled {
                let secs = elapsed.as_secs_f64();
                state.ema_secs = Some(match state.ema_secs {
                    Some(prev) => alpha * secs + (1.0 - alpha) * prev,
                    None => secs,
                });
            }
        })?;

        if !applied {
            debug!(job_id = %job_id, status = %next, "ignoring duplicate completion");
        }
        Ok(applied)
    }

    fn transition<F>(
        &self,
        job_id: JobId,
        expected: JobStatus,
        next: JobStatus,
        update: F,
    ) -> SwResult<bool>
    where
        F: FnOnce(&mut JobRecord, &mut BatchState, &ResultAggregator),
    {
        if !expected.can_transition_to(next) {
            return Err(internal_error!("illegal job transition {expected} -> {next}"));
        }
        let batch_id = self
            .jobs
            .get(&job_id)
            .map(|j| j.batch_id)
            .ok_or(SwError::JobNotFound { job_id })?;
        let entry = self.entry(batch_id)?;

        let event = {
            let mut job = self
                .jobs
                .get_mut(&job_id)
                .ok_or(SwError::JobNotFound { job_id })?;
            if job.status != expected {
                return Ok(false);
            }

            let now = Utc::now();
            job.status = next;
            if next == JobStatus::Running {
                job.admitted_at = Some(now);
            } else if next.is_terminal() {
                job.completed_at = Some(now);
            }

            let mut state = entry.state.write();
            update(&mut *job, &mut *state, &entry.aggregator);
            if state.latest.get(&job.parameter_set.index) == Some(&job_id) {
                state.counts.record_transition(expected, next);
            }
            state.peak_running = state.peak_running.max(state.counts.running);
            state.started |= next == JobStatus::Running;
            state.refresh_status();

            JobEvent {
                batch_id,
                job_id,
                parameter_index: job.parameter_set.index,
                attempt: job.attempt,
                from: Some(expected),
                to: next,
                batch_status: state.status,
                at: now,
            }
        };

        if next.is_terminal() {
            info!(
                batch_id = %batch_id,
                job_id = %job_id,
                index = event.parameter_index,
                status = %next,
                "job finished"
            );
        }
        self.publish(event);
        Ok(true)
    }

    /// Stamp the moment the executor was invoked.
    pub fn mark_started(&self, job_id: JobId) -> SwResult<()> {
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(SwError::JobNotFound { job_id })?;
        if job.status == JobStatus::Running && job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Queue a new attempt for a failed or timed-out job. Returns `None` when
    /// the job is not eligible (not failed, or already superseded).
    pub fn enqueue_retry(&self, prior_id: JobId) -> SwResult<Option<JobRecord>> {
        let prior = self.job(prior_id)?;
        if !matches!(prior.status, JobStatus::Failed | JobStatus::TimedOut) {
            return Ok(None);
        }
        let entry = self.entry(prior.batch_id)?;
        let retry = JobRecord::retry_of(&prior);
        let index = retry.parameter_set.index;

        // Not yet reachable from the batch, so inserting before taking the
        // batch lock keeps the lock order.
        self.jobs.insert(retry.id, retry.clone());

        let batch_status = {
            let mut state = entry.state.write();
            if state.latest.get(&index) != Some(&prior_id) {
                drop(state);
                self.jobs.remove(&retry.id);
                return Ok(None);
            }
            state.track(&retry);
            state.counts.record_transition(prior.status, JobStatus::Queued);
            state.refresh_status()
        };

        info!(
            batch_id = %retry.batch_id,
            job_id = %retry.id,
            retry_of = %prior_id,
            attempt = retry.attempt,
            "retry queued"
        );
        self.publish(JobEvent {
            batch_id: retry.batch_id,
            job_id: retry.id,
            parameter_index: index,
            attempt: retry.attempt,
            from: None,
            to: JobStatus::Queued,
            batch_status,
            at: retry.created_at,
        });
        Ok(Some(retry))
    }

    /// Cancel every job of the batch that is still queued.
    pub fn cancel_queued(&self, batch_id: BatchId) -> SwResult<Vec<JobId>> {
        let candidates: Vec<JobId> = self
            .entry(batch_id)?
            .state
            .read()
            .latest
            .values()
            .copied()
            .collect();

        let mut cancelled = Vec::new();
        for job_id in candidates {
            if self.try_transition(job_id, JobStatus::Queued, JobStatus::Cancelled)? {
                cancelled.push(job_id);
            }
        }
        if !cancelled.is_empty() {
            info!(batch_id = %batch_id, cancelled = cancelled.len(), "queued jobs cancelled");
        }
        Ok(cancelled)
    }

    /// Receive every subsequent [`JobEvent`].
    pub fn subscribe(&self) -> Receiver<JobEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn publish(&self, event: JobEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let mut entries: Vec<Arc<BatchEntry>> =
            self.batches.iter().map(|e| Arc::clone(e.value())).collect();
        entries.sort_by_key(|e| e.record.created_at);

        let mut snapshot = StoreSnapshot::default();
        for entry in entries {
            let (status, ids) = {
                let state = entry.state.read();
                (state.status, state.jobs.clone())
            };
            let mut record = entry.record.clone();
            record.status = status;
            snapshot.batches.push(record);

            for job in self.collect_jobs(&ids) {
                if let Some(result) = job.result_id.and_then(|rid| self.result(rid)) {
                    snapshot.results.push(result);
                }
                snapshot.jobs.push(job);
            }
        }
        snapshot
    }

    /// Write the store to `path` as JSON, via a temporary file and rename.
    pub fn save_snapshot(&self, path: &Path) -> SwResult<()> {
        let _guard = self.persist_lock.lock();
        let snapshot = self.snapshot();
        let body = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;

        debug!(
            path = %path.display(),
            batches = snapshot.batches.len(),
            jobs = snapshot.jobs.len(),
            "state snapshot saved"
        );
        Ok(())
    }

    pub fn load_snapshot(path: &Path, ema_alpha: f64) -> SwResult<Self> {
        let body = std::fs::read(path)?;
        let snapshot: StoreSnapshot = serde_json::from_slice(&body)?;
        Self::from_snapshot(snapshot, ema_alpha)
    }

    /// Rebuild a store from saved contents. Jobs that were still queued or
    /// running when the snapshot was taken have no dispatcher any more and are
    /// restored as cancelled.
    pub fn from_snapshot(snapshot: StoreSnapshot, ema_alpha: f64) -> SwResult<Self> {
        let store = Self::new(ema_alpha);
        for result in snapshot.results {
            store.results.insert(result.id, result);
        }

        let mut jobs_by_batch: HashMap<BatchId, Vec<JobRecord>> = HashMap::new();
        for job in snapshot.jobs {
            jobs_by_batch.entry(job.batch_id).or_default().push(job);
        }

        for mut record in snapshot.batches {
            let request: BatchRequest = serde_json::from_value(record.config.clone())?;
            let aggregator = request.aggregator();
            let mut state = BatchState::new();

            for mut job in jobs_by_batch.remove(&record.id).unwrap_or_default() {
                if !job.status.is_terminal() {
                    warn!(
                        batch_id = %record.id,
                        job_id = %job.id,
                        status = %job.status,
                        "job was interrupted; restoring as cancelled"
                    );
                    job.status = JobStatus::Cancelled;
                    job.completed_at = Some(Utc::now());
                    job.diagnostic = Some("interrupted before completion".to_string());
                }
                state.started |= job.admitted_at.is_some();
                state.track(&job);
                store.jobs.insert(job.id, job);
            }

            for job_id in state.latest.values() {
                let Some(job) = store.jobs.get(job_id) else {
                    continue;
                };
                *state.counts.slot(job.status) += 1;
                if let Some(result) = job.result_id.and_then(|rid| store.result(rid)) {
                    if aggregator.is_better(&result, state.best.as_ref()) {
                        state.best = Some(result);
                    }
                }
            }
            record.status = state.refresh_status();

            store.batches.insert(
                record.id,
                Arc::new(BatchEntry {
                    record,
                    aggregator,
                    state: RwLock::new(state),
                }),
            );
        }

        for batch_id in jobs_by_batch.keys() {
            warn!(batch_id = %batch_id, "snapshot has jobs for an unknown batch; skipped");
        }
        info!(batches = store.batches.len(), jobs = store.jobs.len(), "state restored");
        Ok(store)
    }
}

impl std::fmt::Debug for JobStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStateStore")
            .field("batches", &self.batches.len())
            .field("jobs", &self.jobs.len())
            .field("results", &self.results.len())
            .finish()
    }
}
