//! Optimization service: submission, status, results and cancel.

use crossbeam_channel::Receiver;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sw_executor::JobExecutor;
use sw_optimizer::{BatchRequest, RankedResults, DEFAULT_MAX_COMBINATIONS};
use sw_types::{
    config_error, BatchId, BatchStatus, ConfigError, JobId, JobRecord, JobStatus, ParameterSet,
    ResourceBudget, SwError, SwResult,
};
use tracing::{info, warn};

use crate::dispatcher::{BatchControl, Dispatcher, JobLimits, PriorityFn};
use crate::monitor::{ProgressMonitor, StatusReport};
use crate::pool::{PoolUsage, ResourcePool};
use crate::store::{JobEvent, JobStateStore, DEFAULT_EMA_ALPHA};

/// Service-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Hard cap on grid points per submission.
    pub max_combinations: u64,
    /// Job timeout for submissions that do not set one.
    pub default_job_timeout_secs: u64,
    /// Extra time the scheduler gives an executor past the job timeout before
    /// forcing the job to timed out.
    pub grace_period_secs: u64,
    /// Smoothing factor of the per-job duration EMA used for ETAs.
    pub ema_alpha: f64,
    /// Shared budget for all running jobs.
    pub budget: ResourceBudget,
    /// Where to persist the state store after each batch finishes.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_combinations: DEFAULT_MAX_COMBINATIONS,
            default_job_timeout_secs: 3600,
            grace_period_secs: 30,
            ema_alpha: DEFAULT_EMA_ALPHA,
            budget: ResourceBudget::unlimited(),
            snapshot_path: None,
        }
    }
}

impl ServiceConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_combinations == 0 {
            return Err(config_error!("max_combinations must be at least 1"));
        }
        if self.default_job_timeout_secs == 0 {
            return Err(config_error!("default_job_timeout_secs must be at least 1"));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(config_error!("ema_alpha must be in (0, 1], got {}", self.ema_alpha));
        }
        Ok(())
    }

    pub fn with_max_combinations(mut self, cap: u64) -> Self {
        self.max_combinations = cap;
        self
    }

    pub fn with_default_job_timeout(mut self, timeout: Duration) -> Self {
        self.default_job_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_secs = grace.as_secs();
        self
    }

    pub fn with_budget(mut self, budget: ResourceBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }
}

/// A job whose latest attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub job_id: JobId,
    pub parameter_set: ParameterSet,
    pub status: JobStatus,
    pub attempt: u32,
    pub diagnostic: Option<String>,
}

impl From<JobRecord> for JobFailure {
    fn from(job: JobRecord) -> Self {
        Self {
            job_id: job.id,
            parameter_set: job.parameter_set,
            status: job.status,
            attempt: job.attempt,
            diagnostic: job.diagnostic,
        }
    }
}

/// Answer to a results query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsReport {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total: usize,
    /// Ranked passing results, rejected results and the leaderboard.
    #[serde(flatten)]
    pub ranking: RankedResults,
    /// Failed, timed out and cancelled jobs, in enumeration order.
    pub failures: Vec<JobFailure>,
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReport {
    pub batch_id: BatchId,
    /// Queued jobs marked cancelled before the call returned.
    pub cancelled_queued: usize,
    /// Running jobs that were sent a cancel message.
    pub signalled_running: usize,
}

/// Entry point for submitting and observing optimization batches.
pub struct OptimizationService {
    config: ServiceConfig,
    store: Arc<JobStateStore>,
    pool: Arc<ResourcePool>,
    executor: Arc<dyn JobExecutor>,
    monitor: ProgressMonitor,
    controls: DashMap<BatchId, Arc<BatchControl>>,
}

impl OptimizationService {
    pub fn new(config: ServiceConfig, executor: Arc<dyn JobExecutor>) -> Self {
        let store = Arc::new(JobStateStore::new(config.ema_alpha));
        Self::with_store(config, executor, store)
    }

    pub fn with_store(
        config: ServiceConfig,
        executor: Arc<dyn JobExecutor>,
        store: Arc<JobStateStore>,
    ) -> Self {
        Self {
            pool: ResourcePool::new(config.budget.clone()),
            monitor: ProgressMonitor::new(Arc::clone(&store)),
            store,
            executor,
            config,
            controls: DashMap::new(),
        }
    }

    /// Like [`new`](Self::new), but starts from the configured snapshot when
    /// one exists on disk.
    pub fn restore(config: ServiceConfig, executor: Arc<dyn JobExecutor>) -> SwResult<Self> {
        match config.snapshot_path.as_deref().filter(|p| p.exists()) {
            Some(path) => {
                let store = JobStateStore::load_snapshot(path, config.ema_alpha)?;
                info!(path = %path.display(), "restored state snapshot");
                Ok(Self::with_store(config, executor, Arc::new(store)))
            }
            None => Ok(Self::new(config, executor)),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStateStore> {
        &self.store
    }

    pub fn pool_usage(&self) -> PoolUsage {
        self.pool.usage()
    }

    pub fn batches(&self) -> Vec<BatchId> {
        self.store.batch_ids()
    }

    /// Validate, enumerate and start a batch. Must be called from within a
    /// Tokio runtime. On error no batch or job exists.
    pub fn submit(&self, request: BatchRequest) -> SwResult<BatchId> {
        self.submit_with_priority(request, None)
    }

    /// [`submit`](Self::submit) with an admission order override.
    pub fn submit_with_priority(
        &self,
        request: BatchRequest,
        priority: Option<PriorityFn>,
    ) -> SwResult<BatchId> {
        let sets = match request.generate(self.config.max_combinations, self.pool.budget()) {
            Ok(sets) => sets,
            Err(e) => {
                warn!(strategy = %request.strategy_reference, error = %e, "submission rejected");
                return Err(e.into());
            }
        };
        let (record, jobs) = self.store.create_batch(&request, sets)?;
        let batch_id = record.id;

        let limits = JobLimits {
            timeout: request
                .job_timeout()
                .unwrap_or(Duration::from_secs(self.config.default_job_timeout_secs)),
            grace: Duration::from_secs(self.config.grace_period_secs),
        };
        let control = BatchControl::new();
        self.controls.insert(batch_id, Arc::clone(&control));

        let dispatcher = Dispatcher::new(
            batch_id,
            Arc::new(request),
            &jobs,
            Arc::clone(&self.store),
            Arc::clone(&self.executor),
            Arc::clone(&self.pool),
            Arc::clone(&control),
            limits,
            priority,
        );
        let store = Arc::clone(&self.store);
        let snapshot_path = self.config.snapshot_path.clone();
        tokio::spawn(async move {
            dispatcher.run().await;
            if let Some(path) = snapshot_path {
                persist(store, path).await;
            }
            control.finish();
        });

        Ok(batch_id)
    }

    pub fn status(&self, batch_id: BatchId) -> SwResult<StatusReport> {
        self.monitor.report(batch_id)
    }

    pub fn results(&self, batch_id: BatchId) -> SwResult<ResultsReport> {
        let snapshot = self.store.batch(batch_id)?;
        let aggregator = self.store.aggregator(batch_id)?;
        let failures = self
            .store
            .latest_jobs(batch_id)?
            .into_iter()
            .filter(|job| {
                matches!(
                    job.status,
                    JobStatus::Failed | JobStatus::TimedOut | JobStatus::Cancelled
                )
            })
            .map(JobFailure::from)
            .collect();

        Ok(ResultsReport {
            batch_id,
            status: snapshot.record.status,
            total: snapshot.record.total_jobs,
            ranking: aggregator.rank(snapshot.results),
            failures,
        })
    }

    /// Stop admission, cancel every queued job and send a cancel message to
    /// every running one. Returns once the queued jobs are cancelled; running
    /// jobs report `Cancelled` as their executors wind down.
    pub fn cancel(&self, batch_id: BatchId) -> SwResult<CancelReport> {
        if !self.store.contains_batch(batch_id) {
            return Err(SwError::BatchNotFound { batch_id });
        }
        let Some(control) = self.controls.get(&batch_id).map(|c| Arc::clone(c.value())) else {
            // Restored from a snapshot: nothing is queued or running.
            return Ok(CancelReport {
                batch_id,
                cancelled_queued: 0,
                signalled_running: 0,
            });
        };

        control.request_cancel();
        let cancelled_queued = self.store.cancel_queued(batch_id)?.len();
        let signalled_running = control.signal_running();
        info!(
            batch_id = %batch_id,
            cancelled_queued,
            signalled_running,
            "batch cancel requested"
        );
        Ok(CancelReport {
            batch_id,
            cancelled_queued,
            signalled_running,
        })
    }

    /// Wait until every job of the batch is terminal.
    pub async fn wait(&self, batch_id: BatchId) -> SwResult<StatusReport> {
        let control = self.controls.get(&batch_id).map(|c| Arc::clone(c.value()));
        if let Some(control) = control {
            control.wait_done().await;
        }
        self.status(batch_id)
    }

    pub fn is_finished(&self, batch_id: BatchId) -> bool {
        self.controls
            .get(&batch_id)
            .map_or(true, |control| control.is_done())
    }

    /// Stream of job events from the state store.
    pub fn subscribe(&self) -> Receiver<JobEvent> {
        self.store.subscribe()
    }

    /// Persist the store now, if a snapshot path is configured.
    pub async fn save_snapshot(&self) -> SwResult<()> {
        let Some(path) = self.config.snapshot_path.clone() else {
            return Ok(());
        };
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save_snapshot(&path))
            .await
            .map_err(|e| SwError::Internal(format!("snapshot task failed: {e}")))?
    }
}

async fn persist(store: Arc<JobStateStore>, path: PathBuf) {
    let target = path.clone();
    match tokio::task::spawn_blocking(move || store.save_snapshot(&target)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(path = %path.display(), error = %e, "failed to save state snapshot"),
        Err(e) => warn!(path = %path.display(), error = %e, "snapshot task failed"),
    }
}
