//! Per-batch dispatch loop: admission control, worker supervision and
//! retries.
//!
//! One loop owns admission for a batch. Executors run on their own tasks, so
//! the loop only blocks when the queue is non-empty and no slot (or no budget)
//! is free.

use dashmap::DashMap;
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use sw_executor::{CancelHandle, CancelSignal, EngineInvocation, ExecutionOutcome, JobExecutor};
use sw_optimizer::{BatchRequest, ResultAggregator};
use sw_types::{BatchId, ExecutionError, JobId, JobRecord, JobStatus, ParameterSet};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::pool::{Reservation, ResourcePool};
use crate::store::{JobStateStore, TerminalOutcome};

/// Optional admission order override. Higher values are admitted first; ties
/// keep enumeration order.
pub type PriorityFn = Arc<dyn Fn(&ParameterSet) -> i64 + Send + Sync>;

/// Cancellation and completion signalling shared between a batch's dispatcher
/// and the service.
#[derive(Debug)]
pub struct BatchControl {
    cancel_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    /// Cancel messages for jobs currently running.
    running: DashMap<JobId, CancelHandle>,
}

impl BatchControl {
    pub fn new() -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        Arc::new(Self {
            cancel_tx,
            done_tx,
            running: DashMap::new(),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Stop admitting. Returns `false` if the batch was already cancelled.
    pub fn request_cancel(&self) -> bool {
        self.cancel_tx.send_if_modified(|cancelled| !std::mem::replace(cancelled, true))
    }

    /// Deliver a cancel message to every running job. Returns how many were
    /// delivered.
    pub fn signal_running(&self) -> usize {
        let ids: Vec<JobId> = self.running.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.running.remove(&id))
            .map(|(_, handle)| handle.cancel())
            .filter(|delivered| *delivered)
            .count()
    }

    pub fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    /// Resolves once the dispatcher has driven every job to a terminal state.
    pub async fn wait_done(&self) {
        let mut rx = self.done_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|done| *done).await;
    }

    fn subscribe_cancel(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Mark the batch as fully driven. Called once the dispatcher has returned
    /// and any follow-up work is done.
    pub(crate) fn finish(&self) {
        self.done_tx.send_replace(true);
    }
}

/// One queued unit of work.
#[derive(Debug, Clone)]
struct QueuedJob {
    job_id: JobId,
    attempt: u32,
    parameter_set: ParameterSet,
}

impl From<&JobRecord> for QueuedJob {
    fn from(job: &JobRecord) -> Self {
        Self {
            job_id: job.id,
            attempt: job.attempt,
            parameter_set: job.parameter_set.clone(),
        }
    }
}

/// What a worker hands back to the dispatch loop.
#[derive(Debug)]
struct JobReport {
    job: QueuedJob,
    status: JobStatus,
    applied: bool,
}

/// Shared, read-only context for workers of one batch.
struct WorkerContext {
    batch_id: BatchId,
    store: Arc<JobStateStore>,
    executor: Arc<dyn JobExecutor>,
    aggregator: ResultAggregator,
    request: Arc<BatchRequest>,
    job_timeout: Duration,
    grace: Duration,
}

/// Timing limits applied to every job of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobLimits {
    pub timeout: Duration,
    pub grace: Duration,
}

pub struct Dispatcher {
    ctx: Arc<WorkerContext>,
    pool: Arc<ResourcePool>,
    control: Arc<BatchControl>,
    queue: VecDeque<QueuedJob>,
    max_concurrency: usize,
    max_retries: u32,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        batch_id: BatchId,
        request: Arc<BatchRequest>,
        jobs: &[JobRecord],
        store: Arc<JobStateStore>,
        executor: Arc<dyn JobExecutor>,
        pool: Arc<ResourcePool>,
        control: Arc<BatchControl>,
        limits: JobLimits,
        priority: Option<PriorityFn>,
    ) -> Self {
        let mut ordered: Vec<QueuedJob> = jobs.iter().map(QueuedJob::from).collect();
        if let Some(priority) = priority {
            // Stable, so equal priorities stay in enumeration order.
            ordered.sort_by_key(|job| Reverse(priority(&job.parameter_set)));
        }

        Self {
            max_concurrency: request.max_concurrency.max(1),
            max_retries: request.max_retries,
            ctx: Arc::new(WorkerContext {
                batch_id,
                aggregator: request.aggregator(),
                store,
                executor,
                request,
                job_timeout: limits.timeout,
                grace: limits.grace,
            }),
            pool,
            control,
            queue: ordered.into(),
        }
    }

    /// Drive every queued job to a terminal state.
    pub async fn run(mut self) {
        let batch_id = self.ctx.batch_id;
        let mut workers: JoinSet<JobReport> = JoinSet::new();
        let mut cancel_rx = self.control.subscribe_cancel();

        info!(
            batch_id = %batch_id,
            jobs = self.queue.len(),
            max_concurrency = self.max_concurrency,
            executor = self.ctx.executor.name(),
            "dispatcher started"
        );

        let pool = Arc::clone(&self.pool);
        loop {
            if *cancel_rx.borrow_and_update() && !self.queue.is_empty() {
                self.abandon_queue();
            }
            if self.queue.is_empty() && workers.is_empty() {
                break;
            }

            if !self.queue.is_empty() && workers.len() < self.max_concurrency {
                let released = pool.released();
                tokio::pin!(released);
                released.as_mut().enable();

                if let Some(reservation) = pool.try_reserve(&self.ctx.request.resources) {
                    if let Some(job) = self.queue.pop_front() {
                        self.admit(job, reservation, &mut workers);
                    }
                    continue;
                }

                // Budget exhausted by running jobs, possibly of other batches.
                tokio::select! {
                    _ = &mut released => {}
                    Some(joined) = workers.join_next() => self.on_joined(joined),
                    _ = cancel_rx.changed() => {}
                }
                continue;
            }

            // All slots busy, or nothing left to admit: wait for a worker.
            tokio::select! {
                Some(joined) = workers.join_next() => self.on_joined(joined),
                _ = cancel_rx.changed() => {}
            }
        }

        match self.ctx.store.progress(batch_id) {
            Ok(progress) => info!(
                batch_id = %batch_id,
                status = ?progress.status,
                succeeded = progress.counts.succeeded,
                failed = progress.counts.failed,
                timed_out = progress.counts.timed_out,
                cancelled = progress.counts.cancelled,
                peak_running = progress.peak_running,
                "dispatcher finished"
            ),
            Err(e) => warn!(batch_id = %batch_id, error = %e, "dispatcher finished"),
        }
    }

    fn admit(&mut self, job: QueuedJob, reservation: Reservation, workers: &mut JoinSet<JobReport>) {
        let (handle, signal) = CancelSignal::channel();
        // Registered before the transition so a concurrent cancel sees it.
        self.control.running.insert(job.job_id, handle);

        match self
            .ctx
            .store
            .try_transition(job.job_id, JobStatus::Queued, JobStatus::Running)
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.job_id, "job left the queue before admission");
                self.control.running.remove(&job.job_id);
                return;
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "failed to admit job");
                self.control.running.remove(&job.job_id);
                return;
            }
        }

        if self.control.is_cancelled() {
            if let Some((_, handle)) = self.control.running.remove(&job.job_id) {
                handle.cancel();
            }
        }

        debug!(
            batch_id = %self.ctx.batch_id,
            job_id = %job.job_id,
            index = job.parameter_set.index,
            attempt = job.attempt,
            "job admitted"
        );
        workers.spawn(run_job(Arc::clone(&self.ctx), job, signal, reservation));
    }

    fn on_joined(&mut self, joined: Result<JobReport, tokio::task::JoinError>) {
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                error!(batch_id = %self.ctx.batch_id, error = %e, "job worker aborted");
                return;
            }
        };
        self.control.running.remove(&report.job.job_id);

        let retryable = matches!(report.status, JobStatus::Failed | JobStatus::TimedOut);
        if !(report.applied && retryable) || report.job.attempt >= self.max_retries {
            return;
        }
        if self.control.is_cancelled() {
            return;
        }

        match self.ctx.store.enqueue_retry(report.job.job_id) {
            Ok(Some(retry)) => self.queue.push_back(QueuedJob::from(&retry)),
            Ok(None) => {}
            Err(e) => warn!(job_id = %report.job.job_id, error = %e, "failed to queue retry"),
        }
    }

    fn abandon_queue(&mut self) {
        let dropped = self.queue.len();
        self.queue.clear();
        if let Err(e) = self.ctx.store.cancel_queued(self.ctx.batch_id) {
            warn!(batch_id = %self.ctx.batch_id, error = %e, "failed to cancel queued jobs");
        }
        info!(batch_id = %self.ctx.batch_id, dropped, "admission stopped by cancel");
    }
}

/// Execute one admitted job and record its terminal outcome.
async fn run_job(
    ctx: Arc<WorkerContext>,
    job: QueuedJob,
    cancel: CancelSignal,
    reservation: Reservation,
) -> JobReport {
    let started = Instant::now();
    if let Err(e) = ctx.store.mark_started(job.job_id) {
        warn!(job_id = %job.job_id, error = %e, "failed to stamp start time");
    }

    let invocation = EngineInvocation {
        job_id: job.job_id,
        batch_id: ctx.batch_id,
        attempt: job.attempt,
        strategy_reference: ctx.request.strategy_reference.clone(),
        parameter_set: job.parameter_set.clone(),
        evaluation_window: ctx.request.evaluation_window.clone(),
        resources: reservation.resources().clone(),
    };

    // The executor runs on its own task so a panic becomes a failure.
    let executor = Arc::clone(&ctx.executor);
    let timeout = ctx.job_timeout;
    let execution = tokio::spawn(async move { executor.execute(invocation, timeout, cancel).await });
    let abort = execution.abort_handle();

    let outcome = match tokio::time::timeout(ctx.job_timeout + ctx.grace, execution).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) if e.is_panic() => ExecutionOutcome::failed(ExecutionError::Panicked {
            message: panic_message(e.into_panic()),
        }),
        Ok(Err(e)) => ExecutionOutcome::failed(e),
        Err(_) => {
            abort.abort();
            warn!(
                job_id = %job.job_id,
                timeout_secs = ctx.job_timeout.as_secs_f64(),
                grace_secs = ctx.grace.as_secs_f64(),
                "executor ignored its timeout; job forced to timed out"
            );
            ExecutionOutcome::TimedOut
        }
    };

    let terminal = match outcome {
        ExecutionOutcome::Succeeded { artifact } => {
            let evaluated = match artifact.read().await {
                Ok(text) => ctx.aggregator.evaluate(job.job_id, job.parameter_set.clone(), &text),
                Err(e) => Err(e),
            };
            match evaluated {
                Ok(result) => TerminalOutcome::Succeeded(result),
                Err(e) => TerminalOutcome::Failed(e.to_string()),
            }
        }
        ExecutionOutcome::Failed { diagnostic } => TerminalOutcome::Failed(diagnostic),
        ExecutionOutcome::TimedOut => TerminalOutcome::TimedOut(format!(
            "exceeded job timeout of {}s",
            ctx.job_timeout.as_secs_f64()
        )),
        ExecutionOutcome::Cancelled => TerminalOutcome::Cancelled,
    };

    let status = terminal.status();
    let applied = match ctx.store.complete(job.job_id, terminal, started.elapsed()) {
        Ok(applied) => applied,
        Err(e) => {
            error!(job_id = %job.job_id, error = %e, "failed to record job outcome");
            false
        }
    };
    drop(reservation);

    JobReport {
        job,
        status,
        applied,
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "executor panicked".to_string()
    }
}
