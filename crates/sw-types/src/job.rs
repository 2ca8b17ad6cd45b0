//! Job and batch records and the job lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::params::ParameterSet;
use crate::result::ResultId;

/// Unique batch (optimization run) identifier.
pub type BatchId = Uuid;

/// Unique job identifier. Every attempt at a parameter set gets its own.
pub type JobId = Uuid;

/// Lifecycle of a single job.
///
/// `Queued -> Running -> {Succeeded, Failed, TimedOut}`, plus
/// `Queued -> Cancelled` and `Running -> Cancelled` on batch cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One attempt to evaluate a parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub batch_id: BatchId,
    pub parameter_set: ParameterSet,
    pub status: JobStatus,
    /// 0 for the first attempt, incremented for every retry.
    pub attempt: u32,
    /// The failed job this attempt retries, if any.
    pub retry_of: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub admitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_id: Option<ResultId>,
    /// Captured failure diagnostic for `Failed` and `TimedOut` jobs.
    pub diagnostic: Option<String>,
}

impl JobRecord {
    pub fn new(batch_id: BatchId, parameter_set: ParameterSet) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            parameter_set,
            status: JobStatus::Queued,
            attempt: 0,
            retry_of: None,
            created_at: Utc::now(),
            admitted_at: None,
            started_at: None,
            completed_at: None,
            result_id: None,
            diagnostic: None,
        }
    }

    /// A fresh attempt linked to `prior`. The prior record is left untouched.
    pub fn retry_of(prior: &JobRecord) -> Self {
        let mut job = Self::new(prior.batch_id, prior.parameter_set.clone());
        job.attempt = prior.attempt + 1;
        job.retry_of = Some(prior.id);
        job
    }
}

/// Per-status job counts for a batch. Only the latest attempt of each
/// parameter set is counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.queued + self.running + self.terminal()
    }

    pub fn terminal(&self) -> usize {
        self.succeeded + self.failed + self.timed_out + self.cancelled
    }

    pub fn slot(&mut self, status: JobStatus) -> &mut usize {
        match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Running => &mut self.running,
            JobStatus::Succeeded => &mut self.succeeded,
            JobStatus::Failed => &mut self.failed,
            JobStatus::TimedOut => &mut self.timed_out,
            JobStatus::Cancelled => &mut self.cancelled,
        }
    }

    pub fn record_transition(&mut self, from: JobStatus, to: JobStatus) {
        let from_slot = self.slot(from);
        *from_slot = from_slot.saturating_sub(1);
        *self.slot(to) += 1;
    }

    /// Derive the batch status from job statuses. `started` records whether
    /// any job of the batch has ever left `Queued`; once it has, re-queued
    /// retries keep the batch `Running` instead of sending it back to
    /// `Pending`.
    pub fn derive_status(&self, started: bool) -> BatchStatus {
        let total = self.total();
        if !started && total > 0 && self.queued == total {
            BatchStatus::Pending
        } else if self.queued + self.running > 0 {
            BatchStatus::Running
        } else if self.cancelled > 0 {
            BatchStatus::Cancelled
        } else if self.failed + self.timed_out > 0 {
            BatchStatus::PartiallyFailed
        } else {
            BatchStatus::Completed
        }
    }
}

/// Derived lifecycle state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    PartiallyFailed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyFailed | Self::Cancelled
        )
    }
}

/// Persisted batch record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: BatchId,
    pub strategy_reference: String,
    pub max_concurrency: usize,
    /// Number of parameter sets; retries do not change it.
    pub total_jobs: usize,
    /// Immutable snapshot of the validated submission. Stored as opaque JSON
    /// so this crate does not depend on the optimizer's config types.
    pub config: serde_json::Value,
    /// Cache of the derived status, refreshed on every transition.
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
}
