//! Executor abstraction: the boundary between the scheduler and the external
//! evaluation engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use sw_types::{
    BatchId, EvaluationWindow, ExecutionError, JobId, ParameterSet, WorkerResources,
};
use tokio::sync::oneshot;

/// Everything an engine needs to evaluate one parameter set. Serialized as
/// `invocation.json` for out-of-process engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineInvocation {
    pub job_id: JobId,
    pub batch_id: BatchId,
    /// Retry attempt number (0 for the first attempt).
    pub attempt: u32,
    pub strategy_reference: String,
    pub parameter_set: ParameterSet,
    pub evaluation_window: Option<EvaluationWindow>,
    /// Resources reserved for this job.
    pub resources: WorkerResources,
}

/// Where a succeeded job's raw metrics live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArtifactRef {
    /// A file written by the engine.
    File(PathBuf),
    /// Artifact text produced in-process.
    Inline(String),
}

impl ArtifactRef {
    pub async fn read(&self) -> Result<String, ExecutionError> {
        match self {
            Self::Inline(text) => Ok(text.clone()),
            Self::File(path) => match tokio::fs::read_to_string(path).await {
                Ok(text) => Ok(text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(ExecutionError::ArtifactMissing {
                        path: path.display().to_string(),
                    })
                }
                Err(e) => Err(e.into()),
            },
        }
    }
}

/// The single terminal outcome an executor reports for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Succeeded { artifact: ArtifactRef },
    Failed { diagnostic: String },
    /// The execution unit was forcibly terminated after the timeout.
    TimedOut,
    /// The execution unit was terminated by a batch cancel.
    Cancelled,
}

impl ExecutionOutcome {
    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self::Failed {
            diagnostic: error.to_string(),
        }
    }
}

/// Sending half of a job's cancel message.
#[derive(Debug)]
pub struct CancelHandle {
    tx: oneshot::Sender<()>,
}

impl CancelHandle {
    /// Deliver the cancel message. Returns `false` if the job already finished.
    pub fn cancel(self) -> bool {
        self.tx.send(()).is_ok()
    }
}

/// Receiving half of a job's cancel message, handed to the executor.
#[derive(Debug)]
pub struct CancelSignal {
    rx: Option<oneshot::Receiver<()>>,
    fired: bool,
}

impl CancelSignal {
    pub fn channel() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = oneshot::channel();
        (
            CancelHandle { tx },
            CancelSignal {
                rx: Some(rx),
                fired: false,
            },
        )
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self {
            rx: None,
            fired: false,
        }
    }

    /// Resolves once a cancel message arrives. Never resolves if the handle is
    /// dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.fired {
            return;
        }
        if let Some(rx) = self.rx.as_mut() {
            let delivered = rx.await.is_ok();
            self.rx = None;
            if delivered {
                self.fired = true;
                return;
            }
        }
        std::future::pending::<()>().await
    }

    /// Non-blocking check.
    pub fn is_cancelled(&mut self) -> bool {
        if !self.fired {
            if let Some(rx) = self.rx.as_mut() {
                match rx.try_recv() {
                    Ok(()) => {
                        self.fired = true;
                        self.rx = None;
                    }
                    Err(oneshot::error::TryRecvError::Closed) => self.rx = None,
                    Err(oneshot::error::TryRecvError::Empty) => {}
                }
            }
        }
        self.fired
    }
}

/// Runs exactly one parameter set in isolation and reports one terminal
/// outcome.
///
/// Implementations must honour `timeout` by forcibly terminating the
/// execution unit and returning [`ExecutionOutcome::TimedOut`], and must turn
/// a cancel message into [`ExecutionOutcome::Cancelled`] rather than
/// `Failed`. They know nothing about the engine beyond its invocation
/// contract, so any engine that honours it is interchangeable.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(
        &self,
        invocation: EngineInvocation,
        timeout: Duration,
        cancel: CancelSignal,
    ) -> ExecutionOutcome;

    /// Human-readable backend name.
    fn name(&self) -> &str;
}
