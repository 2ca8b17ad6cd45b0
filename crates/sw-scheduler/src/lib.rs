//! # sw-scheduler
//!
//! Runs optimization batches: every parameter set becomes a job that is
//! admitted under a concurrency and resource budget, executed through a
//! [`sw_executor::JobExecutor`], scored, and tracked in a state store that
//! status and results queries read from while the batch is still running.

mod dispatcher;
mod monitor;
mod pool;
mod service;
mod store;
pub mod telemetry;

pub use dispatcher::PriorityFn;
pub use monitor::{estimate_eta, ProgressMonitor, StatusReport};
pub use pool::{PoolUsage, Reservation, ResourcePool};
pub use service::{CancelReport, JobFailure, OptimizationService, ResultsReport, ServiceConfig};
pub use store::{
    BatchSnapshot, JobEvent, JobStateStore, ProgressSnapshot, StoreSnapshot, TerminalOutcome,
    DEFAULT_EMA_ALPHA,
};
