//! # sw-executor
//!
//! Executors that run one parameter set against an external evaluation
//! engine, isolated behind a process or container boundary.

mod adapter;
mod config;
mod container;
mod process;

pub use adapter::{
    ArtifactRef, CancelHandle, CancelSignal, EngineInvocation, ExecutionOutcome, JobExecutor,
};
pub use config::ExecutorConfig;
pub use container::{ContainerConfig, ContainerExecutor};
pub use process::{LocalProcessConfig, LocalProcessExecutor};
