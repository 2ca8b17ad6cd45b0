use thiserror::Error;

use crate::job::{BatchId, JobId};

/// Main error type for the SweepForge system
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Batch not found: {batch_id}")]
    BatchNotFound { batch_id: BatchId },

    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while validating a submission. No batch is created when one
/// of these is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Parameter space is empty")]
    EmptySpace,

    #[error("Duplicate parameter: {parameter}")]
    DuplicateParameter { parameter: String },

    #[error("Invalid range for {parameter}: {message}")]
    InvalidRange { parameter: String, message: String },

    #[error("Parameter {parameter} has no values to choose from")]
    EmptyChoice { parameter: String },

    #[error("Parameter space has {combinations} combinations, exceeding the cap of {cap}")]
    CombinationCapExceeded { combinations: u128, cap: u64 },

    #[error("Sample count must be at least 1")]
    InvalidSampleCount,

    #[error("max_concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("Invalid success criterion: {message}")]
    InvalidCriterion { message: String },

    #[error("Per-job resources {requested} exceed the pool budget {budget}")]
    ResourceRequestExceedsBudget { requested: String, budget: String },

    #[error("Failed to parse configuration: {message}")]
    Parse { message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Failures of a single job's execution. These never escape the job: the
/// scheduler records them as the job's `Failed` diagnostic.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to launch engine: {message}")]
    Spawn { message: String },

    #[error("Engine exited with {status}: {stderr}")]
    NonZeroExit { status: String, stderr: String },

    #[error("Result artifact missing: {path}")]
    ArtifactMissing { path: String },

    #[error("Malformed result artifact: {message}")]
    MalformedArtifact { message: String },

    #[error("Executor panicked: {message}")]
    Panicked { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for SweepForge operations
pub type SwResult<T> = Result<T, SwError>;

/// Macro for creating free-form configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::ConfigError::Invalid(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::SwError::Internal(format!($($arg)*))
    };
}
