//! # sw-optimizer
//!
//! Parameter search and result evaluation for SweepForge.
//!
//! Provides search space definitions, grid and seeded random enumeration,
//! success criteria, result ranking, and validation of batch submissions.

mod aggregate;
mod config;
mod criteria;
mod search;

pub use aggregate::{RankedEntry, RankedResults, RankingConfig, ResultAggregator};
pub use config::{
    BatchRequest, RawBatchRequest, RawParameter, RawSearch, RawSearchMode,
    DEFAULT_MAX_COMBINATIONS,
};
pub use criteria::{Comparator, Criterion, SuccessCriteria};
pub use search::{
    build_strategy, GridSearch, ParameterDef, ParameterKind, RandomSearch, SearchMode,
    SearchSpace, SearchStrategy,
};
