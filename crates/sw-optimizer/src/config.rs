//! Batch submission: loosely-typed input parsed eagerly into a validated
//! request.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use sw_types::{
    config_error, ConfigError, EvaluationWindow, ParameterSet, ResourceBudget, WorkerResources,
};
use tracing::info;

use crate::aggregate::{RankingConfig, ResultAggregator};
use crate::criteria::{Criterion, SuccessCriteria};
use crate::search::{build_strategy, ParameterKind, ParameterDef, SearchMode, SearchSpace};

/// Default hard cap on the number of grid points a space may have.
pub const DEFAULT_MAX_COMBINATIONS: u64 = 100_000;

/// A validated batch submission. Fixed once the batch is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub strategy_reference: String,
    pub parameter_space: SearchSpace,
    pub search: SearchMode,
    pub success_criteria: SuccessCriteria,
    pub ranking: RankingConfig,
    /// How many jobs may run at once.
    pub max_concurrency: usize,
    /// Wall-clock limit per job; the service default applies when unset.
    pub job_timeout_secs: Option<u64>,
    /// Extra attempts per parameter set after a failure or timeout.
    pub max_retries: u32,
    pub resources: WorkerResources,
    pub evaluation_window: Option<EvaluationWindow>,
}

impl BatchRequest {
    pub fn new(strategy_reference: impl Into<String>, parameter_space: SearchSpace) -> Self {
        Self {
            strategy_reference: strategy_reference.into(),
            parameter_space,
            search: SearchMode::Grid,
            success_criteria: SuccessCriteria::new(),
            ranking: RankingConfig::default(),
            max_concurrency: 4,
            job_timeout_secs: None,
            max_retries: 0,
            resources: WorkerResources::default(),
            evaluation_window: None,
        }
    }

    pub fn with_search(mut self, search: SearchMode) -> Self {
        self.search = search;
        self
    }

    pub fn with_criteria(mut self, criteria: SuccessCriteria) -> Self {
        self.success_criteria = criteria;
        self
    }

    pub fn with_ranking(mut self, ranking: RankingConfig) -> Self {
        self.ranking = ranking;
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_resources(mut self, resources: WorkerResources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_evaluation_window(mut self, window: EvaluationWindow) -> Self {
        self.evaluation_window = Some(window);
        self
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }

    pub fn aggregator(&self) -> ResultAggregator {
        ResultAggregator::new(self.success_criteria.clone(), self.ranking.clone())
    }

    /// Check everything that does not depend on enumerating the space.
    pub fn validate(&self, max_combinations: u64, budget: &ResourceBudget) -> Result<(), ConfigError> {
        if self.strategy_reference.trim().is_empty() {
            return Err(config_error!("strategy_reference must not be empty"));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        if self.job_timeout_secs == Some(0) {
            return Err(config_error!("job_timeout_secs must be at least 1"));
        }
        if self.ranking.primary_metric.trim().is_empty() {
            return Err(config_error!("ranking primary_metric must not be empty"));
        }
        if self.ranking.top_n == 0 {
            return Err(config_error!("ranking top_n must be at least 1"));
        }
        if !(self.resources.num_cpus.is_finite() && self.resources.num_cpus >= 0.0) {
            return Err(config_error!("resources.num_cpus must be a non-negative number"));
        }
        if !budget.admits(&self.resources) {
            return Err(ConfigError::ResourceRequestExceedsBudget {
                requested: self.resources.to_string(),
                budget: budget.to_string(),
            });
        }
        if let Some(window) = &self.evaluation_window {
            if window.end < window.start {
                return Err(config_error!("evaluation window ends before it starts"));
            }
        }
        self.success_criteria.validate()?;
        self.parameter_space.checked_grid_size(max_combinations)?;
        Ok(())
    }

    /// Validate and enumerate every parameter set the batch will run.
    pub fn generate(
        &self,
        max_combinations: u64,
        budget: &ResourceBudget,
    ) -> Result<Vec<ParameterSet>, ConfigError> {
        self.validate(max_combinations, budget)?;
        let strategy = build_strategy(&self.parameter_space, &self.search, max_combinations)?;
        info!(
            strategy = strategy.name(),
            planned = strategy.planned(),
            "enumerating parameter space"
        );
        Ok(strategy.collect())
    }

    /// Parse a TOML submission.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawBatchRequest = toml::from_str(text).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        Self::try_from(raw)
    }

    /// Parse a JSON submission.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawBatchRequest = serde_json::from_str(text).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        Self::try_from(raw)
    }
}

// ---------------------------------------------------------------------------
// Raw (loosely-typed) input
// ---------------------------------------------------------------------------

/// Submission as written by a user. Parameters are an ordered list so the
/// declaration order, and therefore grid order, survives any format.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBatchRequest {
    pub strategy_reference: String,
    pub parameters: Vec<RawParameter>,
    #[serde(default)]
    pub search: RawSearch,
    /// Explicit predicates.
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    /// Shorthand predicates, `min_<metric>` / `max_<metric>`.
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    pub ranking: Option<RankingConfig>,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
    pub job_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub resources: WorkerResources,
    pub evaluation_window: Option<EvaluationWindow>,
}

fn default_concurrency() -> usize {
    4
}

/// One parameter: either `start`/`end`/`step` or `values`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawParameter {
    pub name: String,
    pub start: Option<serde_json::Number>,
    pub end: Option<serde_json::Number>,
    pub step: Option<serde_json::Number>,
    pub values: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSearch {
    #[serde(default)]
    pub mode: RawSearchMode,
    pub samples: Option<usize>,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawSearchMode {
    #[default]
    Grid,
    Random,
}

impl TryFrom<RawParameter> for ParameterDef {
    type Error = ConfigError;

    fn try_from(raw: RawParameter) -> Result<Self, ConfigError> {
        let name = raw.name.trim().to_string();
        if name.is_empty() {
            return Err(config_error!("parameter name must not be empty"));
        }
        let invalid = |message: &str| ConfigError::InvalidRange {
            parameter: name.clone(),
            message: message.to_string(),
        };

        let kind = match (raw.start, raw.end, raw.step, raw.values) {
            (None, None, None, Some(values)) => ParameterKind::Choice { values },
            (Some(start), Some(end), Some(step), None) => {
                match (start.as_i64(), end.as_i64(), step.as_i64()) {
                    (Some(start), Some(end), Some(step)) => {
                        ParameterKind::IntRange { start, end, step }
                    }
                    _ => {
                        let as_f64 = |n: &serde_json::Number| {
                            n.as_f64().ok_or_else(|| invalid("bound is not a number"))
                        };
                        ParameterKind::FloatRange {
                            start: as_f64(&start)?,
                            end: as_f64(&end)?,
                            step: as_f64(&step)?,
                        }
                    }
                }
            }
            (_, _, _, Some(_)) => {
                return Err(invalid("give either values or start/end/step, not both"))
            }
            _ => return Err(invalid("a range needs start, end and step")),
        };

        Ok(ParameterDef { name, kind })
    }
}

impl TryFrom<RawBatchRequest> for BatchRequest {
    type Error = ConfigError;

    fn try_from(raw: RawBatchRequest) -> Result<Self, ConfigError> {
        let parameters = raw
            .parameters
            .into_iter()
            .map(ParameterDef::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let parameter_space = SearchSpace { parameters };
        parameter_space.validate()?;

        let search = match raw.search.mode {
            RawSearchMode::Grid => SearchMode::Grid,
            RawSearchMode::Random => {
                let count = raw.search.samples.ok_or(ConfigError::InvalidSampleCount)?;
                let seed = raw.search.seed.unwrap_or_else(|| {
                    let seed = rand::random::<u64>();
                    info!(seed, "no seed supplied for random search, generated one");
                    seed
                });
                SearchMode::Random { count, seed }
            }
        };

        let shorthand =
            SuccessCriteria::from_thresholds(raw.thresholds.iter().map(|(k, v)| (k.as_str(), *v)))?;
        let success_criteria = SuccessCriteria {
            criteria: raw.criteria,
        }
        .extend(shorthand);
        success_criteria.validate()?;

        Ok(Self {
            strategy_reference: raw.strategy_reference,
            parameter_space,
            search,
            success_criteria,
            ranking: raw.ranking.unwrap_or_default(),
            max_concurrency: raw.max_concurrency,
            job_timeout_secs: raw.job_timeout_secs,
            max_retries: raw.max_retries,
            resources: raw.resources,
            evaluation_window: raw.evaluation_window,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Comparator;

    const SAMPLE: &str = r#"
strategy_reference = "rsi_reversion"
max_concurrency = 2
job_timeout_secs = 600

[search]
mode = "random"
samples = 4
seed = 17

[[parameters]]
name = "rsi_period"
start = 10
end = 20
step = 5

[[parameters]]
name = "threshold"
start = 25
end = 35
step = 10

[[parameters]]
name = "stop_loss"
start = 0.01
end = 0.03
step = 0.01

[[parameters]]
name = "side"
values = ["long", "short"]

[[criteria]]
metric = "trade_count"
op = ">="
threshold = 30

[thresholds]
min_sharpe_ratio = 1.0
max_max_drawdown = 0.15

[ranking]
primary_metric = "sharpe_ratio"
secondary_metric = "max_drawdown"
top_n = 3
"#;

    #[test]
    fn parses_toml_submission() {
        let req = BatchRequest::from_toml_str(SAMPLE).unwrap();
        assert_eq!(req.strategy_reference, "rsi_reversion");
        assert_eq!(req.max_concurrency, 2);
        assert_eq!(req.job_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(req.search, SearchMode::Random { count: 4, seed: 17 });

        let names: Vec<_> = req
            .parameter_space
            .parameters
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["rsi_period", "threshold", "stop_loss", "side"]);
        assert!(matches!(
            req.parameter_space.parameters[0].kind,
            ParameterKind::IntRange { start: 10, end: 20, step: 5 }
        ));
        assert!(matches!(
            req.parameter_space.parameters[2].kind,
            ParameterKind::FloatRange { .. }
        ));

        // Explicit predicates first, then shorthand in key order.
        let criteria = &req.success_criteria.criteria;
        assert_eq!(criteria.len(), 3);
        assert_eq!(criteria[0].metric, "trade_count");
        assert_eq!(criteria[1].metric, "max_drawdown");
        assert_eq!(criteria[1].comparator, Comparator::Le);
        assert_eq!(criteria[2].metric, "sharpe_ratio");
        assert_eq!(req.ranking.top_n, 3);

        let sets = req
            .generate(DEFAULT_MAX_COMBINATIONS, &ResourceBudget::unlimited())
            .unwrap();
        assert_eq!(sets.len(), 4);
    }

    #[test]
    fn json_submission_defaults_to_grid() {
        let req = BatchRequest::from_json_str(
            r#"{
                "strategy_reference": "ma_cross",
                "parameters": [
                    {"name": "fast", "start": 5, "end": 15, "step": 5},
                    {"name": "slow", "values": [50, 100]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(req.search, SearchMode::Grid);
        assert_eq!(req.max_concurrency, 4);
        let sets = req
            .generate(DEFAULT_MAX_COMBINATIONS, &ResourceBudget::unlimited())
            .unwrap();
        assert_eq!(sets.len(), 6);
    }

    #[test]
    fn half_specified_range_is_rejected() {
        let err = BatchRequest::from_json_str(
            r#"{"strategy_reference": "x", "parameters": [{"name": "p", "start": 1, "end": 4}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRange { .. }));
    }

    #[test]
    fn malformed_range_never_reaches_generation() {
        let err = BatchRequest::from_json_str(
            r#"{"strategy_reference": "x", "parameters": [{"name": "p", "start": 4, "end": 1, "step": 1}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRange { .. }));
    }

    #[test]
    fn random_mode_requires_sample_count() {
        let err = BatchRequest::from_json_str(
            r#"{"strategy_reference": "x", "search": {"mode": "random"},
                "parameters": [{"name": "p", "values": [1, 2]}]}"#,
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::InvalidSampleCount);
    }

    #[test]
    fn validation_checks_cap_concurrency_and_budget() {
        let space = SearchSpace::new()
            .add_int_range("a", 1, 100, 1)
            .add_int_range("b", 1, 100, 1);
        let req = BatchRequest::new("s", space);
        assert!(matches!(
            req.validate(1_000, &ResourceBudget::unlimited()),
            Err(ConfigError::CombinationCapExceeded { combinations: 10_000, cap: 1_000 })
        ));

        let req = req.with_concurrency(0);
        assert_eq!(
            req.validate(DEFAULT_MAX_COMBINATIONS, &ResourceBudget::unlimited()),
            Err(ConfigError::InvalidConcurrency)
        );

        let req = req.with_concurrency(2).with_resources(WorkerResources {
            num_cpus: 4.0,
            memory_bytes: 0,
        });
        let budget = ResourceBudget {
            max_cpus: Some(2.0),
            max_memory_bytes: None,
        };
        assert!(matches!(
            req.validate(DEFAULT_MAX_COMBINATIONS, &budget),
            Err(ConfigError::ResourceRequestExceedsBudget { .. })
        ));
    }
}
