//! Canonical trial results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::job::JobId;
use crate::params::ParameterSet;

/// Unique result identifier.
pub type ResultId = Uuid;

/// Parsed engine metrics, keyed by metric name.
pub type Metrics = BTreeMap<String, f64>;

/// Result of a single succeeded job. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub id: ResultId,
    pub job_id: JobId,
    pub parameter_set: ParameterSet,
    pub metrics: Metrics,
    pub passed: bool,
    /// One entry per failed criterion, in criteria order. Empty iff `passed`.
    pub rejection_reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl TrialResult {
    pub fn new(
        job_id: JobId,
        parameter_set: ParameterSet,
        metrics: Metrics,
        rejection_reasons: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            parameter_set,
            metrics,
            passed: rejection_reasons.is_empty(),
            rejection_reasons,
            created_at: Utc::now(),
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passed_follows_rejections() {
        let set = ParameterSet::new(0, BTreeMap::new());
        let mut metrics = Metrics::new();
        metrics.insert("sharpe_ratio".into(), 1.4);

        let ok = TrialResult::new(Uuid::new_v4(), set.clone(), metrics.clone(), vec![]);
        assert!(ok.passed);
        assert_eq!(ok.metric("sharpe_ratio"), Some(1.4));
        assert_eq!(ok.metric("max_drawdown"), None);

        let rejected = TrialResult::new(
            Uuid::new_v4(),
            set,
            metrics,
            vec!["max_drawdown missing from result artifact".into()],
        );
        assert!(!rejected.passed);
    }
}
