//! Result aggregation: artifact parsing, criteria scoring and ranking.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use sw_types::{ExecutionError, JobId, Metrics, ParameterSet, TrialResult};
use tracing::{debug, warn};

use crate::criteria::SuccessCriteria;

/// How passing results are ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Sorted descending (e.g. "sharpe_ratio").
    pub primary_metric: String,
    /// Breaks ties on the primary metric, sorted ascending (e.g. "max_drawdown").
    pub secondary_metric: Option<String>,
    /// Leaderboard length.
    pub top_n: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            primary_metric: "sharpe_ratio".to_string(),
            secondary_metric: Some("max_drawdown".to_string()),
            top_n: 10,
        }
    }
}

/// A passing result and its 1-based position in the ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub rank: usize,
    pub result: TrialResult,
}

/// Full ranked + rejected view of a batch's results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankedResults {
    /// Passing results, best first.
    pub ranked: Vec<RankedEntry>,
    /// Results that failed at least one criterion, in enumeration order.
    pub rejected: Vec<TrialResult>,
    /// The first `top_n` entries of `ranked`.
    pub leaderboard: Vec<RankedEntry>,
}

/// Turns raw engine artifacts into canonical results and ranks them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultAggregator {
    pub criteria: SuccessCriteria,
    pub ranking: RankingConfig,
}

impl ResultAggregator {
    pub fn new(criteria: SuccessCriteria, ranking: RankingConfig) -> Self {
        Self { criteria, ranking }
    }

    /// Parse a flat JSON key-value artifact into metrics. Numbers and numeric
    /// strings are kept, booleans become 0/1, anything else is skipped.
    pub fn parse_artifact(text: &str) -> Result<Metrics, ExecutionError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ExecutionError::MalformedArtifact {
                message: e.to_string(),
            })?;
        let object = value
            .as_object()
            .ok_or_else(|| ExecutionError::MalformedArtifact {
                message: "artifact is not a key-value object".to_string(),
            })?;

        let mut metrics = Metrics::new();
        for (key, value) in object {
            let parsed = match value {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                    return Err(ExecutionError::MalformedArtifact {
                        message: format!("field {key} is nested; artifacts must be flat"),
                    });
                }
                serde_json::Value::Null => None,
            };
            match parsed {
                Some(v) => {
                    metrics.insert(key.clone(), v);
                }
                None => debug!(field = %key, "skipping non-numeric artifact field"),
            }
        }

        if metrics.is_empty() {
            return Err(ExecutionError::MalformedArtifact {
                message: "artifact contains no numeric metrics".to_string(),
            });
        }
        Ok(metrics)
    }

    /// Score metrics against every criterion.
    pub fn evaluate_metrics(
        &self,
        job_id: JobId,
        parameter_set: ParameterSet,
        metrics: Metrics,
    ) -> TrialResult {
        let reasons = self.criteria.evaluate(&metrics);
        TrialResult::new(job_id, parameter_set, metrics, reasons)
    }

    /// Parse and score a raw artifact.
    pub fn evaluate(
        &self,
        job_id: JobId,
        parameter_set: ParameterSet,
        artifact: &str,
    ) -> Result<TrialResult, ExecutionError> {
        let metrics = Self::parse_artifact(artifact)?;
        let missing = self.missing_ranking_metrics(&metrics);
        if !missing.is_empty() {
            warn!(
                job_id = %job_id,
                index = parameter_set.index,
                missing = ?missing,
                "artifact lacks ranking metrics; result will rank last"
            );
        }
        Ok(self.evaluate_metrics(job_id, parameter_set, metrics))
    }

    /// Configured ranking metrics absent from `metrics`.
    pub fn missing_ranking_metrics(&self, metrics: &Metrics) -> Vec<&str> {
        std::iter::once(self.ranking.primary_metric.as_str())
            .chain(self.ranking.secondary_metric.as_deref())
            .filter(|name| !metrics.contains_key(*name))
            .collect()
    }

    /// Ordering of passing results, best first: primary descending, secondary
    /// ascending, then enumeration order.
    pub fn compare(&self, a: &TrialResult, b: &TrialResult) -> Ordering {
        let primary = |r: &TrialResult| {
            r.metric(&self.ranking.primary_metric)
                .filter(|v| !v.is_nan())
                .unwrap_or(f64::NEG_INFINITY)
        };
        let secondary = |r: &TrialResult| {
            self.ranking
                .secondary_metric
                .as_deref()
                .and_then(|m| r.metric(m))
                .filter(|v| !v.is_nan())
                .unwrap_or(f64::INFINITY)
        };

        primary(b)
            .total_cmp(&primary(a))
            .then_with(|| secondary(a).total_cmp(&secondary(b)))
            .then_with(|| a.parameter_set.index.cmp(&b.parameter_set.index))
    }

    /// Whether `candidate` should replace `current` as the best passing result.
    pub fn is_better(&self, candidate: &TrialResult, current: Option<&TrialResult>) -> bool {
        if !candidate.passed {
            return false;
        }
        match current {
            None => true,
            Some(best) => self.compare(candidate, best) == Ordering::Less,
        }
    }

    pub fn rank(&self, results: Vec<TrialResult>) -> RankedResults {
        let (mut passing, mut rejected): (Vec<_>, Vec<_>) =
            results.into_iter().partition(|r| r.passed);
        passing.sort_by(|a, b| self.compare(a, b));
        rejected.sort_by_key(|r| r.parameter_set.index);

        let ranked: Vec<RankedEntry> = passing
            .into_iter()
            .enumerate()
            .map(|(i, result)| RankedEntry { rank: i + 1, result })
            .collect();
        let leaderboard = ranked.iter().take(self.ranking.top_n).cloned().collect();

        RankedResults {
            ranked,
            rejected,
            leaderboard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn aggregator(top_n: usize) -> ResultAggregator {
        ResultAggregator::new(
            SuccessCriteria::new().min("sharpe_ratio", 1.0),
            RankingConfig {
                primary_metric: "sharpe_ratio".into(),
                secondary_metric: Some("max_drawdown".into()),
                top_n,
            },
        )
    }

    fn result(agg: &ResultAggregator, index: usize, sharpe: f64, dd: f64) -> TrialResult {
        let metrics: Metrics = [("sharpe_ratio".to_string(), sharpe), ("max_drawdown".to_string(), dd)]
            .into_iter()
            .collect();
        agg.evaluate_metrics(Uuid::new_v4(), ParameterSet::new(index, BTreeMap::new()), metrics)
    }

    #[test]
    fn reports_missing_ranking_metrics() {
        let agg = aggregator(10);
        let partial = ResultAggregator::parse_artifact(r#"{"sharpe_ratio": 1.4, "trade_count": 30}"#).unwrap();
        assert_eq!(agg.missing_ranking_metrics(&partial), vec!["max_drawdown"]);

        let complete =
            ResultAggregator::parse_artifact(r#"{"sharpe_ratio": 1.4, "max_drawdown": 0.1}"#).unwrap();
        assert!(agg.missing_ranking_metrics(&complete).is_empty());

        let result = agg
            .evaluate(Uuid::new_v4(), ParameterSet::new(0, BTreeMap::new()), r#"{"trade_count": 30}"#)
            .unwrap();
        assert!(!result.passed);
    }

    #[test]
    fn parses_flat_artifact() {
        let metrics = ResultAggregator::parse_artifact(
            r#"{"trade_count": 42, "sharpe_ratio": 1.3, "max_drawdown": "0.12", "profitable": true, "note": "ok", "missing": null}"#,
        )
        .unwrap();
        assert_eq!(metrics.get("trade_count"), Some(&42.0));
        assert_eq!(metrics.get("max_drawdown"), Some(&0.12));
        assert_eq!(metrics.get("profitable"), Some(&1.0));
        assert!(!metrics.contains_key("note"));
        assert!(!metrics.contains_key("missing"));
    }

    #[test]
    fn rejects_malformed_artifacts() {
        for text in ["not json", "[1, 2]", r#"{"nested": {"a": 1}}"#, r#"{"note": "x"}"#] {
            assert!(
                matches!(
                    ResultAggregator::parse_artifact(text),
                    Err(ExecutionError::MalformedArtifact { .. })
                ),
                "accepted {text}"
            );
        }
    }

    #[test]
    fn ranks_by_primary_then_secondary() {
        let agg = aggregator(2);
        let results = vec![
            result(&agg, 0, 1.5, 0.20),
            result(&agg, 1, 2.0, 0.30),
            result(&agg, 2, 1.5, 0.10),
            result(&agg, 3, 0.5, 0.05), // rejected
        ];

        let ranked = agg.rank(results);
        let order: Vec<usize> = ranked
            .ranked
            .iter()
            .map(|e| e.result.parameter_set.index)
            .collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert_eq!(ranked.ranked[0].rank, 1);
        assert_eq!(ranked.leaderboard.len(), 2);
        assert_eq!(ranked.rejected.len(), 1);
        assert_eq!(ranked.rejected[0].parameter_set.index, 3);
        assert!(!ranked.rejected[0].rejection_reasons.is_empty());
    }

    #[test]
    fn best_tracking_ignores_rejected_results() {
        let agg = aggregator(5);
        let good = result(&agg, 0, 1.2, 0.1);
        let better = result(&agg, 1, 1.8, 0.1);
        let rejected = result(&agg, 2, 0.2, 0.0);

        assert!(agg.is_better(&good, None));
        assert!(agg.is_better(&better, Some(&good)));
        assert!(!agg.is_better(&good, Some(&better)));
        assert!(!agg.is_better(&rejected, None));
    }

    #[test]
    fn evaluate_builds_result_from_artifact() {
        let agg = aggregator(5);
        let r = agg
            .evaluate(
                Uuid::new_v4(),
                ParameterSet::new(7, BTreeMap::new()),
                r#"{"sharpe_ratio": 0.7}"#,
            )
            .unwrap();
        assert!(!r.passed);
        assert_eq!(r.rejection_reasons, vec!["sharpe_ratio 0.7 is below minimum 1"]);
        assert_eq!(r.parameter_set.index, 7);
    }
}
