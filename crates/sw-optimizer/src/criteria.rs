//! Success criteria: threshold predicates applied to every trial's metrics.

use serde::{Deserialize, Serialize};
use sw_types::{ConfigError, Metrics};

/// Tolerance used by the equality comparators.
const EQ_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "gte", alias = "min")]
    Ge,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "lte", alias = "max")]
    Le,
    #[serde(rename = "==", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
}

impl Comparator {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Ge => value >= threshold,
            Self::Lt => value < threshold,
            Self::Le => value <= threshold,
            Self::Eq => (value - threshold).abs() <= EQ_EPSILON,
            Self::Ne => (value - threshold).abs() > EQ_EPSILON,
        }
    }
}

/// A single pass/fail predicate on one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub metric: String,
    #[serde(rename = "op")]
    pub comparator: Comparator,
    pub threshold: f64,
}

impl Criterion {
    pub fn new(metric: impl Into<String>, comparator: Comparator, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            comparator,
            threshold,
        }
    }

    /// `None` if the predicate holds, otherwise the rejection reason.
    pub fn check(&self, metrics: &Metrics) -> Option<String> {
        let metric = &self.metric;
        let threshold = self.threshold;
        let value = match metrics.get(metric) {
            Some(v) => *v,
            None => return Some(format!("{metric} missing from result artifact")),
        };
        if value.is_nan() {
            return Some(format!("{metric} is not a number"));
        }
        if self.comparator.holds(value, threshold) {
            return None;
        }
        Some(match self.comparator {
            Comparator::Ge => format!("{metric} {value} is below minimum {threshold}"),
            Comparator::Le => format!("{metric} {value} exceeds maximum {threshold}"),
            Comparator::Gt => format!("{metric} {value} is not above {threshold}"),
            Comparator::Lt => format!("{metric} {value} is not below {threshold}"),
            Comparator::Eq => format!("{metric} {value} does not equal {threshold}"),
            Comparator::Ne => format!("{metric} {value} must not equal {threshold}"),
        })
    }
}

/// Ordered set of predicates. Every predicate is evaluated; nothing
/// short-circuits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriteria {
    pub criteria: Vec<Criterion>,
}

impl SuccessCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, metric: impl Into<String>, comparator: Comparator, threshold: f64) -> Self {
        self.criteria.push(Criterion::new(metric, comparator, threshold));
        self
    }

    /// `metric >= threshold`
    pub fn min(self, metric: impl Into<String>, threshold: f64) -> Self {
        self.with(metric, Comparator::Ge, threshold)
    }

    /// `metric <= threshold`
    pub fn max(self, metric: impl Into<String>, threshold: f64) -> Self {
        self.with(metric, Comparator::Le, threshold)
    }

    /// Parse shorthand thresholds such as `min_sharpe_ratio = 1.0` or
    /// `max_max_drawdown = 0.15`.
    pub fn from_thresholds<'a, I>(thresholds: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut criteria = Self::new();
        for (key, threshold) in thresholds {
            criteria = if let Some(metric) = key.strip_prefix("min_") {
                criteria.min(metric, threshold)
            } else if let Some(metric) = key.strip_prefix("max_") {
                criteria.max(metric, threshold)
            } else {
                return Err(ConfigError::InvalidCriterion {
                    message: format!("threshold key {key} must start with min_ or max_"),
                });
            };
        }
        criteria.validate()?;
        Ok(criteria)
    }

    pub fn extend(mut self, other: SuccessCriteria) -> Self {
        self.criteria.extend(other.criteria);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for c in &self.criteria {
            if c.metric.trim().is_empty() {
                return Err(ConfigError::InvalidCriterion {
                    message: "metric name is empty".to_string(),
                });
            }
            if !c.threshold.is_finite() {
                return Err(ConfigError::InvalidCriterion {
                    message: format!("threshold for {} is not finite", c.metric),
                });
            }
        }
        Ok(())
    }

    /// Rejection reasons for every failing predicate, in criteria order.
    pub fn evaluate(&self, metrics: &Metrics) -> Vec<String> {
        self.criteria.iter().filter_map(|c| c.check(metrics)).collect()
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(pairs: &[(&str, f64)]) -> Metrics {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn only_the_violated_predicate_is_reported() {
        let criteria = SuccessCriteria::from_thresholds([
            ("min_primary_metric", 1.0),
            ("max_risk_measure", 0.15),
        ])
        .unwrap();

        let reasons = criteria.evaluate(&metrics(&[
            ("primary_metric", 1.2),
            ("risk_measure", 0.20),
        ]));
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("risk_measure"));
        assert!(reasons[0].contains("exceeds maximum 0.15"));
    }

    #[test]
    fn every_failure_is_collected() {
        let criteria = SuccessCriteria::new()
            .min("sharpe_ratio", 1.0)
            .max("max_drawdown", 0.2)
            .with("trade_count", Comparator::Gt, 30.0);

        let reasons = criteria.evaluate(&metrics(&[
            ("sharpe_ratio", 0.4),
            ("max_drawdown", 0.35),
            ("trade_count", 30.0),
        ]));
        assert_eq!(reasons.len(), 3);
        assert!(reasons[0].starts_with("sharpe_ratio"));
        assert!(reasons[1].starts_with("max_drawdown"));
        assert!(reasons[2].starts_with("trade_count"));
    }

    #[test]
    fn missing_metric_fails_without_panicking() {
        let criteria = SuccessCriteria::new().min("sortino_ratio", 1.0);
        let reasons = criteria.evaluate(&metrics(&[("sharpe_ratio", 3.0)]));
        assert_eq!(reasons, vec!["sortino_ratio missing from result artifact"]);
    }

    #[test]
    fn nan_metric_fails() {
        let criteria = SuccessCriteria::new().max("max_drawdown", 0.2);
        let reasons = criteria.evaluate(&metrics(&[("max_drawdown", f64::NAN)]));
        assert_eq!(reasons, vec!["max_drawdown is not a number"]);
    }

    #[test]
    fn unknown_threshold_prefix_is_a_config_error() {
        let err = SuccessCriteria::from_thresholds([("sharpe_ratio", 1.0)]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCriterion { .. }));
    }

    #[test]
    fn non_finite_threshold_is_rejected() {
        let criteria = SuccessCriteria::new().min("sharpe_ratio", f64::INFINITY);
        assert!(criteria.validate().is_err());
    }

    #[test]
    fn comparator_aliases_deserialize() {
        let c: Criterion =
            serde_json::from_str(r#"{"metric":"win_rate","op":"gte","threshold":0.5}"#).unwrap();
        assert_eq!(c.comparator, Comparator::Ge);
        let c: Criterion =
            serde_json::from_str(r#"{"metric":"win_rate","op":"<","threshold":0.9}"#).unwrap();
        assert_eq!(c.comparator, Comparator::Lt);
    }
}
