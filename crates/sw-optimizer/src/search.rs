//! Search space definitions and parameter sweep strategies.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use sw_types::{ConfigError, ParameterSet, ParameterValue};
use tracing::warn;

/// Float grid points are rounded to this many decimal places so that
/// `0.1 + 2 * 0.1` enumerates as `0.3`.
const FLOAT_DECIMALS: i32 = 10;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Human-readable parameter name (e.g. "rsi_period").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes the values a parameter can take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Integer range `start, start + step, ..` up to and including `end`.
    IntRange { start: i64, end: i64, step: i64 },
    /// Float range `start, start + step, ..` up to and including `end`.
    FloatRange { start: f64, end: f64, step: f64 },
    /// Explicit discrete values, enumerated in the given order.
    Choice { values: Vec<serde_json::Value> },
}

impl ParameterKind {
    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidRange {
            parameter: name.to_string(),
            message,
        };
        match self {
            Self::IntRange { start, end, step } => {
                if *step <= 0 {
                    return Err(invalid(format!("step must be positive, got {step}")));
                }
                if end < start {
                    return Err(invalid(format!("end {end} is below start {start}")));
                }
            }
            Self::FloatRange { start, end, step } => {
                if !(start.is_finite() && end.is_finite() && step.is_finite()) {
                    return Err(invalid("bounds and step must be finite".to_string()));
                }
                if *step <= 0.0 {
                    return Err(invalid(format!("step must be positive, got {step}")));
                }
                if end < start {
                    return Err(invalid(format!("end {end} is below start {start}")));
                }
            }
            Self::Choice { values } => {
                if values.is_empty() {
                    return Err(ConfigError::EmptyChoice {
                        parameter: name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of values along this dimension. Assumes the kind is valid.
    pub fn cardinality(&self) -> u128 {
        match self {
            Self::IntRange { start, end, step } => {
                ((*end as i128 - *start as i128) / *step as i128 + 1) as u128
            }
            Self::FloatRange { start, end, step } => {
                let steps = ((end - start) / step + 1e-9).floor();
                if steps.is_finite() && steps < 1e30 {
                    steps as u128 + 1
                } else {
                    u128::MAX
                }
            }
            Self::Choice { values } => values.len() as u128,
        }
    }

    /// The `i`-th value along this dimension.
    fn value_at(&self, i: usize) -> ParameterValue {
        match self {
            Self::IntRange { start, step, .. } => {
                // Widened so extreme bounds cannot overflow; the result lies
                // within [start, end] and always fits back into an i64.
                let value = *start as i128 + *step as i128 * i as i128;
                ParameterValue::Int(value as i64)
            }
            Self::FloatRange { start, end, step } => {
                let scale = 10f64.powi(FLOAT_DECIMALS);
                let raw = start + step * i as f64;
                ParameterValue::Float(((raw * scale).round() / scale).min(*end))
            }
            Self::Choice { values } => ParameterValue::Json(values[i].clone()),
        }
    }
}

/// The full search space: an ordered list of parameter definitions. The first
/// declared parameter varies slowest in grid order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_int_range(mut self, name: impl Into<String>, start: i64, end: i64, step: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { start, end, step },
        });
        self
    }

    pub fn add_float_range(mut self, name: impl Into<String>, start: f64, end: f64, step: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { start, end, step },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    /// Check every dimension and reject duplicate names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parameters.is_empty() {
            return Err(ConfigError::EmptySpace);
        }
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(ConfigError::DuplicateParameter {
                    parameter: param.name.clone(),
                });
            }
            param.kind.validate(&param.name)?;
        }
        Ok(())
    }

    /// Total number of grid points, computed without enumerating them.
    /// Saturates at `u128::MAX`.
    pub fn grid_size(&self) -> u128 {
        self.parameters
            .iter()
            .try_fold(1u128, |acc, p| acc.checked_mul(p.kind.cardinality()))
            .unwrap_or(u128::MAX)
    }

    /// Validate the space and check it against the combination cap, returning
    /// the grid size.
    pub fn checked_grid_size(&self, cap: u64) -> Result<usize, ConfigError> {
        self.validate()?;
        let combinations = self.grid_size();
        if combinations > cap as u128 || combinations > usize::MAX as u128 {
            return Err(ConfigError::CombinationCapExceeded { combinations, cap });
        }
        Ok(combinations as usize)
    }

    /// Decode a grid position into concrete values (mixed radix, last
    /// dimension fastest).
    fn values_at(&self, mut grid_index: usize) -> BTreeMap<String, ParameterValue> {
        let mut values = BTreeMap::new();
        for param in self.parameters.iter().rev() {
            let radix = param.kind.cardinality() as usize;
            values.insert(param.name.clone(), param.kind.value_at(grid_index % radix));
            grid_index /= radix;
        }
        values
    }
}

/// How parameter sets are drawn from a space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SearchMode {
    /// Full Cartesian product.
    Grid,
    /// `count` distinct grid points sampled without replacement.
    Random { count: usize, seed: u64 },
}

impl Default for SearchMode {
    fn default() -> Self {
        Self::Grid
    }
}

// ---------------------------------------------------------------------------
// Search strategies
// ---------------------------------------------------------------------------

/// Common trait for all search strategies: a lazy, deterministic sequence of
/// parameter sets.
pub trait SearchStrategy: Iterator<Item = ParameterSet> + Send {
    /// Number of parameter sets the full sequence yields.
    fn planned(&self) -> usize;

    /// Human-readable strategy name.
    fn name(&self) -> &str;

    /// Take up to `count` further parameter sets.
    fn suggest(&mut self, count: usize) -> Vec<ParameterSet> {
        (0..count).map_while(|_| self.next()).collect()
    }
}

/// Build the strategy for `mode`, rejecting malformed spaces and spaces
/// larger than `cap` before anything is enumerated.
pub fn build_strategy(
    space: &SearchSpace,
    mode: &SearchMode,
    cap: u64,
) -> Result<Box<dyn SearchStrategy>, ConfigError> {
    Ok(match mode {
        SearchMode::Grid => Box::new(GridSearch::new(space.clone(), cap)?),
        SearchMode::Random { count, seed } => {
            Box::new(RandomSearch::new(space.clone(), *count, *seed, cap)?)
        }
    })
}

// ---- Grid search ----

/// Exhaustive grid search. Points are decoded from their position on demand
/// so the product is never materialized.
#[derive(Debug, Clone)]
pub struct GridSearch {
    space: SearchSpace,
    cursor: usize,
    total: usize,
}

impl GridSearch {
    pub fn new(space: SearchSpace, cap: u64) -> Result<Self, ConfigError> {
        let total = space.checked_grid_size(cap)?;
        Ok(Self {
            space,
            cursor: 0,
            total,
        })
    }
}

impl Iterator for GridSearch {
    type Item = ParameterSet;

    fn next(&mut self) -> Option<ParameterSet> {
        if self.cursor >= self.total {
            return None;
        }
        let set = ParameterSet::new(self.cursor, self.space.values_at(self.cursor));
        self.cursor += 1;
        Some(set)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.cursor;
        (left, Some(left))
    }
}

impl SearchStrategy for GridSearch {
    fn planned(&self) -> usize {
        self.total
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Seeded sampling of distinct grid points. The same seed always yields the
/// same subsequence; each set's `index` is its position in that subsequence.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    picks: Vec<usize>,
    cursor: usize,
}

impl RandomSearch {
    pub fn new(space: SearchSpace, count: usize, seed: u64, cap: u64) -> Result<Self, ConfigError> {
        if count == 0 {
            return Err(ConfigError::InvalidSampleCount);
        }
        let total = space.checked_grid_size(cap)?;
        let amount = if count > total {
            warn!(
                requested = count,
                available = total,
                "sample count exceeds grid size, sampling the whole grid"
            );
            total
        } else {
            count
        };

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let picks = rand::seq::index::sample(&mut rng, total, amount).into_vec();

        Ok(Self {
            space,
            picks,
            cursor: 0,
        })
    }
}

impl Iterator for RandomSearch {
    type Item = ParameterSet;

    fn next(&mut self) -> Option<ParameterSet> {
        let grid_index = *self.picks.get(self.cursor)?;
        let set = ParameterSet::new(self.cursor, self.space.values_at(grid_index));
        self.cursor += 1;
        Some(set)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.picks.len() - self.cursor;
        (left, Some(left))
    }
}

impl SearchStrategy for RandomSearch {
    fn planned(&self) -> usize {
        self.picks.len()
    }

    fn name(&self) -> &str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: u64 = 100_000;

    fn int(set: &ParameterSet, name: &str) -> i64 {
        match set.get(name) {
            Some(ParameterValue::Int(v)) => *v,
            other => panic!("unexpected {name} value: {other:?}"),
        }
    }

    #[test]
    fn grid_enumerates_first_parameter_slowest() {
        let space = SearchSpace::new()
            .add_int_range("rsi_period", 10, 20, 5)
            .add_int_range("threshold", 25, 35, 10);
        assert_eq!(space.grid_size(), 6);

        let sets: Vec<_> = GridSearch::new(space, CAP).unwrap().collect();
        let pairs: Vec<(i64, i64)> = sets
            .iter()
            .map(|s| (int(s, "rsi_period"), int(s, "threshold")))
            .collect();
        assert_eq!(
            pairs,
            vec![(10, 25), (10, 35), (15, 25), (15, 35), (20, 25), (20, 35)]
        );
        let indices: Vec<usize> = sets.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn extreme_int_bounds_do_not_overflow() {
        let space = SearchSpace::new().add_int_range("offset", i64::MIN, i64::MAX, i64::MAX);
        assert_eq!(space.grid_size(), 3);

        let values: Vec<i64> = GridSearch::new(space, CAP)
            .unwrap()
            .map(|s| int(&s, "offset"))
            .collect();
        assert_eq!(values, vec![i64::MIN, -1, i64::MAX - 1]);
    }

    #[test]
    fn grid_size_is_product_and_points_are_distinct() {
        let space = SearchSpace::new()
            .add_int_range("a", 1, 3, 1)
            .add_float_range("b", 0.1, 0.5, 0.2)
            .add_choice("c", vec![serde_json::json!("x"), serde_json::json!("y")]);
        assert_eq!(space.grid_size(), 3 * 3 * 2);

        let sets: Vec<_> = GridSearch::new(space.clone(), CAP).unwrap().collect();
        assert_eq!(sets.len(), 18);
        for (i, a) in sets.iter().enumerate() {
            for b in &sets[i + 1..] {
                assert_ne!(a.values, b.values);
            }
        }

        let again: Vec<_> = GridSearch::new(space, CAP).unwrap().collect();
        assert_eq!(sets, again);
    }

    #[test]
    fn float_range_rounds_accumulated_steps() {
        let space = SearchSpace::new().add_float_range("x", 0.1, 0.3, 0.1);
        let values: Vec<_> = GridSearch::new(space, CAP)
            .unwrap()
            .map(|s| s.get("x").cloned().unwrap())
            .collect();
        assert_eq!(
            values,
            vec![
                ParameterValue::Float(0.1),
                ParameterValue::Float(0.2),
                ParameterValue::Float(0.3)
            ]
        );
    }

    #[test]
    fn range_end_not_on_step_is_excluded() {
        let space = SearchSpace::new().add_int_range("x", 0, 10, 4);
        let values: Vec<i64> = GridSearch::new(space, CAP)
            .unwrap()
            .map(|s| int(&s, "x"))
            .collect();
        assert_eq!(values, vec![0, 4, 8]);
    }

    #[test]
    fn malformed_ranges_are_rejected() {
        let reversed = SearchSpace::new().add_int_range("x", 10, 5, 1);
        assert!(matches!(
            reversed.validate(),
            Err(ConfigError::InvalidRange { .. })
        ));

        let zero_step = SearchSpace::new().add_float_range("x", 0.0, 1.0, 0.0);
        assert!(matches!(
            zero_step.validate(),
            Err(ConfigError::InvalidRange { .. })
        ));

        let empty = SearchSpace::new().add_choice("x", vec![]);
        assert!(matches!(empty.validate(), Err(ConfigError::EmptyChoice { .. })));

        let dup = SearchSpace::new()
            .add_int_range("x", 1, 2, 1)
            .add_int_range("x", 1, 2, 1);
        assert!(matches!(
            dup.validate(),
            Err(ConfigError::DuplicateParameter { .. })
        ));

        assert!(matches!(
            SearchSpace::new().validate(),
            Err(ConfigError::EmptySpace)
        ));
    }

    #[test]
    fn cap_is_checked_analytically() {
        // 10^6 * 10^6 * 10^6 points: far too many to ever materialize.
        let space = SearchSpace::new()
            .add_int_range("a", 1, 1_000_000, 1)
            .add_int_range("b", 1, 1_000_000, 1)
            .add_int_range("c", 1, 1_000_000, 1);
        match GridSearch::new(space, CAP) {
            Err(ConfigError::CombinationCapExceeded { combinations, cap }) => {
                assert_eq!(combinations, 1_000_000_000_000_000_000);
                assert_eq!(cap, CAP);
            }
            other => panic!("expected cap error, got {other:?}"),
        }
    }

    #[test]
    fn grid_cursor_advances() {
        let space = SearchSpace::new().add_int_range("x", 1, 5, 1);
        let mut gs = GridSearch::new(space, CAP).unwrap();
        assert_eq!(gs.planned(), 5);
        let first = gs.suggest(3);
        assert_eq!(first.len(), 3);
        let second = gs.suggest(10);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn random_search_is_reproducible_per_seed() {
        let space = SearchSpace::new()
            .add_int_range("a", 1, 10, 1)
            .add_int_range("b", 1, 10, 1);

        let a: Vec<_> = RandomSearch::new(space.clone(), 10, 42, CAP).unwrap().collect();
        let b: Vec<_> = RandomSearch::new(space.clone(), 10, 42, CAP).unwrap().collect();
        let c: Vec<_> = RandomSearch::new(space, 10, 7, CAP).unwrap().collect();

        assert_eq!(a.len(), 10);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn random_search_samples_without_replacement() {
        let space = SearchSpace::new()
            .add_int_range("a", 1, 4, 1)
            .add_int_range("b", 1, 5, 1);
        let sets: Vec<_> = RandomSearch::new(space, 20, 3, CAP).unwrap().collect();
        assert_eq!(sets.len(), 20);
        let distinct: HashSet<(i64, i64)> =
            sets.iter().map(|s| (int(s, "a"), int(s, "b"))).collect();
        assert_eq!(distinct.len(), 20);
    }

    #[test]
    fn random_search_clamps_to_grid_size() {
        let space = SearchSpace::new().add_int_range("a", 1, 3, 1);
        let rs = RandomSearch::new(space, 50, 1, CAP).unwrap();
        assert_eq!(rs.planned(), 3);
    }

    #[test]
    fn random_search_rejects_zero_samples() {
        let space = SearchSpace::new().add_int_range("a", 1, 3, 1);
        assert!(matches!(
            RandomSearch::new(space, 0, 1, CAP),
            Err(ConfigError::InvalidSampleCount)
        ));
    }

    #[test]
    fn build_strategy_dispatches_on_mode() {
        let space = SearchSpace::new().add_int_range("a", 1, 8, 1);
        let grid = build_strategy(&space, &SearchMode::Grid, CAP).unwrap();
        assert_eq!(grid.name(), "grid");
        assert_eq!(grid.planned(), 8);

        let random =
            build_strategy(&space, &SearchMode::Random { count: 3, seed: 9 }, CAP).unwrap();
        assert_eq!(random.name(), "random");
        assert_eq!(random.count(), 3);
    }

    #[test]
    fn search_space_serde_keeps_declaration_order() {
        let space = SearchSpace::new()
            .add_int_range("z", 1, 2, 1)
            .add_float_range("a", 0.0, 1.0, 0.5)
            .add_choice("m", vec![serde_json::json!(true)]);
        let json = serde_json::to_string(&space).unwrap();
        let back: SearchSpace = serde_json::from_str(&json).unwrap();
        let names: Vec<_> = back.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }
}
