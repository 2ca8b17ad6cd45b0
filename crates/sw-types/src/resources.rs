//! Per-job resource requests, pool budgets and the evaluation window handed to
//! engines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource requirements for a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResources {
    /// Number of CPUs per job (fractional ok).
    pub num_cpus: f64,
    /// Memory in bytes (0 = no reservation).
    pub memory_bytes: u64,
}

impl Default for WorkerResources {
    fn default() -> Self {
        Self {
            num_cpus: 1.0,
            memory_bytes: 0,
        }
    }
}

impl std::fmt::Display for WorkerResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} cpus / {} bytes", self.num_cpus, self.memory_bytes)
    }
}

/// Upper bound on the sum of reservations held by running jobs. `None` on a
/// field means that dimension is not limited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub max_cpus: Option<f64>,
    pub max_memory_bytes: Option<u64>,
}

impl ResourceBudget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Whether a single request could ever be admitted under this budget.
    pub fn admits(&self, request: &WorkerResources) -> bool {
        self.max_cpus.map_or(true, |max| request.num_cpus <= max)
            && self
                .max_memory_bytes
                .map_or(true, |max| request.memory_bytes <= max)
    }
}

impl std::fmt::Display for ResourceBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.max_cpus {
            Some(cpus) => write!(f, "{cpus} cpus")?,
            None => write!(f, "unlimited cpus")?,
        }
        match self.max_memory_bytes {
            Some(bytes) => write!(f, " / {bytes} bytes"),
            None => write!(f, " / unlimited memory"),
        }
    }
}

/// Historical window the engine should evaluate the strategy over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_admits_requests_that_fit() {
        let budget = ResourceBudget {
            max_cpus: Some(4.0),
            max_memory_bytes: Some(1 << 30),
        };
        assert!(budget.admits(&WorkerResources::default()));
        assert!(!budget.admits(&WorkerResources {
            num_cpus: 8.0,
            memory_bytes: 0,
        }));
        assert!(ResourceBudget::unlimited().admits(&WorkerResources {
            num_cpus: 64.0,
            memory_bytes: u64::MAX,
        }));
    }

    #[test]
    fn resources_round_trip() {
        let res = WorkerResources {
            num_cpus: 0.5,
            memory_bytes: 512 * 1024 * 1024,
        };
        let json = serde_json::to_string(&res).unwrap();
        let back: WorkerResources = serde_json::from_str(&json).unwrap();
        assert_eq!(res, back);
    }
}
