//! Executor backend selection.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::adapter::JobExecutor;
use crate::container::{ContainerConfig, ContainerExecutor};
use crate::process::{LocalProcessConfig, LocalProcessExecutor};

/// Which isolation backend runs the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ExecutorConfig {
    LocalProcess(LocalProcessConfig),
    Container(ContainerConfig),
}

impl ExecutorConfig {
    pub fn build(&self) -> Arc<dyn JobExecutor> {
        match self {
            Self::LocalProcess(config) => Arc::new(LocalProcessExecutor::new(config.clone())),
            Self::Container(config) => Arc::new(ContainerExecutor::new(config.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_backend_from_tag() {
        let local: ExecutorConfig = serde_json::from_str(
            r#"{"backend": "local_process", "program": "./engine", "work_root": "/tmp/sweeps"}"#,
        )
        .unwrap();
        assert_eq!(local.build().name(), "local_process");

        let container: ExecutorConfig = serde_json::from_str(
            r#"{"backend": "container", "image": "backtester:latest", "work_root": "/tmp/sweeps"}"#,
        )
        .unwrap();
        match &container {
            ExecutorConfig::Container(c) => {
                assert_eq!(c.runtime, "docker");
                assert_eq!(c.mount_point, "/work");
                assert_eq!(c.artifact_file, "metrics.json");
            }
            other => panic!("unexpected config {other:?}"),
        }
        assert_eq!(container.build().name(), "container");
    }
}
