//! Container execution: the engine runs in a throwaway container per job,
//! driven through a docker-compatible CLI.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::adapter::{CancelSignal, EngineInvocation, ExecutionOutcome, JobExecutor};
use crate::process::{
    default_artifact_file, invocation_env, prepare_job_dir, run_to_outcome, substitute, JobDir,
};

/// Configuration for [`ContainerExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container CLI, e.g. "docker" or "podman".
    #[serde(default = "default_runtime")]
    pub runtime: String,
    pub image: String,
    /// Arguments passed to the image. Placeholders refer to paths inside the
    /// container.
    #[serde(default)]
    pub args: Vec<String>,
    /// Host directory holding per-job work directories.
    pub work_root: PathBuf,
    /// Where the job directory is mounted inside the container.
    #[serde(default = "default_mount_point")]
    pub mount_point: String,
    #[serde(default = "default_artifact_file")]
    pub artifact_file: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Extra flags for `run`, e.g. `--network=none`.
    #[serde(default)]
    pub run_args: Vec<String>,
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_mount_point() -> String {
    "/work".to_string()
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>, work_root: impl Into<PathBuf>) -> Self {
        Self {
            runtime: default_runtime(),
            image: image.into(),
            args: Vec::new(),
            work_root: work_root.into(),
            mount_point: default_mount_point(),
            artifact_file: default_artifact_file(),
            env: BTreeMap::new(),
            run_args: Vec::new(),
        }
    }
}

/// Runs the engine inside a container per job. Resource reservations become
/// `--cpus` / `--memory` limits.
#[derive(Debug, Clone)]
pub struct ContainerExecutor {
    config: ContainerConfig,
}

impl ContainerExecutor {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    fn container_name(invocation: &EngineInvocation) -> String {
        format!("sweep-{}", invocation.job_id)
    }

    pub(crate) fn build_command(&self, invocation: &EngineInvocation, dir: &JobDir) -> Command {
        let mount = Path::new(&self.config.mount_point);
        let inner_invocation = mount.join(
            dir.invocation
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("invocation.json")),
        );
        let inner_artifact = mount.join(&self.config.artifact_file);

        let mut command = Command::new(&self.config.runtime);
        command
            .arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(Self::container_name(invocation))
            .arg("-v")
            .arg(format!("{}:{}", dir.root.display(), self.config.mount_point))
            .arg("-w")
            .arg(&self.config.mount_point);

        if invocation.resources.num_cpus > 0.0 {
            command.arg(format!("--cpus={}", invocation.resources.num_cpus));
        }
        if invocation.resources.memory_bytes > 0 {
            command.arg(format!("--memory={}b", invocation.resources.memory_bytes));
        }
        for (key, value) in &self.config.env {
            command.arg("-e").arg(format!("{key}={value}"));
        }
        for (key, value) in invocation_env(invocation, &inner_invocation, &inner_artifact, mount) {
            command.arg("-e").arg(format!("{key}={value}"));
        }
        command.args(&self.config.run_args);
        command.arg(&self.config.image);
        for arg in &self.config.args {
            command.arg(substitute(
                arg,
                &inner_invocation,
                &inner_artifact,
                mount,
                &invocation.strategy_reference,
            ));
        }
        command
    }

    /// Killing the CLI client does not stop the container; do it explicitly.
    async fn kill_container(&self, name: &str) {
        let result = Command::new(&self.config.runtime)
            .arg("kill")
            .arg(name)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!(container = name, error = %e, "failed to kill container");
        }
    }
}

#[async_trait]
impl JobExecutor for ContainerExecutor {
    async fn execute(
        &self,
        invocation: EngineInvocation,
        timeout: Duration,
        mut cancel: CancelSignal,
    ) -> ExecutionOutcome {
        let dir = match prepare_job_dir(&self.config.work_root, &invocation, &self.config.artifact_file).await {
            Ok(dir) => dir,
            Err(e) => return ExecutionOutcome::failed(e),
        };
        let command = self.build_command(&invocation, &dir);
        let name = Self::container_name(&invocation);

        info!(
            job_id = %invocation.job_id,
            image = %self.config.image,
            container = %name,
            "launching engine container"
        );
        let outcome = run_to_outcome(command, &dir.artifact, timeout, &mut cancel).await;
        if matches!(outcome, ExecutionOutcome::TimedOut | ExecutionOutcome::Cancelled) {
            self.kill_container(&name).await;
        }
        outcome
    }

    fn name(&self) -> &str {
        "container"
    }
}
