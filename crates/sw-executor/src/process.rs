//! Local process execution: the engine runs as a child process per job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use sw_types::ExecutionError;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::{ArtifactRef, CancelSignal, EngineInvocation, ExecutionOutcome, JobExecutor};

/// Bytes of engine stderr kept for failure diagnostics.
const STDERR_TAIL_BYTES: usize = 2048;

/// How long stderr may stay open after the engine exits. Background processes
/// left behind by the engine can hold the pipe indefinitely.
const STDERR_DRAIN_LIMIT: Duration = Duration::from_secs(1);

const INVOCATION_FILE: &str = "invocation.json";

/// Configuration for [`LocalProcessExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalProcessConfig {
    /// Engine executable.
    pub program: String,
    /// Arguments. `{invocation}`, `{artifact}`, `{job_dir}` and `{strategy}`
    /// are substituted per job.
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-job work directories are created under
    /// `<work_root>/<batch_id>/<job_id>`.
    pub work_root: PathBuf,
    /// File name the engine writes its metrics to inside the job directory.
    #[serde(default = "default_artifact_file")]
    pub artifact_file: String,
    /// Extra environment for the engine.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

pub(crate) fn default_artifact_file() -> String {
    "metrics.json".to_string()
}

impl LocalProcessConfig {
    pub fn new(program: impl Into<String>, work_root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_root: work_root.into(),
            artifact_file: default_artifact_file(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Paths of one job's work directory.
#[derive(Debug, Clone)]
pub(crate) struct JobDir {
    pub root: PathBuf,
    pub invocation: PathBuf,
    pub artifact: PathBuf,
}

/// Create the job directory and write the invocation file into it.
pub(crate) async fn prepare_job_dir(
    work_root: &Path,
    invocation: &EngineInvocation,
    artifact_file: &str,
) -> Result<JobDir, ExecutionError> {
    let root = work_root
        .join(invocation.batch_id.to_string())
        .join(invocation.job_id.to_string());
    tokio::fs::create_dir_all(&root).await?;

    let invocation_path = root.join(INVOCATION_FILE);
    let body = serde_json::to_vec_pretty(invocation).map_err(|e| ExecutionError::Spawn {
        message: format!("cannot serialize invocation: {e}"),
    })?;
    tokio::fs::write(&invocation_path, body).await?;

    Ok(JobDir {
        artifact: root.join(artifact_file),
        invocation: invocation_path,
        root,
    })
}

/// Replace the per-job placeholders in an argument.
pub(crate) fn substitute(arg: &str, invocation: &Path, artifact: &Path, job_dir: &Path, strategy: &str) -> String {
    arg.replace("{invocation}", &invocation.display().to_string())
        .replace("{artifact}", &artifact.display().to_string())
        .replace("{job_dir}", &job_dir.display().to_string())
        .replace("{strategy}", strategy)
}

/// Environment variables exposing the invocation to the engine.
pub(crate) fn invocation_env(
    invocation: &EngineInvocation,
    invocation_path: &Path,
    artifact_path: &Path,
    job_dir: &Path,
) -> Vec<(String, String)> {
    let mut env = vec![
        ("SWEEP_INVOCATION".to_string(), invocation_path.display().to_string()),
        ("SWEEP_ARTIFACT".to_string(), artifact_path.display().to_string()),
        ("SWEEP_JOB_DIR".to_string(), job_dir.display().to_string()),
        ("SWEEP_JOB_ID".to_string(), invocation.job_id.to_string()),
        ("SWEEP_STRATEGY".to_string(), invocation.strategy_reference.clone()),
    ];
    for (name, value) in &invocation.parameter_set.values {
        let key: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        env.push((format!("SWEEP_PARAM_{key}"), value.to_string()));
    }
    env
}

/// Bounded tail of the engine's stderr, shared between the reader task and
/// the runner so a partial tail survives when the reader is abandoned.
#[derive(Debug, Clone, Default)]
struct StderrTail(Arc<Mutex<VecDeque<u8>>>);

impl StderrTail {
    fn push(&self, bytes: &[u8]) {
        let mut buf = self.0.lock();
        buf.extend(bytes);
        let excess = buf.len().saturating_sub(STDERR_TAIL_BYTES);
        buf.drain(..excess);
    }

    fn text(&self) -> String {
        let mut buf = self.0.lock();
        String::from_utf8_lossy(buf.make_contiguous()).trim().to_string()
    }
}

async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, tail: StderrTail) {
    let mut chunk = [0u8; 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => tail.push(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "failed reading engine stderr");
                break;
            }
        }
    }
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Spawn `command`, wait for it under `timeout` and `cancel`, and turn the
/// exit into an outcome. The child is killed when the timeout fires, when a
/// cancel message arrives, or when this future is dropped.
pub(crate) async fn run_to_outcome(
    mut command: Command,
    artifact_path: &Path,
    timeout: Duration,
    cancel: &mut CancelSignal,
) -> ExecutionOutcome {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecutionOutcome::failed(ExecutionError::Spawn {
                message: e.to_string(),
            })
        }
    };
    let deadline = Instant::now() + timeout;
    let tail = StderrTail::default();
    let reader = child
        .stderr
        .take()
        .map(|s| tokio::spawn(read_tail(s, tail.clone())));

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = tokio::time::sleep_until(deadline) => Waited::TimedOut,
        _ = cancel.cancelled() => Waited::Cancelled,
    };

    let killed = matches!(waited, Waited::TimedOut | Waited::Cancelled);
    if killed {
        if let Err(e) = child.start_kill() {
            warn!(error = %e, "failed to kill engine process");
        }
        let _ = child.wait().await;
    }

    // Grandchildren of the engine may still hold the pipe open, so the drain
    // never outlives the job's deadline.
    if let Some(mut handle) = reader {
        if killed {
            handle.abort();
        } else {
            let budget = deadline
                .saturating_duration_since(Instant::now())
                .min(STDERR_DRAIN_LIMIT);
            if tokio::time::timeout(budget, &mut handle).await.is_err() {
                debug!("engine stderr still open after exit; keeping partial tail");
                handle.abort();
            }
        }
    }
    let stderr_tail = tail.text();

    match waited {
        Waited::TimedOut => ExecutionOutcome::TimedOut,
        Waited::Cancelled => ExecutionOutcome::Cancelled,
        Waited::Exited(Err(e)) => ExecutionOutcome::failed(ExecutionError::Io(e)),
        Waited::Exited(Ok(status)) if !status.success() => {
            ExecutionOutcome::failed(ExecutionError::NonZeroExit {
                status: status.to_string(),
                stderr: stderr_tail,
            })
        }
        Waited::Exited(Ok(_)) => match tokio::fs::metadata(artifact_path).await {
            Ok(meta) if meta.is_file() => ExecutionOutcome::Succeeded {
                artifact: ArtifactRef::File(artifact_path.to_path_buf()),
            },
            _ => ExecutionOutcome::failed(ExecutionError::ArtifactMissing {
                path: artifact_path.display().to_string(),
            }),
        },
    }
}

/// Runs the engine as a local child process per job.
#[derive(Debug, Clone)]
pub struct LocalProcessExecutor {
    config: LocalProcessConfig,
}

impl LocalProcessExecutor {
    pub fn new(config: LocalProcessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LocalProcessConfig {
        &self.config
    }

    fn build_command(&self, invocation: &EngineInvocation, dir: &JobDir) -> Command {
        let mut command = Command::new(&self.config.program);
        for arg in &self.config.args {
            command.arg(substitute(
                arg,
                &dir.invocation,
                &dir.artifact,
                &dir.root,
                &invocation.strategy_reference,
            ));
        }
        command.current_dir(&dir.root);
        command.envs(&self.config.env);
        command.envs(invocation_env(invocation, &dir.invocation, &dir.artifact, &dir.root));
        command
    }
}

#[async_trait]
impl JobExecutor for LocalProcessExecutor {
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

        info!(
            job_id = %invocation.job_id,
            program = %self.config.program,
            "launching engine process"
        );
        run_to_outcome(command, &dir.artifact, timeout, &mut cancel).await
    }

    fn name(&self) -> &str {
        "local_process"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use sw_types::{ParameterSet, ParameterValue, WorkerResources};
    use uuid::Uuid;

    fn invocation() -> EngineInvocation {
        let mut values = BTreeMap::new();
        values.insert("rsi_period".to_string(), ParameterValue::Int(14));
        EngineInvocation {
            job_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            attempt: 0,
            strategy_reference: "rsi_reversion".into(),
            parameter_set: ParameterSet::new(0, values),
            evaluation_window: None,
            resources: WorkerResources::default(),
        }
    }

    fn sh(work_root: &Path, script: &str) -> LocalProcessExecutor {
        LocalProcessExecutor::new(
            LocalProcessConfig::new("/bin/sh", work_root).with_args(["-c", script]),
        )
    }

    #[tokio::test]
    async fn successful_run_reports_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = sh(
            tmp.path(),
            r#"test -f "$SWEEP_INVOCATION" && echo "{\"trade_count\": 12, \"rsi\": $SWEEP_PARAM_RSI_PERIOD}" > "$SWEEP_ARTIFACT""#,
        );

        let outcome = exec
            .execute(invocation(), Duration::from_secs(10), CancelSignal::never())
            .await;
        match outcome {
            ExecutionOutcome::Succeeded { artifact } => {
                let text = artifact.read().await.unwrap();
                let v: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(v["rsi"], 14);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn placeholders_are_substituted() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = LocalProcessExecutor::new(
            LocalProcessConfig::new("/bin/sh", tmp.path()).with_args([
                "-c",
                r#"echo '{"ok": 1}' > "$1""#,
                "engine",
                "{artifact}",
            ]),
        );
        let outcome = exec
            .execute(invocation(), Duration::from_secs(10), CancelSignal::never())
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Succeeded { .. }));
    }

    #[tokio::test]
    async fn nonzero_exit_captures_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = sh(tmp.path(), "echo 'no data for window' >&2; exit 3");
        match exec
            .execute(invocation(), Duration::from_secs(10), CancelSignal::never())
            .await
        {
            ExecutionOutcome::Failed { diagnostic } => {
                assert!(diagnostic.contains("no data for window"), "{diagnostic}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn verbose_stderr_keeps_only_the_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = sh(
            tmp.path(),
            "head -c 200000 /dev/zero | tr '\\0' x >&2; echo 'final line' >&2; exit 2",
        );
        match exec
            .execute(invocation(), Duration::from_secs(10), CancelSignal::never())
            .await
        {
            ExecutionOutcome::Failed { diagnostic } => {
                assert!(diagnostic.contains("final line"), "{diagnostic}");
                assert!(diagnostic.len() < STDERR_TAIL_BYTES + 200, "{}", diagnostic.len());
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lingering_background_process_does_not_hold_execute() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = sh(
            tmp.path(),
            r#"(sleep 8 &); echo '{"sharpe_ratio": 1.2}' > "$SWEEP_ARTIFACT"; exit 0"#,
        );
        let started = std::time::Instant::now();
        let outcome = exec
            .execute(invocation(), Duration::from_secs(2), CancelSignal::never())
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Succeeded { .. }), "{outcome:?}");
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn missing_artifact_is_a_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = sh(tmp.path(), "exit 0");
        match exec
            .execute(invocation(), Duration::from_secs(10), CancelSignal::never())
            .await
        {
            ExecutionOutcome::Failed { diagnostic } => {
                assert!(diagnostic.contains("artifact missing"), "{diagnostic}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_engine_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = sh(tmp.path(), "sleep 30");
        let started = std::time::Instant::now();
        let outcome = exec
            .execute(invocation(), Duration::from_millis(200), CancelSignal::never())
            .await;
        assert_eq!(outcome, ExecutionOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancel_message_terminates_engine() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = sh(tmp.path(), "sleep 30");
        let (handle, signal) = CancelSignal::channel();

        let task = tokio::spawn(async move {
            exec.execute(invocation(), Duration::from_secs(60), signal).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.cancel());

        let outcome = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Cancelled);
    }

    #[test]
    fn parameters_are_exported_as_env() {
        let inv = invocation();
        let env = invocation_env(&inv, Path::new("/i"), Path::new("/a"), Path::new("/d"));
        assert!(env.contains(&("SWEEP_PARAM_RSI_PERIOD".to_string(), "14".to_string())));
        assert!(env.contains(&("SWEEP_STRATEGY".to_string(), "rsi_reversion".to_string())));
    }
}
