use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use sw_executor::ExecutorConfig;
use sw_optimizer::{BatchRequest, RawBatchRequest};
use sw_scheduler::{telemetry, OptimizationService, ServiceConfig};
use tracing::{info, warn};

/// Everything one run needs, loaded from a single TOML file.
#[derive(Debug, Deserialize)]
struct RunnerConfig {
    #[serde(default)]
    service: ServiceConfig,
    executor: ExecutorConfig,
    batch: RawBatchRequest,
    #[serde(default = "default_progress_interval")]
    progress_interval_secs: u64,
}

fn default_progress_interval() -> u64 {
    10
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("info");

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: sw-runner <config.toml>")?;
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: RunnerConfig =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    config.service.validate()?;

    let request = BatchRequest::try_from(config.batch)?;
    let service = OptimizationService::restore(config.service, config.executor.build())?;
    let batch_id = service.submit(request)?;
    info!(batch_id = %batch_id, "batch submitted");

    let mut ticker = tokio::time::interval(Duration::from_secs(config.progress_interval_secs.max(1)));
    let mut interrupted = false;
    loop {
        tokio::select! {
            report = service.wait(batch_id) => {
                let report = report?;
                info!(
                    batch_id = %batch_id,
                    status = ?report.status,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    cancelled = report.cancelled,
                    "batch finished"
                );
                break;
            }
            _ = ticker.tick() => {
                let report = service.status(batch_id)?;
                info!(
                    batch_id = %batch_id,
                    completed = report.completed,
                    total = report.total,
                    running = report.running,
                    eta_seconds = ?report.eta_seconds.map(|s| s.round()),
                    best = ?report
                        .best_result_so_far
                        .as_ref()
                        .map(|r| r.parameter_set.to_string()),
                    "progress"
                );
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                    continue;
                }
                let cancel = service.cancel(batch_id)?;
                warn!(
                    cancelled_queued = cancel.cancelled_queued,
                    signalled_running = cancel.signalled_running,
                    "interrupted; cancelling batch"
                );
            }
        }
    }

    let results = service.results(batch_id)?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
