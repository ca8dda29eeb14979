use anyhow::Context;
use clap::Parser;

use common::logger::init_logger;
use corelib::BatchError;
use runner::{AppConfig, Batchd, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = AppConfig::from_env();

    init_logger("batchd", cfg.production);
    tracing::info!(job = %cli.job, runs = cli.runs, "Starting batchd...");

    let daemon = Batchd::build(&cfg, &cli).await?;

    let outcomes = tokio::select! {
        outcomes = daemon.run(&cli) => outcomes,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            daemon.cancellation().cancel();
            Vec::new()
        }
    };

    let mut failed = 0usize;
    for outcome in &outcomes {
        match outcome {
            Ok(execution) => tracing::info!(
                job_execution_id = execution.id,
                status = %execution.status,
                exit_code = %execution.exit_status.exit_code,
                "run finished"
            ),
            Err(BatchError::AlreadyRunning { execution_id, .. }) => {
                tracing::warn!(running_execution_id = ?execution_id, "run skipped: job already running")
            }
            Err(e) => {
                failed += 1;
                tracing::error!(error = %e, "run failed");
            }
        }
    }

    let snapshot = daemon.snapshot().await.context("collecting execution metrics")?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    daemon.shutdown().await;

    if failed > 0 {
        anyhow::bail!("{failed} of {} runs failed", outcomes.len());
    }
    Ok(())
}
