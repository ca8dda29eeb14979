use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::test;

use corelib::{BatchStatus, ExitStatus, JobParameters, StepExecution};
use history::{HistoryWindow, MetricsRegistry};
use store::{ExecutionRecordStore, MemoryExecutionStore};

async fn run_job(
    store: &MemoryExecutionStore,
    run: i64,
    read: u64,
    status: BatchStatus,
) -> anyhow::Result<()> {
    let mut job = store
        .create_job_execution("nightly-etl", &JobParameters::new().with_long("run.id", run))
        .await?;
    job.start_time = Some(job.create_time);

    let mut step = StepExecution::new("load", job.id);
    store.add_step_execution(&mut step).await?;
    step.read_count = read;
    step.write_count = read;
    step.status = status;
    step.exit_status = ExitStatus::for_status(status);
    step.end_time = Some(Utc::now());
    store.update_step_execution(&mut step).await?;

    job.status = status;
    job.exit_status = ExitStatus::for_status(status);
    job.end_time = Some(Utc::now());
    store.update_job_execution(&mut job).await?;
    Ok(())
}

#[test]
async fn snapshot_covers_registered_names_only() -> anyhow::Result<()> {
    let store = Arc::new(MemoryExecutionStore::new());
    run_job(&store, 1, 10, BatchStatus::Completed).await?;
    run_job(&store, 2, 30, BatchStatus::Failed).await?;

    let registry = MetricsRegistry::new(store.clone(), HistoryWindow::default());
    assert!(registry.register_job("nightly-etl"));
    assert!(!registry.register_job("nightly-etl"));
    registry.register_step("load");
    registry.register_step("unused");

    let snapshot = registry.snapshot().await?;

    let job = &snapshot.jobs["nightly-etl"];
    assert_eq!(job.execution_count, 2);
    assert_eq!(job.failure_count, 1);

    let step = &snapshot.steps["load"];
    assert_eq!(step.execution_count, 2);
    assert_eq!(step.mean_read_count, 20.0);
    assert_eq!(step.max_write_count, 30.0);

    assert_eq!(snapshot.steps["unused"].execution_count, 0);

    assert!(registry.unregister_step("unused"));
    let snapshot = registry.snapshot().await?;
    assert!(!snapshot.steps.contains_key("unused"));
    Ok(())
}

#[test]
async fn window_bounds_statistics() -> anyhow::Result<()> {
    let store = Arc::new(MemoryExecutionStore::new());
    for run in 0..6 {
        run_job(&store, run, 1, BatchStatus::Completed).await?;
    }

    let window = HistoryWindow {
        executions: 4,
        latest: 2,
    };
    let registry = MetricsRegistry::new(store.clone(), window);
    registry.register_job("nightly-etl");
    registry.register_step("load");

    let snapshot = registry.snapshot().await?;
    assert_eq!(snapshot.jobs["nightly-etl"].execution_count, 4);
    assert_eq!(snapshot.steps["load"].execution_count, 4);
    Ok(())
}

#[test]
async fn reporter_lifecycle() -> anyhow::Result<()> {
    let store = Arc::new(MemoryExecutionStore::new());
    let registry = Arc::new(MetricsRegistry::new(store, HistoryWindow::default()));
    registry.register_job("nightly-etl");

    assert!(!registry.is_running());
    assert!(registry.start(Duration::from_millis(10)));
    assert!(!registry.start(Duration::from_millis(10)));
    assert!(registry.is_running());

    tokio::time::sleep(Duration::from_millis(30)).await;

    registry.stop().await;
    assert!(!registry.is_running());

    // Stopping twice is harmless.
    registry.stop().await;
    Ok(())
}
