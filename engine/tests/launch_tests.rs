use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::test;

use corelib::{BatchError, BatchResult, BatchStatus, ExitStatus, JobParameters, StepExecution};
use engine::{
    Job, JobLauncher, LaunchSynchronizer, SimpleJob, SimpleJobLauncher, Step, StepContext,
    SynchronizedLauncher, SynchronizedStore, Tasklet, TaskletStep,
};
use store::{ExecutionRecordStore, MemoryExecutionStore};

use mock_store::GatedStore;

struct Sleepy {
    millis: u64,
    items: u64,
}

#[async_trait]
impl Tasklet for Sleepy {
    async fn execute(&self, step: &mut StepExecution) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        step.read_count += self.items;
        step.write_count += self.items;
        Ok(())
    }
}

struct Broken;

#[async_trait]
impl Tasklet for Broken {
    async fn execute(&self, _step: &mut StepExecution) -> anyhow::Result<()> {
        anyhow::bail!("source unavailable")
    }
}

/// Step whose record store gives out mid-run.
struct LostStore;

#[async_trait]
impl Step for LostStore {
    fn name(&self) -> &str {
        "extract"
    }

    async fn execute(&self, _ctx: &mut StepContext) -> BatchResult<()> {
        Err(BatchError::storage("database is locked"))
    }
}

fn nightly(millis: u64) -> Arc<dyn Job> {
    Arc::new(
        SimpleJob::new("nightly-etl")
            .with_step(Arc::new(TaskletStep::new("extract", Arc::new(Sleepy { millis, items: 3 })))),
    )
}

/// Launcher stack as the runner wires it: pre-launch check around a launcher
/// whose store runs the post-create check.
fn synchronized_launcher(
    store: Arc<dyn ExecutionRecordStore>,
    sync: Arc<LaunchSynchronizer>,
) -> SynchronizedLauncher {
    let guarded: Arc<dyn ExecutionRecordStore> =
        Arc::new(SynchronizedStore::new(store, sync.clone()));
    SynchronizedLauncher::new(Arc::new(SimpleJobLauncher::new(guarded)), sync)
}

#[test]
async fn simple_job_completes_all_steps() -> anyhow::Result<()> {
    let store: Arc<dyn ExecutionRecordStore> = Arc::new(MemoryExecutionStore::new());
    let launcher = SimpleJobLauncher::new(store.clone());

    let job: Arc<dyn Job> = Arc::new(
        SimpleJob::new("nightly-etl")
            .with_step(Arc::new(TaskletStep::new("extract", Arc::new(Sleepy { millis: 0, items: 4 }))))
            .with_step(Arc::new(TaskletStep::new("load", Arc::new(Sleepy { millis: 0, items: 2 })))),
    );

    let exec = launcher.launch(job, JobParameters::new().with_long("run.id", 1)).await?;

    assert_eq!(exec.status, BatchStatus::Completed);
    assert_eq!(exec.exit_status.exit_code, ExitStatus::COMPLETED);
    assert_eq!(exec.step_executions.len(), 2);
    assert!(exec.end_time.is_some());

    let stored = store.get_job_execution(exec.id).await?.expect("job execution");
    assert_eq!(stored.status, BatchStatus::Completed);
    assert_eq!(stored.step_executions.len(), 2);
    Ok(())
}

#[test]
async fn simple_job_stops_at_first_failed_step() -> anyhow::Result<()> {
    let store: Arc<dyn ExecutionRecordStore> = Arc::new(MemoryExecutionStore::new());
    let launcher = SimpleJobLauncher::new(store.clone());

    let job: Arc<dyn Job> = Arc::new(
        SimpleJob::new("nightly-etl")
            .with_step(Arc::new(TaskletStep::new("extract", Arc::new(Broken))))
            .with_step(Arc::new(TaskletStep::new("load", Arc::new(Sleepy { millis: 0, items: 2 })))),
    );

    let exec = launcher.launch(job, JobParameters::new()).await?;

    assert_eq!(exec.status, BatchStatus::Failed);
    assert_eq!(exec.exit_status.exit_code, ExitStatus::FAILED);
    assert_eq!(exec.step_executions.len(), 1);
    assert_eq!(
        exec.step_executions[0].failure_exceptions,
        vec!["source unavailable".to_string()]
    );
    Ok(())
}

#[test]
async fn step_error_other_than_interruption_fails_the_job() -> anyhow::Result<()> {
    let store: Arc<dyn ExecutionRecordStore> = Arc::new(MemoryExecutionStore::new());
    let launcher = SimpleJobLauncher::new(store.clone());

    let job: Arc<dyn Job> = Arc::new(
        SimpleJob::new("nightly-etl")
            .with_step(Arc::new(LostStore))
            .with_step(Arc::new(TaskletStep::new("load", Arc::new(Sleepy { millis: 0, items: 2 })))),
    );

    let err = launcher.launch(job, JobParameters::new()).await.unwrap_err();
    assert!(matches!(err, BatchError::Storage(_)));

    let instances = store.find_job_instances("nightly-etl", 0, 10).await?;
    let executions = store.get_job_executions(&instances[0]).await?;
    assert_eq!(executions.len(), 1);

    let exec = &executions[0];
    assert_eq!(exec.status, BatchStatus::Failed);
    assert!(exec.exit_status.exit_description.contains("database is locked"));
    assert!(exec.end_time.is_some());
    assert_eq!(exec.step_executions.len(), 1);
    Ok(())
}

#[test]
async fn launch_of_running_tracked_job_fails_without_new_record() -> anyhow::Result<()> {
    let memory = Arc::new(MemoryExecutionStore::new());
    let store: Arc<dyn ExecutionRecordStore> = memory.clone();

    let mut running = store
        .create_job_execution("nightly-etl", &JobParameters::new().with_long("run.id", 1))
        .await?;
    running.status = BatchStatus::Started;
    running.start_time = Some(Utc::now());
    store.update_job_execution(&mut running).await?;

    let sync = Arc::new(LaunchSynchronizer::with_jobs(store.clone(), ["nightly-etl"]));
    let launcher = synchronized_launcher(store.clone(), sync);

    let err = launcher
        .launch(nightly(0), JobParameters::new().with_long("run.id", 2))
        .await
        .unwrap_err();

    match err {
        BatchError::AlreadyRunning { execution_id, .. } => assert_eq!(execution_id, Some(running.id)),
        other => panic!("unexpected error: {other}"),
    }

    let instances = store.find_job_instances("nightly-etl", 0, 10).await?;
    assert_eq!(instances.len(), 1);
    assert!(store.get_job_execution(running.id + 1).await?.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_launches_leave_one_survivor() -> anyhow::Result<()> {
    let gated = GatedStore::new(2);
    let store: Arc<dyn ExecutionRecordStore> = gated.clone();
    let sync = Arc::new(LaunchSynchronizer::with_jobs(store.clone(), ["nightly-etl"]));
    let launcher = Arc::new(synchronized_launcher(store.clone(), sync));

    let a = {
        let launcher = launcher.clone();
        tokio::spawn(async move {
            launcher
                .launch(nightly(100), JobParameters::new().with_long("run.id", 1))
                .await
        })
    };
    let b = {
        let launcher = launcher.clone();
        tokio::spawn(async move {
            launcher
                .launch(nightly(100), JobParameters::new().with_long("run.id", 2))
                .await
        })
    };

    let outcomes = [a.await?, b.await?];
    let succeeded: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
    let refused: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().err()).collect();

    assert_eq!(succeeded.len(), 1);
    assert_eq!(refused.len(), 1);
    assert!(matches!(refused[0], BatchError::AlreadyRunning { .. }));
    assert_eq!(succeeded[0].status, BatchStatus::Completed);

    // Both got past the first checkpoint, so both have records.
    let mut executions = Vec::new();
    for instance in store.find_job_instances("nightly-etl", 0, 10).await? {
        executions.extend(store.get_job_executions(&instance).await?);
    }
    assert_eq!(executions.len(), 2);

    let abandoned: Vec<_> = executions
        .iter()
        .filter(|e| e.status == BatchStatus::Abandoned)
        .collect();
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].exit_status.exit_code, ExitStatus::NOOP);
    assert!(abandoned[0].end_time.is_some());

    let survivors = executions
        .iter()
        .filter(|e| e.status.is_terminal() && e.status != BatchStatus::Abandoned)
        .count();
    assert_eq!(survivors, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn three_concurrent_launches_leave_one_survivor() -> anyhow::Result<()> {
    let gated = GatedStore::new(3);
    let store: Arc<dyn ExecutionRecordStore> = gated.clone();
    let sync = Arc::new(LaunchSynchronizer::with_jobs(store.clone(), ["nightly-etl"]));
    let launcher = Arc::new(synchronized_launcher(store.clone(), sync));

    let handles: Vec<_> = (1..=3)
        .map(|run| {
            let launcher = launcher.clone();
            tokio::spawn(async move {
                launcher
                    .launch(nightly(200), JobParameters::new().with_long("run.id", run))
                    .await
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await?);
    }
    let succeeded: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
    let refused: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().err()).collect();

    assert_eq!(succeeded.len(), 1);
    assert_eq!(refused.len(), 2);
    assert!(
        refused
            .iter()
            .all(|e| matches!(e, BatchError::AlreadyRunning { .. }))
    );
    assert_eq!(succeeded[0].status, BatchStatus::Completed);

    let mut executions = Vec::new();
    for instance in store.find_job_instances("nightly-etl", 0, 10).await? {
        executions.extend(store.get_job_executions(&instance).await?);
    }
    assert_eq!(executions.len(), 3);

    let abandoned: Vec<_> = executions
        .iter()
        .filter(|e| e.status == BatchStatus::Abandoned)
        .collect();
    assert_eq!(abandoned.len(), 2);
    assert!(
        abandoned
            .iter()
            .all(|e| e.exit_status.exit_code == ExitStatus::NOOP && e.end_time.is_some())
    );

    let survivors: Vec<_> = executions
        .iter()
        .filter(|e| e.status != BatchStatus::Abandoned)
        .collect();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].id, succeeded[0].id);
    Ok(())
}

#[test]
async fn untracked_job_is_not_single_flight() -> anyhow::Result<()> {
    let store: Arc<dyn ExecutionRecordStore> = Arc::new(MemoryExecutionStore::new());
    let sync = Arc::new(LaunchSynchronizer::new(store.clone()));
    let launcher = synchronized_launcher(store.clone(), sync);

    let mut running = store
        .create_job_execution("nightly-etl", &JobParameters::new().with_long("run.id", 1))
        .await?;
    running.status = BatchStatus::Started;
    store.update_job_execution(&mut running).await?;

    let exec = launcher
        .launch(nightly(0), JobParameters::new().with_long("run.id", 2))
        .await?;
    assert_eq!(exec.status, BatchStatus::Completed);
    Ok(())
}
