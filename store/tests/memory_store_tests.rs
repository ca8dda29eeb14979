use chrono::{Duration, Utc};
use tokio::test;

use corelib::{BatchError, BatchStatus, ExitStatus, JobParameters, StepExecution};
use store::{ExecutionRecordStore, MemoryExecutionStore};

fn params(run: i64) -> JobParameters {
    JobParameters::new().with_long("run.id", run)
}

#[test]
async fn second_launch_of_running_instance_is_rejected() -> anyhow::Result<()> {
    let store = MemoryExecutionStore::new();

    let first = store.create_job_execution("nightly-etl", &params(1)).await?;
    let err = store
        .create_job_execution("nightly-etl", &params(1))
        .await
        .unwrap_err();

    match err {
        BatchError::AlreadyRunning { execution_id, .. } => assert_eq!(execution_id, Some(first.id)),
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
async fn completed_instance_cannot_be_relaunched() -> anyhow::Result<()> {
    let store = MemoryExecutionStore::new();

    let mut exec = store.create_job_execution("nightly-etl", &params(1)).await?;
    exec.status = BatchStatus::Completed;
    exec.exit_status = ExitStatus::completed();
    exec.end_time = Some(Utc::now());
    store.update_job_execution(&mut exec).await?;

    let err = store
        .create_job_execution("nightly-etl", &params(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::InstanceAlreadyComplete { .. }));

    // Different identifying parameters form a new instance.
    let other = store.create_job_execution("nightly-etl", &params(2)).await?;
    assert_ne!(other.instance_id, exec.instance_id);
    Ok(())
}

#[test]
async fn failed_instance_can_be_restarted() -> anyhow::Result<()> {
    let store = MemoryExecutionStore::new();

    let mut exec = store.create_job_execution("nightly-etl", &params(1)).await?;
    exec.status = BatchStatus::Failed;
    exec.end_time = Some(Utc::now());
    store.update_job_execution(&mut exec).await?;

    let retry = store.create_job_execution("nightly-etl", &params(1)).await?;
    assert_eq!(retry.instance_id, exec.instance_id);
    assert_ne!(retry.id, exec.id);

    let last = store
        .get_last_job_execution("nightly-etl", &params(1))
        .await?
        .expect("last execution");
    assert_eq!(last.id, retry.id);
    Ok(())
}

#[test]
async fn stale_update_is_a_conflict() -> anyhow::Result<()> {
    let store = MemoryExecutionStore::new();
    let job = store.create_job_execution("nightly-etl", &params(1)).await?;

    let mut step = StepExecution::new("load", job.id);
    store.add_step_execution(&mut step).await?;

    let mut stale = step.clone();

    step.read_count = 10;
    store.update_step_execution(&mut step).await?;
    assert_eq!(step.version, 1);

    stale.read_count = 3;
    let err = store.update_step_execution(&mut stale).await.unwrap_err();
    assert!(matches!(
        err,
        BatchError::ConcurrencyConflict { expected: 0, actual: 1, .. }
    ));

    let stored = store.get_step_execution(job.id, step.id).await?.expect("step");
    assert_eq!(stored.read_count, 10);
    Ok(())
}

#[test]
async fn updating_unknown_step_reports_unknown_partition() -> anyhow::Result<()> {
    let store = MemoryExecutionStore::new();
    let job = store.create_job_execution("nightly-etl", &params(1)).await?;

    let mut ghost = StepExecution::new("load", job.id);
    ghost.id = 99;

    let err = store.update_step_execution(&mut ghost).await.unwrap_err();
    assert!(matches!(err, BatchError::UnknownPartition { step_execution_id: 99, .. }));
    Ok(())
}

#[test]
async fn running_executions_are_listed_per_job() -> anyhow::Result<()> {
    let store = MemoryExecutionStore::new();

    let a = store.create_job_execution("nightly-etl", &params(1)).await?;
    let mut b = store.create_job_execution("nightly-etl", &params(2)).await?;
    store.create_job_execution("weekly-report", &params(1)).await?;

    b.status = BatchStatus::Completed;
    b.end_time = Some(Utc::now());
    store.update_job_execution(&mut b).await?;

    let running = store.find_running_job_executions("nightly-etl").await?;
    assert_eq!(running.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a.id]);

    assert_eq!(
        store.job_names().await?,
        vec!["nightly-etl".to_string(), "weekly-report".to_string()]
    );
    Ok(())
}

#[test]
async fn job_execution_carries_its_steps() -> anyhow::Result<()> {
    let store = MemoryExecutionStore::new();
    let job = store.create_job_execution("nightly-etl", &params(1)).await?;

    for name in ["load:partition0", "load:partition1"] {
        let mut step = StepExecution::new(name, job.id);
        store.add_step_execution(&mut step).await?;
    }

    let loaded = store.get_job_execution(job.id).await?.expect("job");
    assert_eq!(loaded.step_executions.len(), 2);
    Ok(())
}

#[test]
async fn step_history_is_newest_first_and_bounded() -> anyhow::Result<()> {
    let store = MemoryExecutionStore::new();
    let base = Utc::now();

    for run in 0..5 {
        let job = store.create_job_execution("nightly-etl", &params(run)).await?;
        let mut step = StepExecution::new("load", job.id);
        step.start_time = base + Duration::seconds(run);
        step.read_count = run as u64;
        store.add_step_execution(&mut step).await?;
    }

    let recent = store.find_step_executions("load", 3).await?;
    assert_eq!(
        recent.iter().map(|s| s.read_count).collect::<Vec<_>>(),
        vec![4, 3, 2]
    );

    let instances = store.find_job_instances("nightly-etl", 1, 2).await?;
    assert_eq!(instances.len(), 2);
    assert!(instances[0].id > instances[1].id);
    Ok(())
}
