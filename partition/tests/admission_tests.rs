use std::sync::Arc;
use std::time::Duration;

use tokio::test;

use corelib::{BatchError, BatchStatus, JobParameters, PartitionRequest, StepExecution};
use engine::{StepRegistry, TaskletStep};
use partition::{
    AdmissionController, LocalDispatcher, LocalDispatcherConfig, RoundRobinPool, Weighted,
    WorkerDispatcher,
};
use store::{ExecutionRecordStore, MemoryExecutionStore};

use stubs::{Adding, Blocking, Counter, Grid};

#[test]
async fn threshold_converges_to_grid_size() -> anyhow::Result<()> {
    for g in 1..=6 {
        let grid = Grid::new(g);
        let controller = AdmissionController::new();
        let mut previous = controller.threshold();

        for i in 0..400 {
            let _ = controller.handle(&grid, PartitionRequest::new("load", 1, i)).await;
            assert!(controller.threshold() >= previous);
            previous = controller.threshold();
        }

        let threshold = controller.threshold();
        assert!(
            (threshold - g as f64).abs() <= 1.0,
            "grid of {g} settled at threshold {threshold}"
        );
    }
    Ok(())
}

async fn partition_requests(
    store: &Arc<MemoryExecutionStore>,
    n: usize,
) -> anyhow::Result<Vec<PartitionRequest>> {
    let job = store
        .create_job_execution("nightly-etl", &JobParameters::new())
        .await?;
    let mut requests = Vec::new();
    for i in 0..n {
        let mut step = StepExecution::new(format!("load:partition{i}"), job.id);
        store.add_step_execution(&mut step).await?;
        requests.push(PartitionRequest::new("load", job.id, step.id));
    }
    Ok(requests)
}

fn blocking_registry() -> Arc<StepRegistry> {
    let registry = StepRegistry::new();
    registry.register(Arc::new(Blocking { name: "load".into() }));
    Arc::new(registry)
}

fn no_settle(weight: f64) -> LocalDispatcherConfig {
    LocalDispatcherConfig {
        weight,
        settle_delay: Duration::ZERO,
    }
}

#[test]
async fn single_slot_local_worker_walks_through_admission() -> anyhow::Result<()> {
    let store = Arc::new(MemoryExecutionStore::new());
    let requests = partition_requests(&store, 2).await?;
    let worker = LocalDispatcher::new("local-0", blocking_registry(), store.clone(), no_settle(1.0));
    let controller = AdmissionController::new();

    controller.handle(&worker, requests[0].clone()).await?;
    assert_eq!(controller.threshold(), 1.0);
    assert_eq!(controller.score(), 0.0);
    assert_eq!(worker.load(), 1);

    let err = controller.handle(&worker, requests[1].clone()).await.unwrap_err();
    assert!(matches!(err, BatchError::AdmissionRejected { .. }));
    assert_eq!(controller.threshold(), 1.0);

    controller.handle(&worker, requests[1].clone()).await.unwrap_err();
    assert_eq!(controller.threshold(), 2.0);

    controller.handle(&worker, requests[1].clone()).await?;
    assert_eq!(worker.load(), 2);

    worker.shutdown();
    Ok(())
}

#[test]
async fn duplicate_request_is_not_run_twice() -> anyhow::Result<()> {
    let store = Arc::new(MemoryExecutionStore::new());
    let requests = partition_requests(&store, 1).await?;
    let worker = LocalDispatcher::new("local-0", blocking_registry(), store.clone(), no_settle(1.0));

    let mut request = requests[0].clone();
    request.threshold = 4.0;
    worker.execute(request.clone()).await?;
    let again = worker.execute(request).await?;

    assert!(!again.rejected);
    assert_eq!(worker.load(), 1);
    worker.shutdown();
    Ok(())
}

#[test]
async fn finished_partition_is_not_run_again() -> anyhow::Result<()> {
    let store = Arc::new(MemoryExecutionStore::new());
    let requests = partition_requests(&store, 1).await?;
    let registry = StepRegistry::new();
    registry.register(Arc::new(TaskletStep::new("load", Arc::new(Adding(5)))));
    let worker = LocalDispatcher::new("local-0", Arc::new(registry), store.clone(), no_settle(1.0));

    let request = requests[0].clone();
    worker.execute(request.clone()).await?;

    let mut finished = None;
    for _ in 0..200 {
        let current = store
            .get_step_execution(request.job_execution_id, request.step_execution_id)
            .await?
            .expect("partition record");
        if current.status == BatchStatus::Completed && worker.load() == 0 {
            finished = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let finished = finished.expect("partition completes");
    assert_eq!(finished.read_count, 5);

    let again = worker.execute(request.clone()).await?;
    assert!(!again.rejected);
    assert_eq!(worker.load(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let stored = store
        .get_step_execution(request.job_execution_id, request.step_execution_id)
        .await?
        .expect("partition record");
    assert_eq!(stored.status, BatchStatus::Completed);
    assert_eq!(stored.read_count, 5);
    assert_eq!(stored.write_count, 5);
    assert_eq!(stored.version, finished.version);
    worker.shutdown();
    Ok(())
}

#[test]
async fn weight_scales_local_capacity() -> anyhow::Result<()> {
    let store = Arc::new(MemoryExecutionStore::new());
    let requests = partition_requests(&store, 3).await?;
    let worker = LocalDispatcher::new("local-0", blocking_registry(), store.clone(), no_settle(2.0));

    let responses = [
        worker.execute(requests[0].clone()).await?,
        worker.execute(requests[1].clone()).await?,
        worker.execute(requests[2].clone()).await?,
    ];

    assert!(!responses[0].rejected);
    assert!(!responses[1].rejected);
    assert!(responses[2].rejected);
    assert_eq!(responses[2].capacity, 0.0);
    worker.shutdown();
    Ok(())
}

#[test]
async fn unknown_step_and_partition_are_not_retryable() -> anyhow::Result<()> {
    let store = Arc::new(MemoryExecutionStore::new());
    let requests = partition_requests(&store, 1).await?;
    let worker = LocalDispatcher::new("local-0", blocking_registry(), store.clone(), no_settle(1.0));
    let controller = AdmissionController::new();

    let mut wrong_step = requests[0].clone();
    wrong_step.step_name = "transform".into();
    let err = controller.handle(&worker, wrong_step).await.unwrap_err();
    assert!(matches!(err, BatchError::UnknownStep(ref name) if name == "transform"));
    assert!(!err.is_retryable());

    let missing = PartitionRequest::new("load", requests[0].job_execution_id, 9_999);
    let err = controller.handle(&worker, missing).await.unwrap_err();
    assert!(matches!(err, BatchError::UnknownPartition { step_execution_id: 9_999, .. }));
    assert!(!err.is_retryable());

    assert_eq!(controller.snapshot().rejected_total, 0);
    assert_eq!(worker.load(), 0);
    Ok(())
}

#[test]
async fn round_robin_spreads_calls_evenly() -> anyhow::Result<()> {
    let counters: Vec<Arc<Counter>> = (0..3).map(|_| Arc::new(Counter::default())).collect();
    let pool = RoundRobinPool::new(
        counters
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn WorkerDispatcher>)
            .collect(),
    );
    let controller = AdmissionController::new();

    for i in 0..30 {
        controller.handle(&pool, PartitionRequest::new("load", 1, i)).await?;
    }

    for counter in &counters {
        assert_eq!(counter.calls(), 10);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn round_robin_is_fair_under_concurrent_callers() -> anyhow::Result<()> {
    let counters: Vec<Arc<Counter>> = (0..4).map(|_| Arc::new(Counter::default())).collect();
    let pool = Arc::new(RoundRobinPool::new(
        counters
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn WorkerDispatcher>)
            .collect(),
    ));

    let mut tasks = Vec::new();
    for caller in 0..8 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                pool.execute(PartitionRequest::new("load", 1, caller * 100 + i)).await?;
            }
            Ok::<_, BatchError>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    // Every call advances the cursor exactly once.
    for counter in &counters {
        assert_eq!(counter.calls(), 50);
    }
    Ok(())
}

#[test]
async fn pool_status_sums_available_workers() -> anyhow::Result<()> {
    let store = Arc::new(MemoryExecutionStore::new());
    let requests = partition_requests(&store, 2).await?;
    let registry = blocking_registry();

    let a = Arc::new(LocalDispatcher::new("local-a", registry.clone(), store.clone(), no_settle(1.0)));
    let b = Arc::new(LocalDispatcher::new("local-b", registry, store.clone(), no_settle(1.0)));
    let pool = RoundRobinPool::new(vec![
        a.clone() as Arc<dyn WorkerDispatcher>,
        Arc::new(Weighted::new(b.clone(), 2.0)),
    ]);

    let mut first = requests[0].clone();
    first.threshold = 1.0;
    let mut second = requests[1].clone();
    second.threshold = 1.0;
    pool.execute(first).await?;
    pool.execute(second).await?;

    let status = pool.status().await;
    assert!(status.available);
    assert_eq!(status.score, 2.0);

    a.shutdown();
    b.shutdown();
    Ok(())
}

#[test]
async fn empty_pool_is_a_transport_error() -> anyhow::Result<()> {
    let pool = RoundRobinPool::new(Vec::new());
    let err = pool
        .execute(PartitionRequest::new("load", 1, 1))
        .await
        .unwrap_err();

    assert!(matches!(err, BatchError::Transport(_)));
    assert!(!pool.status().await.available);
    Ok(())
}
