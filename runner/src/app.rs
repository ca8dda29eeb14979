//! Wiring of the batch daemon: store, worker pool, partitioned demo job,
//! synchronized launcher and metrics.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use corelib::{BatchResult, JobExecution, StepExecution};
use engine::{
    Job, JobLauncher, LaunchSynchronizer, SimpleJob, SimpleJobLauncher, StepRegistry,
    SynchronizedLauncher, SynchronizedStore, Tasklet, TaskletStep,
};
use history::{MetricsRegistry, MetricsSnapshot};
use partition::{
    ChannelDispatcher, DispatchingAggregator, LocalDispatcher, PARTITION_INDEX_KEY,
    PartitionCoordinator, PartitionStep, RoundRobinPool, SimplePartitioner,
    StepExecutionSplitter, Weighted, WorkerDispatcher,
};
use store::{ExecutionRecordStore, MemoryExecutionStore, SqliteExecutionStore};

use crate::cli::Cli;
use crate::config::AppConfig;

/// Master step of the demo job.
pub const MASTER_STEP: &str = "count";
/// Name workers know the partition step by.
pub const WORKER_STEP: &str = "count.partition";

const CHUNK_SIZE: u64 = 10;

/// Counts `items` per partition in chunks, filtering every item whose global
/// position is a multiple of 13.
pub struct CountingTasklet {
    pub items: u64,
}

#[async_trait]
impl Tasklet for CountingTasklet {
    async fn execute(&self, step: &mut StepExecution) -> anyhow::Result<()> {
        let index = step
            .execution_context
            .get(PARTITION_INDEX_KEY)
            .and_then(|v| v.as_u64())
            .context("partition index missing from execution context")?;

        let first = index * self.items;
        let mut position = first;
        while position < first + self.items {
            let end = (position + CHUNK_SIZE).min(first + self.items);
            let filtered = (position..end).filter(|p| p % 13 == 0).count() as u64;

            step.read_count += end - position;
            step.filter_count += filtered;
            step.write_count += end - position - filtered;
            step.commit_count += 1;
            position = end;

            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

pub struct Batchd {
    store: Arc<dyn ExecutionRecordStore>,
    launcher: Arc<dyn JobLauncher>,
    synchronizer: Arc<LaunchSynchronizer>,
    metrics: Arc<MetricsRegistry>,
    job: Arc<dyn Job>,
    workers: Vec<Arc<LocalDispatcher>>,
    transport: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

async fn open_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn ExecutionRecordStore>> {
    Ok(match &cfg.database_url {
        Some(url) => Arc::new(
            SqliteExecutionStore::connect(url)
                .await
                .with_context(|| format!("opening execution store at {url}"))?,
        ),
        None => {
            warn!("no database configured; execution records are kept in memory");
            Arc::new(MemoryExecutionStore::new())
        }
    })
}

impl Batchd {
    pub async fn build(cfg: &AppConfig, cli: &Cli) -> anyhow::Result<Self> {
        let store = open_store(cfg).await?;
        Ok(Self::with_store(store, cfg, cli))
    }

    /// Everything but the store. Must be called inside a tokio runtime.
    pub fn with_store(store: Arc<dyn ExecutionRecordStore>, cfg: &AppConfig, cli: &Cli) -> Self {
        let cancel = CancellationToken::new();

        let registry = Arc::new(StepRegistry::new());
        registry.register(Arc::new(TaskletStep::new(
            WORKER_STEP,
            Arc::new(CountingTasklet {
                items: cli.items_per_partition,
            }),
        )));

        let workers: Vec<Arc<LocalDispatcher>> = (0..cfg.workers)
            .map(|i| {
                Arc::new(LocalDispatcher::new(
                    format!("local-{i}"),
                    Arc::clone(&registry),
                    Arc::clone(&store),
                    cfg.dispatcher_config(),
                ))
            })
            .collect();

        let mut transport = None;
        let mut members: Vec<Arc<dyn WorkerDispatcher>> = Vec::with_capacity(workers.len());
        for (i, worker) in workers.iter().enumerate() {
            let remote = workers.len() > 1 && i == workers.len() - 1;
            let dispatcher: Arc<dyn WorkerDispatcher> = if remote {
                let (client, handle) =
                    ChannelDispatcher::spawn(format!("remote-{i}"), worker.clone(), 64);
                transport = Some(handle);
                Arc::new(client)
            } else {
                worker.clone() as Arc<dyn WorkerDispatcher>
            };

            let weight = cfg.weight_for(i);
            members.push(if weight == 1.0 {
                dispatcher
            } else {
                Arc::new(Weighted::new(dispatcher, weight)) as Arc<dyn WorkerDispatcher>
            });
        }
        let pool = Arc::new(RoundRobinPool::new(members));

        let aggregator = Arc::new(
            DispatchingAggregator::new(pool, Arc::clone(&store), cfg.aggregator_config())
                .with_cancellation(cancel.clone()),
        );
        let coordinator = PartitionCoordinator::new(aggregator, Arc::clone(&store), WORKER_STEP);
        let splitter = StepExecutionSplitter::new(Arc::clone(&store), Arc::new(SimplePartitioner));
        let grid_size = cli.grid_size.unwrap_or(cfg.grid_size);
        let master = PartitionStep::new(MASTER_STEP, splitter, coordinator, grid_size);

        let job: Arc<dyn Job> = Arc::new(SimpleJob::new(cli.job.clone()).with_step(Arc::new(master)));

        let mut tracked = cfg.tracked_jobs.clone();
        tracked.push(cli.job.clone());
        let synchronizer = Arc::new(LaunchSynchronizer::with_jobs(Arc::clone(&store), tracked));
        let guarded: Arc<dyn ExecutionRecordStore> = Arc::new(SynchronizedStore::new(
            Arc::clone(&store),
            Arc::clone(&synchronizer),
        ));
        let launcher: Arc<dyn JobLauncher> = Arc::new(SynchronizedLauncher::new(
            Arc::new(SimpleJobLauncher::with_cancellation(guarded, cancel.clone())),
            Arc::clone(&synchronizer),
        ));

        let metrics = Arc::new(MetricsRegistry::new(Arc::clone(&store), cfg.history_window()));
        metrics.register_job(cli.job.clone());
        metrics.register_step(MASTER_STEP);
        if let Some(interval) = cfg.metrics_interval() {
            metrics.start(interval);
        }

        info!(
            component = "batchd",
            event = "startup",
            job = %cli.job,
            workers = workers.len(),
            grid_size,
            "batch daemon wired"
        );

        Self {
            store,
            launcher,
            synchronizer,
            metrics,
            job,
            workers,
            transport,
            cancel,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionRecordStore> {
        &self.store
    }

    pub fn synchronizer(&self) -> &Arc<LaunchSynchronizer> {
        &self.synchronizer
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Launches the job `cli.runs` times, one after the other or all at once.
    #[instrument(skip_all, target = "batchd", fields(job = %cli.job, runs = cli.runs, concurrent = cli.concurrent))]
    pub async fn run(&self, cli: &Cli) -> Vec<BatchResult<JobExecution>> {
        if cli.concurrent {
            let launches = (0..cli.runs).map(|run| {
                self.launcher
                    .launch(Arc::clone(&self.job), cli.job_parameters(run))
            });
            return join_all(launches).await;
        }

        let mut outcomes = Vec::new();
        for run in 0..cli.runs {
            if self.cancel.is_cancelled() {
                break;
            }
            outcomes.push(
                self.launcher
                    .launch(Arc::clone(&self.job), cli.job_parameters(run))
                    .await,
            );
        }
        outcomes
    }

    pub async fn snapshot(&self) -> BatchResult<MetricsSnapshot> {
        self.metrics.snapshot().await
    }

    /// Stops outstanding work and the background tasks.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for worker in &self.workers {
            worker.shutdown();
        }
        self.metrics.stop().await;

        // The channel worker exits once the pool (and with it every client)
        // is dropped.
        drop(self.job);
        if let Some(handle) = self.transport.take() {
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                warn!(component = "batchd", event = "shutdown", "channel worker did not stop in time");
            }
        }
        info!(component = "batchd", event = "shutdown", "batch daemon stopped");
    }
}
