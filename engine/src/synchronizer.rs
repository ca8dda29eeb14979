//! Single-flight launches per job name.
//!
//! Two checkpoints: before launch (no record is created when the job is
//! already running) and after the store created the execution. The second one
//! catches launches that raced past the first; every running execution other
//! than the oldest abandons itself, so exactly one survives.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use corelib::{
    BatchError, BatchResult, BatchStatus, ExitStatus, JobExecution, JobExecutionId, JobInstance,
    JobParameters, StepExecution, StepExecutionId,
};
use store::ExecutionRecordStore;

use crate::job::Job;
use crate::launcher::JobLauncher;

pub const DUPLICATE_LAUNCH_DESCRIPTION: &str =
    "duplicate launch: another execution of this job was already running";

pub struct LaunchSynchronizer {
    store: Arc<dyn ExecutionRecordStore>,
    tracked: RwLock<BTreeSet<String>>,
}

impl LaunchSynchronizer {
    pub fn new(store: Arc<dyn ExecutionRecordStore>) -> Self {
        Self {
            store,
            tracked: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn with_jobs<I, S>(store: Arc<dyn ExecutionRecordStore>, jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sync = Self::new(store);
        for job in jobs {
            sync.track(job);
        }
        sync
    }

    pub fn track(&self, job_name: impl Into<String>) -> bool {
        let name = job_name.into();
        info!(job_name = %name, "tracking job for single-flight launches");
        self.tracked.write().insert(name)
    }

    pub fn untrack(&self, job_name: &str) -> bool {
        self.tracked.write().remove(job_name)
    }

    pub fn tracked(&self) -> Vec<String> {
        self.tracked.read().iter().cloned().collect()
    }

    pub fn is_tracked(&self, job_name: &str) -> bool {
        self.tracked.read().contains(job_name)
    }

    /// Fails with `AlreadyRunning` if any execution of a tracked job is
    /// running. Nothing is written.
    #[instrument(skip(self), target = "synchronizer")]
    pub async fn check_before_launch(&self, job_name: &str) -> BatchResult<()> {
        if !self.is_tracked(job_name) {
            return Ok(());
        }

        let running = self.store.find_running_job_executions(job_name).await?;
        if let Some(existing) = running.iter().min_by_key(|e| e.creation_order()) {
            warn!(
                job_name,
                running_execution_id = existing.id,
                "launch refused: job already running"
            );
            return Err(BatchError::AlreadyRunning {
                job_name: job_name.to_string(),
                execution_id: Some(existing.id),
            });
        }
        Ok(())
    }

    /// Re-checks once `execution` exists in the store. If another running
    /// execution was created before `execution`, it is ended as ABANDONED
    /// with a NOOP exit status and persisted, and the launch fails with
    /// `AlreadyRunning` naming the oldest one.
    #[instrument(skip_all, target = "synchronizer", fields(job_name = %execution.job_name, job_execution_id = execution.id))]
    pub async fn check_after_create(&self, execution: &mut JobExecution) -> BatchResult<()> {
        if !self.is_tracked(&execution.job_name) {
            return Ok(());
        }

        let running = self
            .store
            .find_running_job_executions(&execution.job_name)
            .await?;
        if running.len() <= 1 {
            return Ok(());
        }

        let oldest = running
            .iter()
            .min_by_key(|e| e.creation_order())
            .map(|e| e.id);
        if oldest == Some(execution.id) {
            warn!(
                running = running.len(),
                "concurrent launch detected; newer executions will back off"
            );
            return Ok(());
        }

        execution.end_time = Some(Utc::now());
        execution.upgrade_status(BatchStatus::Abandoned);
        execution.exit_status = execution
            .exit_status
            .clone()
            .and(ExitStatus::noop().with_description(DUPLICATE_LAUNCH_DESCRIPTION));
        self.store.update_job_execution(execution).await?;

        warn!(
            survivor_execution_id = ?oldest,
            "duplicate launch abandoned"
        );

        Err(BatchError::AlreadyRunning {
            job_name: execution.job_name.clone(),
            execution_id: oldest,
        })
    }
}

/// Store decorator that runs the post-create check on every new execution.
pub struct SynchronizedStore {
    inner: Arc<dyn ExecutionRecordStore>,
    synchronizer: Arc<LaunchSynchronizer>,
}

impl SynchronizedStore {
    pub fn new(inner: Arc<dyn ExecutionRecordStore>, synchronizer: Arc<LaunchSynchronizer>) -> Self {
        Self {
            inner,
            synchronizer,
        }
    }
}

#[async_trait]
impl ExecutionRecordStore for SynchronizedStore {
    async fn create_job_execution(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> BatchResult<JobExecution> {
        let mut execution = self.inner.create_job_execution(job_name, params).await?;
        self.synchronizer.check_after_create(&mut execution).await?;
        Ok(execution)
    }

    async fn update_job_execution(&self, execution: &mut JobExecution) -> BatchResult<()> {
        self.inner.update_job_execution(execution).await
    }

    async fn add_step_execution(&self, step: &mut StepExecution) -> BatchResult<()> {
        self.inner.add_step_execution(step).await
    }

    async fn update_step_execution(&self, step: &mut StepExecution) -> BatchResult<()> {
        self.inner.update_step_execution(step).await
    }

    async fn get_job_execution(&self, id: JobExecutionId) -> BatchResult<Option<JobExecution>> {
        self.inner.get_job_execution(id).await
    }

    async fn get_last_job_execution(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> BatchResult<Option<JobExecution>> {
        self.inner.get_last_job_execution(job_name, params).await
    }

    async fn find_running_job_executions(&self, job_name: &str) -> BatchResult<Vec<JobExecution>> {
        self.inner.find_running_job_executions(job_name).await
    }

    async fn get_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_execution_id: StepExecutionId,
    ) -> BatchResult<Option<StepExecution>> {
        self.inner
            .get_step_execution(job_execution_id, step_execution_id)
            .await
    }

    async fn get_job_executions(&self, instance: &JobInstance) -> BatchResult<Vec<JobExecution>> {
        self.inner.get_job_executions(instance).await
    }

    async fn find_job_instances(
        &self,
        job_name: &str,
        start: usize,
        count: usize,
    ) -> BatchResult<Vec<JobInstance>> {
        self.inner.find_job_instances(job_name, start, count).await
    }

    async fn job_names(&self) -> BatchResult<Vec<String>> {
        self.inner.job_names().await
    }

    async fn find_step_executions(
        &self,
        step_name: &str,
        count: usize,
    ) -> BatchResult<Vec<StepExecution>> {
        self.inner.find_step_executions(step_name, count).await
    }
}

/// Launcher decorator that refuses launches of running tracked jobs.
pub struct SynchronizedLauncher {
    inner: Arc<dyn JobLauncher>,
    synchronizer: Arc<LaunchSynchronizer>,
}

impl SynchronizedLauncher {
    pub fn new(inner: Arc<dyn JobLauncher>, synchronizer: Arc<LaunchSynchronizer>) -> Self {
        Self {
            inner,
            synchronizer,
        }
    }
}

#[async_trait]
impl JobLauncher for SynchronizedLauncher {
    async fn launch(&self, job: Arc<dyn Job>, params: JobParameters) -> BatchResult<JobExecution> {
        self.synchronizer.check_before_launch(job.name()).await?;
        debug!(job_name = job.name(), "pre-launch check passed");
        self.inner.launch(job, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::MemoryExecutionStore;
    use tracing_test::traced_test;

    fn params(run: i64) -> JobParameters {
        JobParameters::new().with_long("run.id", run)
    }

    #[tokio::test]
    #[traced_test]
    async fn latest_of_two_running_executions_is_abandoned() {
        let store = Arc::new(MemoryExecutionStore::new());
        let sync = LaunchSynchronizer::with_jobs(store.clone(), ["nightly-etl"]);

        let first = store.create_job_execution("nightly-etl", &params(1)).await.unwrap();
        let mut second = store.create_job_execution("nightly-etl", &params(2)).await.unwrap();

        let err = sync.check_after_create(&mut second).await.unwrap_err();
        assert!(matches!(
            err,
            BatchError::AlreadyRunning { execution_id: Some(id), .. } if id == first.id
        ));

        let stored = store.get_job_execution(second.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Abandoned);
        assert_eq!(stored.exit_status.exit_code, ExitStatus::NOOP);
        assert!(stored.exit_status.exit_description.contains("duplicate launch"));
        assert!(stored.end_time.is_some());

        assert!(logs_contain("duplicate launch abandoned"));
    }

    #[tokio::test]
    async fn older_execution_proceeds_when_racing() {
        let store = Arc::new(MemoryExecutionStore::new());
        let sync = LaunchSynchronizer::with_jobs(store.clone(), ["nightly-etl"]);

        let mut first = store.create_job_execution("nightly-etl", &params(1)).await.unwrap();
        store.create_job_execution("nightly-etl", &params(2)).await.unwrap();

        sync.check_after_create(&mut first).await.unwrap();
        assert_eq!(first.status, BatchStatus::Starting);
    }

    #[tokio::test]
    async fn only_the_oldest_of_three_running_executions_proceeds() {
        let store = Arc::new(MemoryExecutionStore::new());
        let sync = LaunchSynchronizer::with_jobs(store.clone(), ["nightly-etl"]);

        let mut first = store.create_job_execution("nightly-etl", &params(1)).await.unwrap();
        let mut middle = store.create_job_execution("nightly-etl", &params(2)).await.unwrap();
        let mut last = store.create_job_execution("nightly-etl", &params(3)).await.unwrap();

        // Checked out of creation order; the outcome must not depend on it.
        let last_err = sync.check_after_create(&mut last).await.unwrap_err();
        let middle_err = sync.check_after_create(&mut middle).await.unwrap_err();
        sync.check_after_create(&mut first).await.unwrap();

        for err in [last_err, middle_err] {
            assert!(matches!(
                err,
                BatchError::AlreadyRunning { execution_id: Some(id), .. } if id == first.id
            ));
        }

        assert_eq!(first.status, BatchStatus::Starting);
        for id in [middle.id, last.id] {
            let stored = store.get_job_execution(id).await.unwrap().unwrap();
            assert_eq!(stored.status, BatchStatus::Abandoned);
            assert_eq!(stored.exit_status.exit_code, ExitStatus::NOOP);
        }

        let running = store.find_running_job_executions("nightly-etl").await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, first.id);
    }

    #[tokio::test]
    async fn untracked_jobs_are_not_checked() {
        let store = Arc::new(MemoryExecutionStore::new());
        let sync = LaunchSynchronizer::new(store.clone());

        store.create_job_execution("adhoc", &params(1)).await.unwrap();
        let mut second = store.create_job_execution("adhoc", &params(2)).await.unwrap();

        sync.check_before_launch("adhoc").await.unwrap();
        sync.check_after_create(&mut second).await.unwrap();

        assert!(sync.track("adhoc"));
        assert!(sync.check_before_launch("adhoc").await.is_err());
        assert!(sync.untrack("adhoc"));
        assert!(sync.tracked().is_empty());
    }
}
