//! Execution record persistence.
//!
//! The store is the single source of truth for job and step execution state.
//! Every update is version-checked: a stale writer gets
//! `BatchError::ConcurrencyConflict` and nothing is overwritten.

use async_trait::async_trait;

use corelib::{
    BatchResult, JobExecution, JobExecutionId, JobInstance, JobParameters, StepExecution,
    StepExecutionId,
};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryExecutionStore;
pub use sqlite::SqliteExecutionStore;

#[async_trait]
pub trait ExecutionRecordStore: Send + Sync {
    /// Creates a STARTING execution for the instance identified by
    /// (`job_name`, identifying `params`), creating the instance if needed.
    ///
    /// Fails with `AlreadyRunning` when the same instance is running and with
    /// `InstanceAlreadyComplete` when it has completed with identifying
    /// parameters.
    async fn create_job_execution(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> BatchResult<JobExecution>;

    /// Persists the job-level fields (children are saved individually).
    async fn update_job_execution(&self, execution: &mut JobExecution) -> BatchResult<()>;

    /// Assigns an id and stores a new step execution.
    async fn add_step_execution(&self, step: &mut StepExecution) -> BatchResult<()>;

    async fn update_step_execution(&self, step: &mut StepExecution) -> BatchResult<()>;

    async fn get_job_execution(&self, id: JobExecutionId) -> BatchResult<Option<JobExecution>>;

    async fn get_last_job_execution(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> BatchResult<Option<JobExecution>>;

    async fn find_running_job_executions(&self, job_name: &str) -> BatchResult<Vec<JobExecution>>;

    async fn get_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_execution_id: StepExecutionId,
    ) -> BatchResult<Option<StepExecution>>;

    /// Newest first.
    async fn get_job_executions(&self, instance: &JobInstance) -> BatchResult<Vec<JobExecution>>;

    /// Newest first, paged.
    async fn find_job_instances(
        &self,
        job_name: &str,
        start: usize,
        count: usize,
    ) -> BatchResult<Vec<JobInstance>>;

    async fn job_names(&self) -> BatchResult<Vec<String>>;

    /// Latest `count` executions of the named step, newest first.
    async fn find_step_executions(
        &self,
        step_name: &str,
        count: usize,
    ) -> BatchResult<Vec<StepExecution>>;
}
