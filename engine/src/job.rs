use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use corelib::{BatchError, BatchResult, BatchStatus, ExitStatus, JobExecution, StepExecution};
use store::ExecutionRecordStore;

use crate::step::{Step, StepContext};

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the job against an execution already created in `store`, leaving
    /// it ended and persisted.
    async fn execute(
        &self,
        execution: &mut JobExecution,
        store: &Arc<dyn ExecutionRecordStore>,
        cancel: &CancellationToken,
    ) -> BatchResult<()>;
}

/// Runs its steps in order and stops at the first one that does not
/// complete.
pub struct SimpleJob {
    name: String,
    steps: Vec<Arc<dyn Step>>,
}

impl SimpleJob {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl Job for SimpleJob {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, target = "job", fields(job = %self.name, job_execution_id = execution.id))]
    async fn execute(
        &self,
        execution: &mut JobExecution,
        store: &Arc<dyn ExecutionRecordStore>,
        cancel: &CancellationToken,
    ) -> BatchResult<()> {
        execution.start_time = Some(Utc::now());
        execution.status = BatchStatus::Started;
        store.update_job_execution(execution).await?;

        let mut interrupted = None;
        let mut last: Option<StepExecution> = None;

        for step in &self.steps {
            let mut step_execution = StepExecution::new(step.name(), execution.id);
            store.add_step_execution(&mut step_execution).await?;

            let mut ctx = StepContext::new(step_execution, Arc::clone(store), cancel.clone());
            let outcome = step.execute(&mut ctx).await;
            let finished = ctx.into_step_execution();
            execution.attach_step_execution(finished.clone());

            let completed = finished.status == BatchStatus::Completed;
            last = Some(finished);

            if let Err(e) = outcome {
                warn!(step = step.name(), error = %e, "step aborted");
                interrupted = Some(e);
                break;
            }
            if !completed {
                break;
            }
        }

        match &last {
            Some(step) => {
                execution.upgrade_status(step.status);
                execution.exit_status = execution.exit_status.clone().and(step.exit_status.clone());
            }
            None => {
                execution.upgrade_status(BatchStatus::Completed);
                execution.exit_status = execution.exit_status.clone().and(ExitStatus::completed());
            }
        }
        match &interrupted {
            Some(BatchError::Interrupted(_)) => {
                execution.upgrade_status(BatchStatus::Stopped);
                execution.exit_status = execution.exit_status.clone().and(ExitStatus::stopped());
            }
            Some(e) => {
                execution.upgrade_status(BatchStatus::Failed);
                execution.exit_status = execution
                    .exit_status
                    .clone()
                    .and(ExitStatus::failed().with_description(e.to_string()));
            }
            None => {}
        }
        execution.end_time = Some(Utc::now());
        store.update_job_execution(execution).await?;

        info!(status = %execution.status, exit_code = %execution.exit_status.exit_code, "job finished");

        match interrupted {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
