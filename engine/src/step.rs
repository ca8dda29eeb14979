use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use corelib::{BatchError, BatchResult, BatchStatus, ExitStatus, StepExecution};
use store::ExecutionRecordStore;

/// Everything a running step needs, passed explicitly.
pub struct StepContext {
    pub step_execution: StepExecution,
    store: Arc<dyn ExecutionRecordStore>,
    cancel: CancellationToken,
}

impl StepContext {
    pub fn new(
        step_execution: StepExecution,
        store: Arc<dyn ExecutionRecordStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            step_execution,
            store,
            cancel,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionRecordStore> {
        &self.store
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Persists the current state of the step execution.
    pub async fn save(&mut self) -> BatchResult<()> {
        self.store.update_step_execution(&mut self.step_execution).await
    }

    pub fn into_step_execution(self) -> StepExecution {
        self.step_execution
    }
}

/// A unit of work run against one step execution record.
///
/// `execute` drives the record to a terminal status and returns `Err` only
/// when interrupted or when the record cannot be persisted.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &mut StepContext) -> BatchResult<()>;
}

/// Business logic of a tasklet step. Errors become failure exceptions on the
/// step record.
#[async_trait]
pub trait Tasklet: Send + Sync {
    async fn execute(&self, step: &mut StepExecution) -> anyhow::Result<()>;
}

pub struct TaskletStep {
    name: String,
    tasklet: Arc<dyn Tasklet>,
}

impl TaskletStep {
    pub fn new(name: impl Into<String>, tasklet: Arc<dyn Tasklet>) -> Self {
        Self {
            name: name.into(),
            tasklet,
        }
    }
}

/// Takes over what a tasklet is allowed to change on its working copy.
fn absorb(target: &mut StepExecution, worked: StepExecution) {
    target.read_count = worked.read_count;
    target.write_count = worked.write_count;
    target.commit_count = worked.commit_count;
    target.rollback_count = worked.rollback_count;
    target.filter_count = worked.filter_count;
    target.read_skip_count = worked.read_skip_count;
    target.write_skip_count = worked.write_skip_count;
    target.process_skip_count = worked.process_skip_count;
    target.execution_context = worked.execution_context;
    target.terminate_only = worked.terminate_only;
    target.failure_exceptions = worked.failure_exceptions;
    target.exit_status = worked.exit_status;
}

#[async_trait]
impl Step for TaskletStep {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        skip(self, ctx),
        target = "step",
        fields(step = %self.name, step_execution_id = ctx.step_execution.id)
    )]
    async fn execute(&self, ctx: &mut StepContext) -> BatchResult<()> {
        if ctx.step_execution.status.is_terminal() {
            debug!(status = %ctx.step_execution.status, "step record already finished; skipping");
            return Ok(());
        }
        ctx.step_execution.status = ctx.step_execution.status.upgrade_to(BatchStatus::Started);
        ctx.save().await?;

        // The tasklet runs on its own task so a panic is contained and the
        // record can still be marked FAILED.
        let tasklet = Arc::clone(&self.tasklet);
        let mut working = ctx.step_execution.clone();
        let mut handle = tokio::spawn(async move {
            let outcome = tasklet.execute(&mut working).await;
            (working, outcome)
        });

        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = ctx.cancellation().cancelled() => {
                handle.abort();
                let exec = &mut ctx.step_execution;
                exec.status = exec.status.upgrade_to(BatchStatus::Stopped);
                exec.exit_status = exec.exit_status.clone().and(ExitStatus::stopped());
                exec.end_time = Some(Utc::now());
                ctx.save().await?;
                warn!(step = %self.name, "step interrupted");
                return Err(BatchError::Interrupted(format!("step '{}' was cancelled", self.name)));
            }
        };

        match joined {
            Ok((worked, Ok(()))) => {
                absorb(&mut ctx.step_execution, worked);
                let exec = &mut ctx.step_execution;
                exec.status = exec.status.upgrade_to(BatchStatus::Completed);
                exec.exit_status = exec.exit_status.clone().and(ExitStatus::completed());
                exec.end_time = Some(Utc::now());
                debug!(read = exec.read_count, write = exec.write_count, "step completed");
            }
            Ok((worked, Err(e))) => {
                absorb(&mut ctx.step_execution, worked);
                warn!(error = %format!("{e:#}"), "step failed");
                ctx.step_execution.fail(format!("{e:#}"));
            }
            Err(join_err) => {
                warn!(error = %join_err, "tasklet panicked");
                ctx.step_execution
                    .fail(format!("tasklet panicked: {join_err}"));
            }
        }

        ctx.save().await
    }
}

/// Steps addressable by name, e.g. by workers receiving partition requests.
#[derive(Default)]
pub struct StepRegistry {
    steps: RwLock<HashMap<String, Arc<dyn Step>>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, step: Arc<dyn Step>) {
        self.steps.write().insert(step.name().to_string(), step);
    }

    pub fn get(&self, name: &str) -> BatchResult<Arc<dyn Step>> {
        self.steps
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BatchError::UnknownStep(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.steps.read().keys().cloned().collect();
        names.sort();
        names
    }
}
