use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, instrument};

use corelib::{BatchError, BatchResult, BatchStatus, ExitStatus};
use engine::{Step, StepContext};

use crate::coordinator::PartitionCoordinator;
use crate::splitter::StepExecutionSplitter;

/// Master side of a partitioned step: split, coordinate, aggregate.
///
/// The master execution ends with the summed partition counters and the most
/// severe partition status. A coordination failure other than interruption
/// (timeout, broken partition mapping) fails the master.
pub struct PartitionStep {
    name: String,
    splitter: StepExecutionSplitter,
    coordinator: PartitionCoordinator,
    grid_size: usize,
}

impl PartitionStep {
    pub fn new(
        name: impl Into<String>,
        splitter: StepExecutionSplitter,
        coordinator: PartitionCoordinator,
        grid_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            splitter,
            coordinator,
            grid_size,
        }
    }
}

#[async_trait]
impl Step for PartitionStep {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        skip(self, ctx),
        target = "step",
        fields(step = %self.name, step_execution_id = ctx.step_execution.id, grid_size = self.grid_size)
    )]
    async fn execute(&self, ctx: &mut StepContext) -> BatchResult<()> {
        ctx.step_execution.status = ctx.step_execution.status.upgrade_to(BatchStatus::Started);
        ctx.save().await?;

        let job_execution_id = ctx.step_execution.job_execution_id;
        let mut job = ctx
            .store()
            .get_job_execution(job_execution_id)
            .await?
            .ok_or_else(|| BatchError::Storage(format!("job execution {job_execution_id} not found")))?;

        let partitions = self
            .splitter
            .split(&ctx.step_execution, &mut job, self.grid_size)
            .await?;

        let outcome = self.coordinator.handle(&mut job, &partitions).await;

        match outcome {
            Ok(merged) => {
                let master = &mut ctx.step_execution;
                master.aggregate(&merged);
                if merged.is_empty() {
                    master.status = master.status.upgrade_to(BatchStatus::Completed);
                    master.exit_status = master.exit_status.clone().and(ExitStatus::completed());
                }
                master.end_time = Some(Utc::now());
                info!(
                    status = %master.status,
                    read = master.read_count,
                    write = master.write_count,
                    "partitioned step finished"
                );
                ctx.save().await
            }
            Err(BatchError::Interrupted(reason)) => {
                let master = &mut ctx.step_execution;
                master.status = master.status.upgrade_to(BatchStatus::Stopped);
                master.exit_status = master.exit_status.clone().and(ExitStatus::stopped());
                master.end_time = Some(Utc::now());
                ctx.save().await?;
                Err(BatchError::Interrupted(reason))
            }
            Err(e) => {
                error!(error = %e, "partition coordination failed");
                ctx.step_execution.fail(e.to_string());
                ctx.save().await
            }
        }
    }
}
