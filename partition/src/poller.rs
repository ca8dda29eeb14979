use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use corelib::{BatchError, BatchResult, JobExecutionId, StepExecution, StepExecutionId};
use store::ExecutionRecordStore;

/// Waits for a step execution to reach a terminal status by re-reading it
/// from the store at a fixed interval.
pub struct StepExecutionPoller {
    store: Arc<dyn ExecutionRecordStore>,
    interval: Duration,
    timeout: Duration,
}

impl StepExecutionPoller {
    pub fn new(store: Arc<dyn ExecutionRecordStore>, interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            interval: interval.max(Duration::from_millis(1)),
            timeout,
        }
    }

    /// At most `timeout / interval` reads (never fewer than one).
    pub fn max_iterations(&self) -> u64 {
        let n = self.timeout.as_nanos() / self.interval.as_nanos();
        u64::try_from(n).unwrap_or(u64::MAX).max(1)
    }

    /// Fails with `Interrupted` when `cancel` fires and with
    /// `AggregationTimeout` when the iterations run out.
    #[instrument(skip(self, cancel), target = "poller")]
    pub async fn wait(
        &self,
        job_execution_id: JobExecutionId,
        step_execution_id: StepExecutionId,
        cancel: &CancellationToken,
    ) -> BatchResult<StepExecution> {
        let max = self.max_iterations();

        for attempt in 0..max {
            let current = self
                .store
                .get_step_execution(job_execution_id, step_execution_id)
                .await?
                .ok_or(BatchError::UnknownPartition {
                    job_execution_id,
                    step_execution_id,
                })?;

            if current.status.is_terminal() {
                debug!(attempt, status = %current.status, "partition reached terminal status");
                return Ok(current);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(BatchError::Interrupted(format!(
                        "stopped waiting for step execution {step_execution_id}"
                    )));
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        Err(BatchError::AggregationTimeout {
            waited: self.timeout,
            pending: 1,
            total: 1,
        })
    }
}
