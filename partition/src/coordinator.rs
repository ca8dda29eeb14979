use std::sync::Arc;

use tracing::{debug, instrument, warn};

use corelib::{
    BatchError, BatchResult, JobExecution, PartitionRequest, PartitionResult, StepExecution,
};
use store::ExecutionRecordStore;

use crate::aggregator::RequestAggregator;

/// Fans a set of partition step executions out through a
/// [`RequestAggregator`] and folds every result back into the job execution
/// that owns them.
pub struct PartitionCoordinator {
    aggregator: Arc<dyn RequestAggregator>,
    store: Arc<dyn ExecutionRecordStore>,
    /// Name under which workers have the partition step registered. May differ
    /// from the partitions' own names.
    remote_step_name: String,
}

impl PartitionCoordinator {
    pub fn new(
        aggregator: Arc<dyn RequestAggregator>,
        store: Arc<dyn ExecutionRecordStore>,
        remote_step_name: impl Into<String>,
    ) -> Self {
        Self {
            aggregator,
            store,
            remote_step_name: remote_step_name.into(),
        }
    }

    pub fn remote_step_name(&self) -> &str {
        &self.remote_step_name
    }

    pub fn requests_for(&self, partitions: &[StepExecution]) -> Vec<PartitionRequest> {
        partitions
            .iter()
            .map(|p| PartitionRequest::new(&self.remote_step_name, p.job_execution_id, p.id))
            .collect()
    }

    /// Returns the merged partition step executions, in result order.
    #[instrument(skip_all, target = "coordinator", fields(job_execution_id = job.id, partitions = partitions.len()))]
    pub async fn handle(
        &self,
        job: &mut JobExecution,
        partitions: &[StepExecution],
    ) -> BatchResult<Vec<StepExecution>> {
        let requests = self.requests_for(partitions);
        let results = self.aggregator.aggregate(requests).await?;

        let mut merged = Vec::with_capacity(results.len());
        for result in &results {
            merged.push(self.merge_result(job, result).await?);
        }

        let failed = merged
            .iter()
            .filter(|s| !s.failure_exceptions.is_empty())
            .count();
        if failed > 0 {
            warn!(failed, "partitions reported failures");
        }
        Ok(merged)
    }

    /// Re-reads the partition named by `result` and copies its state onto the
    /// matching record attached to `job`. The failure list is replaced by the
    /// one carried in `result`.
    ///
    /// Merging the same result again yields the same record.
    pub async fn merge_result(
        &self,
        job: &mut JobExecution,
        result: &PartitionResult,
    ) -> BatchResult<StepExecution> {
        let request = &result.request;
        let unknown = || BatchError::UnknownPartition {
            job_execution_id: request.job_execution_id,
            step_execution_id: request.step_execution_id,
        };

        let updated = self
            .store
            .get_step_execution(request.job_execution_id, request.step_execution_id)
            .await?
            .ok_or_else(unknown)?;

        let local = job
            .step_execution_mut(updated.id)
            .ok_or_else(unknown)?;

        local.apply_update(&updated);
        local.failure_exceptions = result.failure_exceptions.clone();

        debug!(
            step_execution_id = local.id,
            status = %local.status,
            read = local.read_count,
            "partition merged"
        );
        Ok(local.clone())
    }
}
