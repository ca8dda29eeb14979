use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, instrument};

use corelib::{BatchResult, ExecutionContext, JobExecution, StepExecution};
use store::ExecutionRecordStore;

pub const PARTITION_INDEX_KEY: &str = "partition.index";
pub const PARTITION_COUNT_KEY: &str = "partition.count";

/// Produces one execution context per partition, keyed by partition name.
pub trait Partitioner: Send + Sync {
    fn partition(&self, grid_size: usize) -> BTreeMap<String, ExecutionContext>;
}

/// `grid_size` partitions carrying only their index and the total count.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimplePartitioner;

impl Partitioner for SimplePartitioner {
    fn partition(&self, grid_size: usize) -> BTreeMap<String, ExecutionContext> {
        // Zero-padded so that names sort in index order.
        let width = grid_size.saturating_sub(1).to_string().len();
        (0..grid_size)
            .map(|i| {
                let mut ctx = ExecutionContext::new();
                ctx.insert(PARTITION_INDEX_KEY.into(), json!(i));
                ctx.insert(PARTITION_COUNT_KEY.into(), json!(grid_size));
                (format!("partition{i:0width$}"), ctx)
            })
            .collect()
    }
}

/// Creates the partition step executions of a master step.
pub struct StepExecutionSplitter {
    store: Arc<dyn ExecutionRecordStore>,
    partitioner: Arc<dyn Partitioner>,
}

impl StepExecutionSplitter {
    pub fn new(store: Arc<dyn ExecutionRecordStore>, partitioner: Arc<dyn Partitioner>) -> Self {
        Self { store, partitioner }
    }

    /// Partitions are named `<master step>:<partition>`, persisted, and
    /// attached to `job`.
    #[instrument(skip_all, target = "splitter", fields(step = %master.step_name, grid_size = grid_size))]
    pub async fn split(
        &self,
        master: &StepExecution,
        job: &mut JobExecution,
        grid_size: usize,
    ) -> BatchResult<Vec<StepExecution>> {
        let mut partitions = Vec::with_capacity(grid_size);

        for (key, ctx) in self.partitioner.partition(grid_size) {
            let mut step = StepExecution::new(format!("{}:{key}", master.step_name), master.job_execution_id);
            step.execution_context = ctx;
            self.store.add_step_execution(&mut step).await?;

            job.attach_step_execution(step.clone());
            partitions.push(step);
        }

        debug!(partitions = partitions.len(), "partitions created");
        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_partitioner_numbers_partitions() {
        let parts = SimplePartitioner.partition(3);

        let names: Vec<_> = parts.keys().cloned().collect();
        assert_eq!(names, vec!["partition0", "partition1", "partition2"]);
        assert_eq!(parts["partition2"][PARTITION_INDEX_KEY], json!(2));
        assert_eq!(parts["partition0"][PARTITION_COUNT_KEY], json!(3));
    }

    #[test]
    fn names_sort_in_index_order_past_ten() {
        let parts = SimplePartitioner.partition(12);
        let first_two: Vec<_> = parts.keys().take(2).cloned().collect();
        assert_eq!(first_two, vec!["partition00", "partition01"]);
        assert_eq!(parts["partition11"][PARTITION_INDEX_KEY], json!(11));
    }

    #[test]
    fn zero_grid_has_no_partitions() {
        assert!(SimplePartitioner.partition(0).is_empty());
    }
}
