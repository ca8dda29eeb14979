use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, instrument, warn};

use common::logger::child_span;
use corelib::{
    BatchError, BatchResult, JobExecutionId, PartitionRequest, StepExecutionId, WorkerResponse,
    WorkerStatus,
};
use engine::{StepContext, StepRegistry};
use store::ExecutionRecordStore;

#[derive(Debug, Clone)]
pub struct LocalDispatcherConfig {
    /// Multiplier applied to the request threshold.
    pub weight: f64,

    /// Pause after accepting before capacity is measured. Lets very short
    /// partitions finish first so the reported capacity is not overstated.
    /// A heuristic, not a correctness property.
    pub settle_delay: Duration,
}

impl Default for LocalDispatcherConfig {
    fn default() -> Self {
        Self {
            weight: 1.0,
            settle_delay: Duration::from_millis(100),
        }
    }
}

/// Removes a partition from the running set when its task ends, including by
/// panic or abort.
struct RunningGuard {
    running: Arc<Mutex<HashSet<StepExecutionId>>>,
    id: StepExecutionId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.id);
    }
}

/// Runs partitions in-process on background tasks.
///
/// Load is the number of partitions currently running here; a request is
/// rejected when `load + 1 > threshold * weight`.
pub struct LocalDispatcher {
    name: String,
    registry: Arc<StepRegistry>,
    store: Arc<dyn ExecutionRecordStore>,
    cfg: LocalDispatcherConfig,
    running: Arc<Mutex<HashSet<StepExecutionId>>>,
    cancel: CancellationToken,
}

impl LocalDispatcher {
    pub fn new(
        name: impl Into<String>,
        registry: Arc<StepRegistry>,
        store: Arc<dyn ExecutionRecordStore>,
        cfg: LocalDispatcherConfig,
    ) -> Self {
        Self {
            name: name.into(),
            registry,
            store,
            cfg,
            running: Arc::new(Mutex::new(HashSet::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn load(&self) -> usize {
        self.running.lock().len()
    }

    /// Signals running partitions to stop. They end STOPPED.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn limit(&self, threshold: f64) -> f64 {
        threshold * self.cfg.weight
    }

    fn spare(&self, threshold: f64) -> f64 {
        self.limit(threshold) - self.load() as f64
    }
}

/// Best effort: leaves the partition FAILED when its step could not finish
/// normally.
async fn mark_failed(
    store: &Arc<dyn ExecutionRecordStore>,
    job_execution_id: JobExecutionId,
    step_execution_id: StepExecutionId,
    failure: String,
) {
    let current = match store
        .get_step_execution(job_execution_id, step_execution_id)
        .await
    {
        Ok(Some(s)) => s,
        Ok(None) => return,
        Err(e) => {
            error!(error = %e, step_execution_id, "could not reload partition to mark it failed");
            return;
        }
    };
    if current.status.is_terminal() {
        return;
    }

    let mut failed = current;
    failed.fail(failure);
    if let Err(e) = store.update_step_execution(&mut failed).await {
        error!(error = %e, step_execution_id, "could not mark partition failed");
    }
}

#[async_trait]
impl super::WorkerDispatcher for LocalDispatcher {
    async fn status(&self) -> WorkerStatus {
        WorkerStatus::measured(self.load() as f64)
    }

    #[instrument(
        skip(self, request),
        target = "dispatcher",
        fields(worker = %self.name, step_execution_id = request.step_execution_id)
    )]
    async fn execute(&self, request: PartitionRequest) -> BatchResult<WorkerResponse> {
        let step = self.registry.get(&request.step_name)?;

        let step_execution = self
            .store
            .get_step_execution(request.job_execution_id, request.step_execution_id)
            .await?
            .ok_or(BatchError::UnknownPartition {
                job_execution_id: request.job_execution_id,
                step_execution_id: request.step_execution_id,
            })?;

        if step_execution.status.is_terminal() {
            debug!(
                component = "dispatcher",
                event = "already_finished",
                status = %step_execution.status,
                "partition already finished; not running it again"
            );
            return Ok(WorkerResponse::accepted(self.spare(request.threshold)));
        }

        let limit = self.limit(request.threshold);
        let guard = {
            let mut running = self.running.lock();
            let load = running.len() as f64;

            if running.contains(&step_execution.id) {
                debug!(component = "dispatcher", event = "duplicate", "partition already running here");
                return Ok(WorkerResponse::accepted(limit - load));
            }
            if load + 1.0 > limit {
                debug!(component = "dispatcher", event = "reject", load, limit, "worker at capacity");
                return Ok(WorkerResponse::rejected(limit - load));
            }

            running.insert(step_execution.id);
            RunningGuard {
                running: Arc::clone(&self.running),
                id: step_execution.id,
            }
        };

        let store = Arc::clone(&self.store);
        let cancel = self.cancel.child_token();
        let worker = self.name.clone();
        let job_execution_id = request.job_execution_id;
        let step_execution_id = request.step_execution_id;

        tokio::spawn(
            async move {
                let _guard = guard;
                let mut ctx = StepContext::new(step_execution, Arc::clone(&store), cancel);

                match step.execute(&mut ctx).await {
                    Ok(()) => debug!(status = %ctx.step_execution.status, "partition finished"),
                    Err(BatchError::Interrupted(reason)) => {
                        warn!(worker = %worker, reason = %reason, "partition interrupted")
                    }
                    Err(e) => {
                        error!(worker = %worker, error = %e, "partition step failed to complete");
                        mark_failed(&store, job_execution_id, step_execution_id, e.to_string()).await;
                    }
                }
            }
            .instrument(child_span("partition")),
        );

        if !self.cfg.settle_delay.is_zero() {
            tokio::time::sleep(self.cfg.settle_delay).await;
        }

        Ok(WorkerResponse::accepted(self.spare(request.threshold)))
    }
}
