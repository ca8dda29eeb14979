use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use corelib::{BatchError, BatchResult, PartitionRequest, PartitionResult};
use store::ExecutionRecordStore;

use crate::admission::AdmissionController;
use crate::dispatcher::WorkerDispatcher;
use crate::poller::StepExecutionPoller;

/// Turns a batch of partition requests into one result per request.
#[async_trait]
pub trait RequestAggregator: Send + Sync {
    /// Results come back in request order. Fails with `AggregationTimeout`
    /// when not every result arrived in time.
    async fn aggregate(&self, requests: Vec<PartitionRequest>) -> BatchResult<Vec<PartitionResult>>;
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Hard wall-clock bound for a whole batch, from submission.
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Pause before re-sending a rejected request.
    pub retry_delay: Duration,
    /// Seeds the admission controller's rejection-frequency estimate.
    pub expected_pool_size: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            retry_delay: Duration::from_millis(50),
            expected_pool_size: 1,
        }
    }
}

/// In-process aggregator: admits every request through a fresh
/// [`AdmissionController`], retries rejections, then polls the store until
/// the partition is terminal.
pub struct DispatchingAggregator {
    dispatcher: Arc<dyn WorkerDispatcher>,
    store: Arc<dyn ExecutionRecordStore>,
    cfg: AggregatorConfig,
    cancel: CancellationToken,
}

impl DispatchingAggregator {
    pub fn new(
        dispatcher: Arc<dyn WorkerDispatcher>,
        store: Arc<dyn ExecutionRecordStore>,
        cfg: AggregatorConfig,
    ) -> Self {
        Self {
            dispatcher,
            store,
            cfg,
            cancel: CancellationToken::new(),
        }
    }

    /// Outstanding waits stop when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

async fn admit_and_wait(
    dispatcher: Arc<dyn WorkerDispatcher>,
    controller: Arc<AdmissionController>,
    poller: Arc<StepExecutionPoller>,
    request: PartitionRequest,
    retry_delay: Duration,
    cancel: CancellationToken,
) -> BatchResult<PartitionResult> {
    let mut rejections = 0u32;
    loop {
        match controller.handle(dispatcher.as_ref(), request.clone()).await {
            Ok(_) => break,
            Err(e) if e.is_retryable() => {
                rejections += 1;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(BatchError::Interrupted(format!(
                            "dispatch of step execution {} cancelled",
                            request.step_execution_id
                        )));
                    }
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
    if rejections > 0 {
        debug!(step_execution_id = request.step_execution_id, rejections, "admitted after retries");
    }

    let finished = poller
        .wait(request.job_execution_id, request.step_execution_id, &cancel)
        .await?;

    Ok(if finished.failure_exceptions.is_empty() {
        PartitionResult::success(request)
    } else {
        PartitionResult::failed(request, finished.failure_exceptions)
    })
}

#[async_trait]
impl RequestAggregator for DispatchingAggregator {
    #[instrument(skip_all, target = "aggregator", fields(partitions = requests.len()))]
    async fn aggregate(&self, requests: Vec<PartitionRequest>) -> BatchResult<Vec<PartitionResult>> {
        let total = requests.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let controller = Arc::new(AdmissionController::with_initial_rejection_frequency(
            self.cfg.expected_pool_size as f64,
        ));
        let poller = Arc::new(StepExecutionPoller::new(
            Arc::clone(&self.store),
            self.cfg.poll_interval,
            self.cfg.timeout,
        ));
        let scope = self.cancel.child_token();
        let started = Instant::now();
        let deadline = started + self.cfg.timeout;

        let mut tasks = JoinSet::new();
        for (index, request) in requests.into_iter().enumerate() {
            let fut = admit_and_wait(
                Arc::clone(&self.dispatcher),
                Arc::clone(&controller),
                Arc::clone(&poller),
                request,
                self.cfg.retry_delay,
                scope.clone(),
            );
            tasks.spawn(async move { (index, fut.await) });
        }

        let mut results: Vec<Option<PartitionResult>> = vec![None; total];
        let mut done = 0;

        while done < total {
            let failure = match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((index, Ok(result))))) => {
                    results[index] = Some(result);
                    done += 1;
                    continue;
                }
                Ok(None) => break,
                Ok(Some(Ok((_, Err(e))))) if !e.is_timeout() => e,
                // A poller running out of iterations is the batch running out of time.
                Ok(Some(Ok((_, Err(_))))) | Err(_) => BatchError::AggregationTimeout {
                    waited: started.elapsed(),
                    pending: total - done,
                    total,
                },
                Ok(Some(Err(join_err))) => {
                    BatchError::Transport(format!("partition task failed: {join_err}"))
                }
            };

            scope.cancel();
            tasks.abort_all();
            warn!(
                component = "aggregator",
                event = "abort",
                error = %failure,
                pending = total - done,
                "partition batch aborted; running partitions are left to finish"
            );
            return Err(failure);
        }

        let snap = controller.snapshot();
        info!(
            component = "aggregator",
            event = "complete",
            partitions = total,
            threshold = snap.threshold,
            rejections = snap.rejected_total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "partition batch complete"
        );

        Ok(results.into_iter().flatten().collect())
    }
}
