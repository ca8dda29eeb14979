use async_trait::async_trait;

use corelib::{BatchResult, PartitionRequest, WorkerResponse, WorkerStatus};

use super::WorkerDispatcher;

/// Scales the request threshold by `weight` before delegating, so a worker
/// with weight 2 admits twice the concurrent partitions of a weight-1 one.
pub struct Weighted<D> {
    inner: D,
    weight: f64,
}

impl<D: WorkerDispatcher> Weighted<D> {
    /// Non-positive or non-finite weights fall back to 1.
    pub fn new(inner: D, weight: f64) -> Self {
        let weight = if weight.is_finite() && weight > 0.0 {
            weight
        } else {
            1.0
        };
        Self { inner, weight }
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

#[async_trait]
impl<D: WorkerDispatcher> WorkerDispatcher for Weighted<D> {
    async fn status(&self) -> WorkerStatus {
        self.inner.status().await
    }

    async fn execute(&self, mut request: PartitionRequest) -> BatchResult<WorkerResponse> {
        request.threshold *= self.weight;
        self.inner.execute(request).await
    }
}
