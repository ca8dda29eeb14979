use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use corelib::{BatchError, BatchResult, PartitionRequest, WorkerResponse, WorkerStatus};

use super::WorkerDispatcher;

/// Delegates each call to the next worker in strict cyclic order, whatever
/// the outcome of the previous call.
pub struct RoundRobinPool {
    workers: Vec<Arc<dyn WorkerDispatcher>>,
    cursor: Mutex<usize>,
}

impl RoundRobinPool {
    pub fn new(workers: Vec<Arc<dyn WorkerDispatcher>>) -> Self {
        Self {
            workers,
            cursor: Mutex::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn next_worker(&self) -> Option<Arc<dyn WorkerDispatcher>> {
        if self.workers.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock();
        let worker = Arc::clone(&self.workers[*cursor % self.workers.len()]);
        *cursor = cursor.wrapping_add(1);
        Some(worker)
    }
}

#[async_trait]
impl WorkerDispatcher for RoundRobinPool {
    /// Sum of the available workers' scores.
    async fn status(&self) -> WorkerStatus {
        let mut score = 0.0;
        let mut available = false;
        let mut authoritative = true;

        for worker in &self.workers {
            let s = worker.status().await;
            if s.available {
                score += s.score;
                available = true;
            }
            authoritative &= s.authoritative;
        }

        WorkerStatus {
            score,
            available,
            authoritative: authoritative && available,
        }
    }

    async fn execute(&self, request: PartitionRequest) -> BatchResult<WorkerResponse> {
        let worker = self
            .next_worker()
            .ok_or_else(|| BatchError::Transport("worker pool is empty".into()))?;
        worker.execute(request).await
    }
}
