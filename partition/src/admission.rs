//! Client-side admission control.
//!
//! The controller stamps every request with its current threshold and learns
//! from the worker's answer. Rejections push the score up by the capacity the
//! worker was missing; acceptances drain it by the capacity left over. After
//! at least two rejections the average score per rejection is added to the
//! threshold, so under round-robin dispatch the threshold settles at the
//! number of workers that can run in parallel.
//!
//! State is per coordination scope: create one controller per partition batch,
//! otherwise the score keeps growing across unrelated batches.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use corelib::{BatchError, BatchResult, PartitionRequest, WorkerResponse};

use crate::dispatcher::WorkerDispatcher;

/// Point-in-time copy of the controller state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdmissionSnapshot {
    pub threshold: f64,
    pub score: f64,
    pub rejection_frequency_estimate: f64,
    pub accepted_total: u64,
    pub rejected_total: u64,
    pub rejected_since_adjustment: u64,
    pub successes_since_rejection: u64,
}

#[derive(Debug)]
struct AdmissionState {
    threshold: f64,
    score: f64,
    rejection_frequency_estimate: f64,
    accepted_total: u64,
    rejected_total: u64,
    rejected_since_adjustment: u64,
    successes_since_rejection: u64,
}

impl AdmissionState {
    fn new(initial_rejection_frequency: f64) -> Self {
        Self {
            threshold: 1.0,
            score: 0.0,
            rejection_frequency_estimate: initial_rejection_frequency.max(1.0),
            accepted_total: 0,
            rejected_total: 0,
            rejected_since_adjustment: 0,
            successes_since_rejection: 0,
        }
    }

    fn snapshot(&self) -> AdmissionSnapshot {
        AdmissionSnapshot {
            threshold: self.threshold,
            score: self.score,
            rejection_frequency_estimate: self.rejection_frequency_estimate,
            accepted_total: self.accepted_total,
            rejected_total: self.rejected_total,
            rejected_since_adjustment: self.rejected_since_adjustment,
            successes_since_rejection: self.successes_since_rejection,
        }
    }

    fn record_rejection(&mut self, capacity: f64) {
        self.score = (self.score + (1.0 - capacity)).max(0.0);

        let total = self.rejected_total as f64;
        self.rejection_frequency_estimate = ((self.rejection_frequency_estimate * total
            + self.successes_since_rejection as f64)
            / (total + 1.0))
            .max(1.0);

        self.rejected_since_adjustment += 1;
        self.rejected_total += 1;
        self.successes_since_rejection = 0;

        if self.rejected_since_adjustment >= 2 {
            let delta = (self.score / self.rejected_since_adjustment as f64).round();
            if delta >= 1.0 {
                self.score = 0.0;
                self.threshold += delta;
                info!(
                    component = "admission",
                    event = "threshold_raised",
                    threshold = self.threshold,
                    delta,
                    "admission threshold raised"
                );
            }
            self.rejected_since_adjustment = 0;
        }
    }

    fn record_acceptance(&mut self, capacity: f64) {
        self.score = (self.score - capacity).max(0.0);
        self.successes_since_rejection += 1;
        self.accepted_total += 1;
    }
}

pub struct AdmissionController {
    state: Mutex<AdmissionState>,
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::with_initial_rejection_frequency(1.0)
    }

    /// `estimate` is ideally the expected pool size. Values below 1 are
    /// raised to 1.
    pub fn with_initial_rejection_frequency(estimate: f64) -> Self {
        Self {
            state: Mutex::new(AdmissionState::new(estimate)),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.state.lock().threshold
    }

    pub fn score(&self) -> f64 {
        self.state.lock().score
    }

    pub fn rejection_frequency_estimate(&self) -> f64 {
        self.state.lock().rejection_frequency_estimate
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        self.state.lock().snapshot()
    }

    /// Sends one request through `dispatcher`.
    ///
    /// A rejection is returned as `BatchError::AdmissionRejected` after the
    /// state has been updated; the caller decides whether and when to retry.
    /// Dispatch errors propagate untouched and do not affect the state.
    pub async fn handle(
        &self,
        dispatcher: &dyn WorkerDispatcher,
        mut request: PartitionRequest,
    ) -> BatchResult<WorkerResponse> {
        let threshold = self.threshold();
        request.threshold = threshold;

        let step_name = request.step_name.clone();
        let step_execution_id = request.step_execution_id;

        let response = dispatcher.execute(request).await?;

        let mut state = self.state.lock();
        if response.rejected {
            state.record_rejection(response.capacity);
            debug!(
                component = "admission",
                event = "rejected",
                step_execution_id,
                threshold,
                capacity = response.capacity,
                score = state.score,
                "partition request rejected"
            );
            return Err(BatchError::AdmissionRejected {
                step_name,
                step_execution_id,
                threshold,
            });
        }

        state.record_acceptance(response.capacity);
        debug!(
            component = "admission",
            event = "accepted",
            step_execution_id,
            threshold,
            capacity = response.capacity,
            "partition request accepted"
        );
        Ok(response)
    }
}
