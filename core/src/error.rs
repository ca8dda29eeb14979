use std::time::Duration;

use thiserror::Error;

use crate::models::{JobExecutionId, StepExecutionId};

pub type BatchResult<T> = Result<T, BatchError>;

#[derive(Error, Debug)]
pub enum BatchError {
    /// Transient: the worker was at capacity. Callers are expected to retry.
    #[error("admission rejected for step '{step_name}' (execution {step_execution_id}, threshold {threshold})")]
    AdmissionRejected {
        step_name: String,
        step_execution_id: StepExecutionId,
        threshold: f64,
    },

    #[error("no step execution {step_execution_id} under job execution {job_execution_id}")]
    UnknownPartition {
        job_execution_id: JobExecutionId,
        step_execution_id: StepExecutionId,
    },

    #[error("no step registered under name '{0}'")]
    UnknownStep(String),

    #[error("job '{job_name}' is already running{}", .execution_id.map(|id| format!(" (execution {id})")).unwrap_or_default())]
    AlreadyRunning {
        job_name: String,
        execution_id: Option<JobExecutionId>,
    },

    #[error("job instance '{job_name}' [{parameters}] already completed")]
    InstanceAlreadyComplete {
        job_name: String,
        parameters: String,
    },

    #[error("timed out after {waited:?} with {pending} of {total} partition results outstanding")]
    AggregationTimeout {
        waited: Duration,
        pending: usize,
        total: usize,
    },

    #[error("version conflict on {entity} {id}: expected {expected}, found {actual}")]
    ConcurrencyConflict {
        entity: &'static str,
        id: i64,
        expected: u64,
        actual: u64,
    },

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport failure: {0}")]
    Transport(String),
}

impl BatchError {
    /// Only admission rejection is expected to be retried by callers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BatchError::AdmissionRejected { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BatchError::AggregationTimeout { .. })
    }

    pub fn storage(e: impl std::fmt::Display) -> Self {
        BatchError::Storage(e.to_string())
    }
}
