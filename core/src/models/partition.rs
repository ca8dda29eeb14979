use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::job::JobExecutionId;
use super::step::StepExecutionId;

fn default_threshold() -> f64 {
    1.0
}

/// Request to run one partition on a worker.
///
/// Identity is the (step name, job execution id, step execution id) triple;
/// `threshold` is stamped by the client-side admission controller and does
/// not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionRequest {
    pub step_name: String,
    pub job_execution_id: JobExecutionId,
    pub step_execution_id: StepExecutionId,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl PartitionRequest {
    pub fn new(
        step_name: impl Into<String>,
        job_execution_id: JobExecutionId,
        step_execution_id: StepExecutionId,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            job_execution_id,
            step_execution_id,
            threshold: default_threshold(),
        }
    }
}

impl PartialEq for PartitionRequest {
    fn eq(&self, other: &Self) -> bool {
        self.step_name == other.step_name
            && self.job_execution_id == other.job_execution_id
            && self.step_execution_id == other.step_execution_id
    }
}

impl Eq for PartitionRequest {}

impl Hash for PartitionRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.step_name.hash(state);
        self.job_execution_id.hash(state);
        self.step_execution_id.hash(state);
    }
}

/// Transport envelope returned for one request.
///
/// Carries no status: the authoritative outcome lives on the step execution
/// record in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionResult {
    pub request: PartitionRequest,
    #[serde(default)]
    pub failure_exceptions: Vec<String>,
}

impl PartitionResult {
    pub fn success(request: PartitionRequest) -> Self {
        Self {
            request,
            failure_exceptions: Vec::new(),
        }
    }

    pub fn failed(request: PartitionRequest, failures: Vec<String>) -> Self {
        Self {
            request,
            failure_exceptions: failures,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failure_exceptions.is_empty()
    }
}

/// Load snapshot of a worker or pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    /// Concurrently executing partitions (summed across a pool).
    pub score: f64,
    pub available: bool,
    /// False when `score` is a guess rather than a measurement.
    pub authoritative: bool,
}

impl WorkerStatus {
    pub fn measured(score: f64) -> Self {
        Self {
            score: score.max(0.0),
            available: true,
            authoritative: true,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            score: 0.0,
            available: false,
            authoritative: false,
        }
    }
}

/// A worker's answer to one dispatch attempt. Workers always answer, even
/// when overloaded; overload is signalled through `rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    /// Spare capacity observed by the worker after its decision.
    pub capacity: f64,
    pub rejected: bool,
}

impl WorkerResponse {
    pub fn accepted(capacity: f64) -> Self {
        Self {
            capacity: capacity.max(0.0),
            rejected: false,
        }
    }

    pub fn rejected(capacity: f64) -> Self {
        Self {
            capacity: capacity.max(0.0),
            rejected: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn threshold_does_not_affect_identity() {
        let a = PartitionRequest::new("load", 1, 2);
        let mut b = a.clone();
        b.threshold = 4.0;

        assert_eq!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn wire_format_uses_stable_field_names() {
        let req = PartitionRequest::new("load", 1, 2);
        let json = serde_json::to_value(&req).unwrap();

        assert_eq!(json["stepName"], "load");
        assert_eq!(json["jobExecutionId"], 1);
        assert_eq!(json["stepExecutionId"], 2);
        assert_eq!(json["threshold"], 1.0);

        let result = PartitionResult::failed(req, vec!["boom".into()]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["failureExceptions"][0], "boom");
    }

    #[test]
    fn missing_threshold_defaults_to_one() {
        let req: PartitionRequest = serde_json::from_str(
            r#"{"stepName":"load","jobExecutionId":1,"stepExecutionId":2}"#,
        )
        .unwrap();
        assert_eq!(req.threshold, 1.0);
    }
}
