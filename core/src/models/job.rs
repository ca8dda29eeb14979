use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::params::JobParameters;
use super::status::{BatchStatus, ExitStatus};
use super::step::{StepExecution, StepExecutionId};

pub type JobInstanceId = i64;
pub type JobExecutionId = i64;

/// A job name plus one identifying parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub job_name: String,
}

/// One attempt at running a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub id: JobExecutionId,
    pub instance_id: JobInstanceId,
    pub job_name: String,

    pub status: BatchStatus,
    pub exit_status: ExitStatus,

    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,

    pub parameters: JobParameters,
    pub version: u64,

    pub step_executions: Vec<StepExecution>,
}

impl JobExecution {
    pub fn new(
        id: JobExecutionId,
        instance: &JobInstance,
        parameters: JobParameters,
        create_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            instance_id: instance.id,
            job_name: instance.job_name.clone(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            create_time,
            start_time: None,
            end_time: None,
            last_updated: Some(create_time),
            parameters,
            version: 0,
            step_executions: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.end_time.is_none() && self.status.is_running()
    }

    pub fn step_execution(&self, id: StepExecutionId) -> Option<&StepExecution> {
        self.step_executions.iter().find(|s| s.id == id)
    }

    pub fn step_execution_mut(&mut self, id: StepExecutionId) -> Option<&mut StepExecution> {
        self.step_executions.iter_mut().find(|s| s.id == id)
    }

    /// Inserts or replaces the child record with the same id.
    pub fn attach_step_execution(&mut self, step: StepExecution) {
        match self.step_execution_mut(step.id) {
            Some(existing) => *existing = step,
            None => self.step_executions.push(step),
        }
    }

    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    /// Orders executions so that the later-created one compares greater.
    pub fn creation_order(&self) -> (DateTime<Utc>, JobExecutionId) {
        (self.create_time, self.id)
    }
}
