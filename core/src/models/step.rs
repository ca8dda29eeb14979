use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobExecutionId;
use super::status::{BatchStatus, ExitStatus};

pub type StepExecutionId = i64;

/// Opaque restart state owned by a step execution.
pub type ExecutionContext = BTreeMap<String, serde_json::Value>;

/// Persisted record of one step (or one partition of a step) running.
///
/// Counters only ever grow while the step runs. Once `status` is terminal the
/// record is final apart from compensating transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    /// Assigned by the store; 0 until the record is added.
    pub id: StepExecutionId,
    pub job_execution_id: JobExecutionId,
    pub step_name: String,

    pub status: BatchStatus,
    pub exit_status: ExitStatus,

    pub read_count: u64,
    pub write_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub filter_count: u64,
    pub read_skip_count: u64,
    pub write_skip_count: u64,
    pub process_skip_count: u64,

    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,

    pub execution_context: ExecutionContext,
    pub terminate_only: bool,
    pub failure_exceptions: Vec<String>,

    pub version: u64,
}

impl StepExecution {
    pub fn new(step_name: impl Into<String>, job_execution_id: JobExecutionId) -> Self {
        Self {
            id: 0,
            job_execution_id,
            step_name: step_name.into(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            read_count: 0,
            write_count: 0,
            commit_count: 0,
            rollback_count: 0,
            filter_count: 0,
            read_skip_count: 0,
            write_skip_count: 0,
            process_skip_count: 0,
            start_time: Utc::now(),
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            terminate_only: false,
            failure_exceptions: Vec::new(),
            version: 0,
        }
    }

    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.write_skip_count + self.process_skip_count
    }

    pub fn add_failure(&mut self, failure: impl Into<String>) {
        self.failure_exceptions.push(failure.into());
    }

    /// Marks the execution FAILED (never downgrading a more severe status).
    pub fn fail(&mut self, failure: impl Into<String>) {
        self.add_failure(failure);
        self.status = self.status.upgrade_to(BatchStatus::Failed);
        self.exit_status = self.exit_status.clone().and(ExitStatus::failed());
        self.end_time.get_or_insert_with(Utc::now);
    }

    /// Copies the state a remote worker owns from `updated` onto this record.
    ///
    /// Failure exceptions are deliberately left alone: the caller sets them
    /// from the transport-reported list.
    pub fn apply_update(&mut self, updated: &StepExecution) {
        self.status = updated.status;
        self.exit_status = updated.exit_status.clone();
        self.end_time = updated.end_time;
        self.last_updated = updated.last_updated;
        self.execution_context = updated.execution_context.clone();
        self.version = updated.version;
        self.terminate_only = updated.terminate_only;

        self.read_count = updated.read_count;
        self.write_count = updated.write_count;
        self.commit_count = updated.commit_count;
        self.rollback_count = updated.rollback_count;
        self.filter_count = updated.filter_count;
        self.read_skip_count = updated.read_skip_count;
        self.write_skip_count = updated.write_skip_count;
        self.process_skip_count = updated.process_skip_count;
    }

    /// Folds partition executions into this (master) execution.
    ///
    /// Counters are recomputed as the sum over `partitions` rather than added
    /// to, so aggregating the same partitions twice yields the same totals.
    pub fn aggregate<'a, I>(&mut self, partitions: I)
    where
        I: IntoIterator<Item = &'a StepExecution>,
    {
        let mut read = 0;
        let mut write = 0;
        let mut commit = 0;
        let mut rollback = 0;
        let mut filter = 0;
        let mut read_skip = 0;
        let mut write_skip = 0;
        let mut process_skip = 0;
        let mut status: Option<BatchStatus> = None;
        let mut exit_status: Option<ExitStatus> = None;

        for p in partitions {
            read += p.read_count;
            write += p.write_count;
            commit += p.commit_count;
            rollback += p.rollback_count;
            filter += p.filter_count;
            read_skip += p.read_skip_count;
            write_skip += p.write_skip_count;
            process_skip += p.process_skip_count;
            self.terminate_only |= p.terminate_only;

            status = Some(match status {
                Some(s) => s.max(p.status),
                None => p.status,
            });
            exit_status = Some(match exit_status {
                Some(e) => e.and(p.exit_status.clone()),
                None => p.exit_status.clone(),
            });
        }

        self.read_count = read;
        self.write_count = write;
        self.commit_count = commit;
        self.rollback_count = rollback;
        self.filter_count = filter;
        self.read_skip_count = read_skip;
        self.write_skip_count = write_skip;
        self.process_skip_count = process_skip;

        if let Some(s) = status {
            self.status = self.status.upgrade_to(s);
        }
        if let Some(e) = exit_status {
            self.exit_status = self.exit_status.clone().and(e);
        }
    }
}
