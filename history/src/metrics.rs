//! Read-only admin metrics over a bounded window of recent executions.

use serde::Serialize;

use corelib::{BatchResult, BatchStatus, JobExecution, JobExecutionId, StepExecution, StepExecutionId};
use store::ExecutionRecordStore;

use crate::execution_history::{JobExecutionHistory, StepExecutionHistory};

/// How many executions feed the statistics, and how many of the newest are
/// considered when picking the latest one by start time.
#[derive(Debug, Clone, Copy)]
pub struct HistoryWindow {
    pub executions: usize,
    pub latest: usize,
}

impl Default for HistoryWindow {
    fn default() -> Self {
        Self {
            executions: 10,
            latest: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobExecutionMetrics {
    pub job_name: String,
    pub execution_count: usize,
    pub failure_count: usize,
    /// Durations in milliseconds.
    pub mean_duration: f64,
    pub max_duration: f64,
    pub latest_duration: f64,
    pub latest_execution_id: Option<JobExecutionId>,
    pub latest_status: Option<BatchStatus>,
    pub latest_exit_code: Option<String>,
}

impl JobExecutionMetrics {
    pub async fn load(
        store: &dyn ExecutionRecordStore,
        job_name: &str,
        window: HistoryWindow,
    ) -> BatchResult<Self> {
        let mut executions = Vec::new();
        for instance in store.find_job_instances(job_name, 0, window.executions).await? {
            executions.extend(store.get_job_executions(&instance).await?);
        }
        executions.sort_by_key(|e| std::cmp::Reverse(e.creation_order()));
        executions.truncate(window.executions);

        Ok(Self::from_executions(job_name, &executions, window.latest))
    }

    /// `executions` newest first.
    pub fn from_executions(job_name: &str, executions: &[JobExecution], latest_window: usize) -> Self {
        let history = JobExecutionHistory::from_executions(job_name, executions);

        let latest = executions
            .iter()
            .take(latest_window)
            .max_by_key(|e| (e.start_time.unwrap_or(e.create_time), e.id));

        let latest_duration = latest
            .map(|e| JobExecutionHistory::from_executions(job_name, [e]).duration.mean())
            .unwrap_or_default();

        Self {
            job_name: job_name.to_string(),
            execution_count: executions.len(),
            failure_count: executions
                .iter()
                .filter(|e| e.status.is_unsuccessful())
                .count(),
            mean_duration: history.duration.mean(),
            max_duration: history.duration.max(),
            latest_duration,
            latest_execution_id: latest.map(|e| e.id),
            latest_status: latest.map(|e| e.status),
            latest_exit_code: latest.map(|e| e.exit_status.exit_code.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StepExecutionMetrics {
    pub step_name: String,
    pub execution_count: usize,
    pub failure_count: usize,
    pub mean_duration: f64,
    pub max_duration: f64,
    pub latest_duration: f64,
    pub latest_execution_id: Option<StepExecutionId>,
    pub latest_status: Option<BatchStatus>,
    pub latest_exit_code: Option<String>,
    pub mean_read_count: f64,
    pub max_read_count: f64,
    pub mean_write_count: f64,
    pub max_write_count: f64,
}

impl StepExecutionMetrics {
    pub async fn load(
        store: &dyn ExecutionRecordStore,
        step_name: &str,
        window: HistoryWindow,
    ) -> BatchResult<Self> {
        let executions = store.find_step_executions(step_name, window.executions).await?;
        Ok(Self::from_executions(step_name, &executions, window.latest))
    }

    /// `executions` newest first.
    pub fn from_executions(step_name: &str, executions: &[StepExecution], latest_window: usize) -> Self {
        let history = StepExecutionHistory::from_executions(step_name, executions);

        let latest = executions
            .iter()
            .take(latest_window)
            .max_by_key(|e| (e.start_time, e.id));

        let latest_duration = latest
            .map(|e| StepExecutionHistory::from_executions(step_name, [e]).duration.mean())
            .unwrap_or_default();

        Self {
            step_name: step_name.to_string(),
            execution_count: executions.len(),
            failure_count: executions
                .iter()
                .filter(|e| e.status.is_unsuccessful())
                .count(),
            mean_duration: history.duration.mean(),
            max_duration: history.duration.max(),
            latest_duration,
            latest_execution_id: latest.map(|e| e.id),
            latest_status: latest.map(|e| e.status),
            latest_exit_code: latest.map(|e| e.exit_status.exit_code.clone()),
            mean_read_count: history.read_count.mean(),
            max_read_count: history.read_count.max(),
            mean_write_count: history.write_count.mean(),
            max_write_count: history.write_count.max(),
        }
    }
}
