use chrono::{DateTime, Utc};
use serde::Serialize;

use corelib::{JobExecution, StepExecution};

use crate::statistics::CumulativeStatistics;

fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64
}

/// Per-step statistics rebuilt from recent executions of one step name.
#[derive(Debug, Clone, Serialize)]
pub struct StepExecutionHistory {
    pub step_name: String,
    /// Milliseconds.
    pub duration: CumulativeStatistics,
    pub read_count: CumulativeStatistics,
    pub write_count: CumulativeStatistics,
    pub filter_count: CumulativeStatistics,
    pub commit_count: CumulativeStatistics,
    pub rollback_count: CumulativeStatistics,
    pub read_skip_count: CumulativeStatistics,
    pub write_skip_count: CumulativeStatistics,
    pub process_skip_count: CumulativeStatistics,
}

impl StepExecutionHistory {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            duration: CumulativeStatistics::new(),
            read_count: CumulativeStatistics::new(),
            write_count: CumulativeStatistics::new(),
            filter_count: CumulativeStatistics::new(),
            commit_count: CumulativeStatistics::new(),
            rollback_count: CumulativeStatistics::new(),
            read_skip_count: CumulativeStatistics::new(),
            write_skip_count: CumulativeStatistics::new(),
            process_skip_count: CumulativeStatistics::new(),
        }
    }

    pub fn from_executions<'a>(
        step_name: impl Into<String>,
        executions: impl IntoIterator<Item = &'a StepExecution>,
    ) -> Self {
        let mut history = Self::new(step_name);
        for e in executions {
            history.append(e);
        }
        history
    }

    /// Ignores executions that have not ended yet.
    pub fn append(&mut self, execution: &StepExecution) {
        let Some(end) = execution.end_time else {
            return;
        };

        self.duration
            .append(duration_ms(execution.start_time, end));
        self.read_count.append(execution.read_count as f64);
        self.write_count.append(execution.write_count as f64);
        self.filter_count.append(execution.filter_count as f64);
        self.commit_count.append(execution.commit_count as f64);
        self.rollback_count.append(execution.rollback_count as f64);
        self.read_skip_count.append(execution.read_skip_count as f64);
        self.write_skip_count.append(execution.write_skip_count as f64);
        self.process_skip_count
            .append(execution.process_skip_count as f64);
    }

    pub fn count(&self) -> u64 {
        self.duration.count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobExecutionHistory {
    pub job_name: String,
    /// Milliseconds.
    pub duration: CumulativeStatistics,
}

impl JobExecutionHistory {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            duration: CumulativeStatistics::new(),
        }
    }

    pub fn from_executions<'a>(
        job_name: impl Into<String>,
        executions: impl IntoIterator<Item = &'a JobExecution>,
    ) -> Self {
        let mut history = Self::new(job_name);
        for e in executions {
            history.append(e);
        }
        history
    }

    /// Ignores executions that have not ended yet. Executions that ended
    /// without ever starting count from their creation time.
    pub fn append(&mut self, execution: &JobExecution) {
        let Some(end) = execution.end_time else {
            return;
        };
        let start = execution.start_time.unwrap_or(execution.create_time);
        self.duration.append(duration_ms(start, end));
    }

    pub fn count(&self) -> u64 {
        self.duration.count()
    }
}
