//! Rolling execution statistics for monitoring.
//!
//! Everything here is derived from the execution records in the store; nothing
//! is authoritative state.

pub mod execution_history;
pub mod metrics;
pub mod registry;
pub mod statistics;

pub use execution_history::{JobExecutionHistory, StepExecutionHistory};
pub use metrics::{HistoryWindow, JobExecutionMetrics, StepExecutionMetrics};
pub use registry::{MetricsRegistry, MetricsSnapshot};
pub use statistics::CumulativeStatistics;
