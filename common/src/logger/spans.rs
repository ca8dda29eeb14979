use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{Span, field};

use super::TraceId;

/// Root span for one launch / coordination scope.
pub fn root_span(name: &'static str, trace_id: &TraceId) -> Span {
    tracing::info_span!(
        "root",
        name = %name,
        trace_id = %trace_id.as_str(),
        job_name = field::Empty,
        job_execution_id = field::Empty
    )
}

/// Child span, inherits `trace_id` from the enclosing root span.
pub fn child_span(name: &'static str) -> Span {
    tracing::info_span!(
        "child",
        name = %name,
        job_name = field::Empty,
        job_execution_id = field::Empty
    )
}

/// Records job identity on the current span once it is known.
pub fn annotate_span(job_name: &str, job_execution_id: Option<i64>) {
    let span = Span::current();
    span.record("job_name", field::display(job_name));
    if let Some(id) = job_execution_id {
        span.record("job_execution_id", id);
    }
}

pub async fn warn_if_slow<F, T>(label: &'static str, max: Duration, fut: F) -> T
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > max {
        tracing::warn!(
            target: "performance",
            label = label,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow operation detected"
        );
    }
    out
}
