use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use corelib::BatchResult;
use store::ExecutionRecordStore;

use crate::metrics::{HistoryWindow, JobExecutionMetrics, StepExecutionMetrics};

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub jobs: BTreeMap<String, JobExecutionMetrics>,
    pub steps: BTreeMap<String, StepExecutionMetrics>,
}

struct Reporter {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Set of job and step names whose metrics are published.
///
/// Names can be added and removed at any time; the periodic reporter picks up
/// the current set on every tick.
pub struct MetricsRegistry {
    store: Arc<dyn ExecutionRecordStore>,
    window: HistoryWindow,
    jobs: Mutex<BTreeSet<String>>,
    steps: Mutex<BTreeSet<String>>,
    reporter: Mutex<Option<Reporter>>,
}

impl MetricsRegistry {
    pub fn new(store: Arc<dyn ExecutionRecordStore>, window: HistoryWindow) -> Self {
        Self {
            store,
            window,
            jobs: Mutex::new(BTreeSet::new()),
            steps: Mutex::new(BTreeSet::new()),
            reporter: Mutex::new(None),
        }
    }

    /// Returns false if the job was already registered.
    pub fn register_job(&self, job_name: impl Into<String>) -> bool {
        self.jobs.lock().insert(job_name.into())
    }

    pub fn unregister_job(&self, job_name: &str) -> bool {
        self.jobs.lock().remove(job_name)
    }

    pub fn register_step(&self, step_name: impl Into<String>) -> bool {
        self.steps.lock().insert(step_name.into())
    }

    pub fn unregister_step(&self, step_name: &str) -> bool {
        self.steps.lock().remove(step_name)
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.lock().iter().cloned().collect()
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.lock().iter().cloned().collect()
    }

    pub async fn snapshot(&self) -> BatchResult<MetricsSnapshot> {
        let mut snapshot = MetricsSnapshot::default();

        for name in self.job_names() {
            let m = JobExecutionMetrics::load(self.store.as_ref(), &name, self.window).await?;
            snapshot.jobs.insert(name, m);
        }
        for name in self.step_names() {
            let m = StepExecutionMetrics::load(self.store.as_ref(), &name, self.window).await?;
            snapshot.steps.insert(name, m);
        }

        Ok(snapshot)
    }

    /// Starts the periodic reporter. Returns false if it is already running.
    pub fn start(self: &Arc<Self>, interval: Duration) -> bool {
        let mut slot = self.reporter.lock();
        if slot.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let registry = Arc::clone(self);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match registry.snapshot().await {
                    Ok(snapshot) => report(&snapshot),
                    Err(e) => warn!(target: "metrics", error = %e, "metrics snapshot failed"),
                }
            }
            debug!(target: "metrics", "metrics reporter stopped");
        });

        *slot = Some(Reporter { cancel, handle });
        info!(target: "metrics", interval_ms = interval.as_millis() as u64, "metrics reporter started");
        true
    }

    /// Stops the reporter and waits for its task to exit.
    pub async fn stop(&self) {
        let reporter = self.reporter.lock().take();
        if let Some(r) = reporter {
            r.cancel.cancel();
            if let Err(e) = r.handle.await {
                warn!(target: "metrics", error = %e, "metrics reporter task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.reporter.lock().is_some()
    }
}

fn report(snapshot: &MetricsSnapshot) {
    for (name, m) in &snapshot.jobs {
        info!(
            target: "metrics",
            job_name = %name,
            executions = m.execution_count,
            failures = m.failure_count,
            mean_duration_ms = m.mean_duration,
            max_duration_ms = m.max_duration,
            latest_status = ?m.latest_status,
            "job metrics"
        );
    }
    for (name, m) in &snapshot.steps {
        info!(
            target: "metrics",
            step_name = %name,
            executions = m.execution_count,
            failures = m.failure_count,
            mean_duration_ms = m.mean_duration,
            mean_read_count = m.mean_read_count,
            mean_write_count = m.mean_write_count,
            "step metrics"
        );
    }
}
