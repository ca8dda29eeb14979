use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info};

use common::logger::{TraceId, annotate_span, root_span};
use corelib::{BatchResult, JobExecution, JobParameters};
use store::ExecutionRecordStore;

use crate::job::Job;

#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn launch(&self, job: Arc<dyn Job>, params: JobParameters) -> BatchResult<JobExecution>;
}

/// Creates the execution record and runs the job inline.
pub struct SimpleJobLauncher {
    store: Arc<dyn ExecutionRecordStore>,
    cancel: CancellationToken,
}

impl SimpleJobLauncher {
    pub fn new(store: Arc<dyn ExecutionRecordStore>) -> Self {
        Self::with_cancellation(store, CancellationToken::new())
    }

    /// Jobs launched here stop when `cancel` fires.
    pub fn with_cancellation(store: Arc<dyn ExecutionRecordStore>, cancel: CancellationToken) -> Self {
        Self { store, cancel }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionRecordStore> {
        &self.store
    }
}

#[async_trait]
impl JobLauncher for SimpleJobLauncher {
    async fn launch(&self, job: Arc<dyn Job>, params: JobParameters) -> BatchResult<JobExecution> {
        let trace_id = TraceId::default();
        let span = root_span("launch", &trace_id);

        async move {
            annotate_span(job.name(), None);

            let mut execution = self.store.create_job_execution(job.name(), &params).await?;
            annotate_span(job.name(), Some(execution.id));
            info!(params = %params.identifying_key(), "job execution created");

            if let Err(e) = job.execute(&mut execution, &self.store, &self.cancel).await {
                error!(error = %e, "job execution aborted");
                return Err(e);
            }
            Ok(execution)
        }
        .instrument(span)
        .await
    }
}
