//! Remote-style dispatch over a tokio channel.
//!
//! Requests and replies cross the channel as JSON text, the same payloads a
//! message queue or RPC transport would carry. `serve_channel` is the worker
//! side: it decodes each envelope, runs it against a local dispatcher on its
//! own task and sends the encoded reply back.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use corelib::{
    BatchError, BatchResult, JobExecutionId, PartitionRequest, StepExecutionId, WorkerResponse,
    WorkerStatus,
};

use super::WorkerDispatcher;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum WireRequest {
    Execute { request: PartitionRequest },
    Status,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum WireReply {
    Response {
        response: WorkerResponse,
    },
    Status {
        status: WorkerStatus,
    },
    UnknownStep {
        step_name: String,
    },
    UnknownPartition {
        job_execution_id: JobExecutionId,
        step_execution_id: StepExecutionId,
    },
    Failure {
        message: String,
    },
}

impl WireReply {
    fn from_result(result: BatchResult<WorkerResponse>) -> Self {
        match result {
            Ok(response) => WireReply::Response { response },
            Err(BatchError::UnknownStep(step_name)) => WireReply::UnknownStep { step_name },
            Err(BatchError::UnknownPartition {
                job_execution_id,
                step_execution_id,
            }) => WireReply::UnknownPartition {
                job_execution_id,
                step_execution_id,
            },
            Err(e) => WireReply::Failure {
                message: e.to_string(),
            },
        }
    }
}

/// One message on the channel: an encoded request and where to send the
/// encoded reply.
#[derive(Debug)]
pub struct Envelope {
    payload: String,
    reply: oneshot::Sender<String>,
}

/// Client end of a channel transport.
#[derive(Clone)]
pub struct ChannelDispatcher {
    name: String,
    tx: mpsc::Sender<Envelope>,
}

impl ChannelDispatcher {
    /// Creates a connected client/worker pair. The worker task runs until
    /// every client clone is dropped.
    pub fn spawn(
        name: impl Into<String>,
        worker: Arc<dyn WorkerDispatcher>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let name = name.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = serve_channel(name.clone(), rx, worker);
        (Self { name, tx }, handle)
    }

    pub fn new(name: impl Into<String>, tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }

    async fn call(&self, request: &WireRequest) -> BatchResult<WireReply> {
        let payload = serde_json::to_string(request)?;
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(Envelope {
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BatchError::Transport(format!("worker '{}' is gone", self.name)))?;

        let raw = reply_rx.await.map_err(|_| {
            BatchError::Transport(format!("worker '{}' dropped the request", self.name))
        })?;

        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl WorkerDispatcher for ChannelDispatcher {
    async fn status(&self) -> WorkerStatus {
        match self.call(&WireRequest::Status).await {
            Ok(WireReply::Status { status }) => status,
            Ok(other) => {
                warn!(worker = %self.name, reply = ?other, "unexpected status reply");
                WorkerStatus::unavailable()
            }
            Err(e) => {
                debug!(worker = %self.name, error = %e, "status unavailable");
                WorkerStatus::unavailable()
            }
        }
    }

    async fn execute(&self, request: PartitionRequest) -> BatchResult<WorkerResponse> {
        match self.call(&WireRequest::Execute { request }).await? {
            WireReply::Response { response } => Ok(response),
            WireReply::UnknownStep { step_name } => Err(BatchError::UnknownStep(step_name)),
            WireReply::UnknownPartition {
                job_execution_id,
                step_execution_id,
            } => Err(BatchError::UnknownPartition {
                job_execution_id,
                step_execution_id,
            }),
            WireReply::Failure { message } => Err(BatchError::Transport(message)),
            WireReply::Status { .. } => Err(BatchError::Transport(format!(
                "worker '{}' answered an execute request with a status",
                self.name
            ))),
        }
    }
}

/// Worker loop. Each envelope is handled on its own task so a slow request
/// does not hold up the others.
pub fn serve_channel(
    name: String,
    mut rx: mpsc::Receiver<Envelope>,
    worker: Arc<dyn WorkerDispatcher>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(component = "transport", event = "startup", worker = %name, "channel worker started");

        while let Some(envelope) = rx.recv().await {
            let worker = Arc::clone(&worker);
            let name = name.clone();

            tokio::spawn(async move {
                let reply = match serde_json::from_str::<WireRequest>(&envelope.payload) {
                    Ok(WireRequest::Execute { request }) => {
                        WireReply::from_result(worker.execute(request).await)
                    }
                    Ok(WireRequest::Status) => WireReply::Status {
                        status: worker.status().await,
                    },
                    Err(e) => WireReply::Failure {
                        message: format!("malformed request: {e}"),
                    },
                };

                let encoded = match serde_json::to_string(&reply) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(worker = %name, error = %e, "could not encode reply");
                        return;
                    }
                };
                if envelope.reply.send(encoded).is_err() {
                    debug!(worker = %name, "caller went away before the reply");
                }
            });
        }

        info!(component = "transport", event = "shutdown", worker = %name, "channel worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Echo {
        seen: Mutex<Vec<PartitionRequest>>,
    }

    #[async_trait]
    impl WorkerDispatcher for Echo {
        async fn status(&self) -> WorkerStatus {
            WorkerStatus::measured(self.seen.lock().len() as f64)
        }

        async fn execute(&self, request: PartitionRequest) -> BatchResult<WorkerResponse> {
            if request.step_execution_id < 0 {
                return Err(BatchError::UnknownPartition {
                    job_execution_id: request.job_execution_id,
                    step_execution_id: request.step_execution_id,
                });
            }
            let threshold = request.threshold;
            self.seen.lock().push(request);
            Ok(WorkerResponse::accepted(threshold - 1.0))
        }
    }

    #[tokio::test]
    async fn request_and_reply_cross_the_channel() {
        let echo = Arc::new(Echo {
            seen: Mutex::new(Vec::new()),
        });
        let (client, _worker) = ChannelDispatcher::spawn("remote-1", echo.clone(), 8);

        let mut req = PartitionRequest::new("load", 1, 7);
        req.threshold = 3.0;
        let response = client.execute(req.clone()).await.unwrap();

        assert_eq!(response, WorkerResponse::accepted(2.0));
        assert_eq!(echo.seen.lock()[0], req);
        assert_eq!(echo.seen.lock()[0].threshold, 3.0);

        let status = client.status().await;
        assert!(status.available);
        assert_eq!(status.score, 1.0);
    }

    #[tokio::test]
    async fn unknown_partition_keeps_its_kind() {
        let echo = Arc::new(Echo {
            seen: Mutex::new(Vec::new()),
        });
        let (client, _worker) = ChannelDispatcher::spawn("remote-1", echo, 8);

        let err = client
            .execute(PartitionRequest::new("load", 1, -1))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::UnknownPartition { step_execution_id: -1, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn closed_worker_is_a_transport_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let client = ChannelDispatcher::new("remote-1", tx);

        let err = client
            .execute(PartitionRequest::new("load", 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Transport(_)));
        assert!(!client.status().await.available);
    }
}
