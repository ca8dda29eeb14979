//! Ways of getting one partition request executed.
//!
//! Every dispatcher answers every request, including when it is overloaded:
//! overload is a `WorkerResponse` with `rejected` set, never an error. Errors
//! mean the request itself is broken (unknown step or partition) or the
//! transport failed.

use std::sync::Arc;

use async_trait::async_trait;

use corelib::{BatchResult, PartitionRequest, WorkerResponse, WorkerStatus};

mod channel;
mod local;
mod pooled;
mod weighted;

pub use channel::{ChannelDispatcher, Envelope, serve_channel};
pub use local::{LocalDispatcher, LocalDispatcherConfig};
pub use pooled::RoundRobinPool;
pub use weighted::Weighted;

#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    async fn status(&self) -> WorkerStatus;

    async fn execute(&self, request: PartitionRequest) -> BatchResult<WorkerResponse>;
}

#[async_trait]
impl<D: WorkerDispatcher + ?Sized> WorkerDispatcher for Arc<D> {
    async fn status(&self) -> WorkerStatus {
        (**self).status().await
    }

    async fn execute(&self, request: PartitionRequest) -> BatchResult<WorkerResponse> {
        (**self).execute(request).await
    }
}
