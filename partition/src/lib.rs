//! Partitioned step execution.
//!
//! A master step is split into partition step executions, each one is
//! dispatched to a worker through a client-side [`AdmissionController`], and
//! the results are merged back into the master's job execution.

pub mod admission;
pub mod aggregator;
pub mod coordinator;
pub mod dispatcher;
pub mod poller;
pub mod splitter;
pub mod step;

pub use admission::{AdmissionController, AdmissionSnapshot};
pub use aggregator::{AggregatorConfig, DispatchingAggregator, RequestAggregator};
pub use coordinator::PartitionCoordinator;
pub use dispatcher::{
    ChannelDispatcher, Envelope, LocalDispatcher, LocalDispatcherConfig, RoundRobinPool,
    Weighted, WorkerDispatcher, serve_channel,
};
pub use poller::StepExecutionPoller;
pub use splitter::{
    PARTITION_COUNT_KEY, PARTITION_INDEX_KEY, Partitioner, SimplePartitioner,
    StepExecutionSplitter,
};
pub use step::PartitionStep;
