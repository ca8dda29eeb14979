pub mod job;
pub mod params;
pub mod partition;
pub mod status;
pub mod step;

pub use job::{JobExecution, JobExecutionId, JobInstance, JobInstanceId};
pub use params::{JobParameter, JobParameters, ParameterValue};
pub use partition::{PartitionRequest, PartitionResult, WorkerResponse, WorkerStatus};
pub use status::{BatchStatus, ExitStatus};
pub use step::{ExecutionContext, StepExecution, StepExecutionId};
