//! Job and step execution.
//!
//! Steps receive their execution record through an explicit [`StepContext`]
//! rather than ambient per-thread state. Launch-time single-flight checks are
//! plain decorators around the store and the launcher.

pub mod job;
pub mod launcher;
pub mod step;
pub mod synchronizer;

pub use job::{Job, SimpleJob};
pub use launcher::{JobLauncher, SimpleJobLauncher};
pub use step::{Step, StepContext, StepRegistry, Tasklet, TaskletStep};
pub use synchronizer::{LaunchSynchronizer, SynchronizedLauncher, SynchronizedStore};
