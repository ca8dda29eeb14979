use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use corelib::{
    BatchError, BatchResult, BatchStatus, JobExecution, JobExecutionId, JobInstance,
    JobInstanceId, JobParameters, StepExecution, StepExecutionId,
};

use crate::ExecutionRecordStore;

#[derive(Default)]
struct Tables {
    /// instance id -> (instance, identifying key)
    instances: BTreeMap<JobInstanceId, (JobInstance, String)>,
    /// Job executions without their children.
    jobs: BTreeMap<JobExecutionId, JobExecution>,
    steps: BTreeMap<StepExecutionId, StepExecution>,
    next_instance_id: JobInstanceId,
    next_job_id: JobExecutionId,
    next_step_id: StepExecutionId,
}

impl Tables {
    fn find_instance(&self, job_name: &str, key: &str) -> Option<&JobInstance> {
        self.instances
            .values()
            .find(|(i, k)| i.job_name == job_name && k == key)
            .map(|(i, _)| i)
    }

    fn with_steps(&self, job: &JobExecution) -> JobExecution {
        let mut out = job.clone();
        out.step_executions = self
            .steps
            .values()
            .filter(|s| s.job_execution_id == job.id)
            .cloned()
            .collect();
        out
    }

    fn executions_of(&self, instance_id: JobInstanceId) -> Vec<&JobExecution> {
        let mut out: Vec<_> = self
            .jobs
            .values()
            .filter(|j| j.instance_id == instance_id)
            .collect();
        out.sort_by_key(|j| std::cmp::Reverse(j.creation_order()));
        out
    }
}

/// In-process store. Creation is serialized under one lock, so it is the
/// mutual-exclusion point for concurrent launches.
#[derive(Default)]
pub struct MemoryExecutionStore {
    tables: Mutex<Tables>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRecordStore for MemoryExecutionStore {
    #[instrument(skip(self, params), target = "store", fields(job_name = %job_name))]
    async fn create_job_execution(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> BatchResult<JobExecution> {
        let key = params.identifying_key();
        let mut t = self.tables.lock();

        let instance = match t.find_instance(job_name, &key) {
            Some(i) => i.clone(),
            None => {
                t.next_instance_id += 1;
                let instance = JobInstance {
                    id: t.next_instance_id,
                    job_name: job_name.to_string(),
                };
                t.instances
                    .insert(instance.id, (instance.clone(), key.clone()));
                instance
            }
        };

        for existing in t.executions_of(instance.id) {
            if existing.is_running() {
                return Err(BatchError::AlreadyRunning {
                    job_name: job_name.to_string(),
                    execution_id: Some(existing.id),
                });
            }
            if existing.status == BatchStatus::Completed && params.has_identifying() {
                return Err(BatchError::InstanceAlreadyComplete {
                    job_name: job_name.to_string(),
                    parameters: key,
                });
            }
        }

        t.next_job_id += 1;
        let execution = JobExecution::new(t.next_job_id, &instance, params.clone(), Utc::now());
        t.jobs.insert(execution.id, execution.clone());

        debug!(
            job_execution_id = execution.id,
            instance_id = instance.id,
            "job execution created"
        );
        Ok(execution)
    }

    async fn update_job_execution(&self, execution: &mut JobExecution) -> BatchResult<()> {
        let mut t = self.tables.lock();
        let stored = t
            .jobs
            .get_mut(&execution.id)
            .ok_or_else(|| BatchError::Storage(format!("job execution {} not found", execution.id)))?;

        if stored.version != execution.version {
            return Err(BatchError::ConcurrencyConflict {
                entity: "job execution",
                id: execution.id,
                expected: execution.version,
                actual: stored.version,
            });
        }

        execution.version += 1;
        execution.last_updated = Some(Utc::now());

        let mut row = execution.clone();
        row.step_executions.clear();
        *stored = row;
        Ok(())
    }

    async fn add_step_execution(&self, step: &mut StepExecution) -> BatchResult<()> {
        let mut t = self.tables.lock();
        if !t.jobs.contains_key(&step.job_execution_id) {
            return Err(BatchError::Storage(format!(
                "job execution {} not found for step '{}'",
                step.job_execution_id, step.step_name
            )));
        }

        t.next_step_id += 1;
        step.id = t.next_step_id;
        step.version = 0;
        step.last_updated = Some(Utc::now());
        t.steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn update_step_execution(&self, step: &mut StepExecution) -> BatchResult<()> {
        let mut t = self.tables.lock();
        let stored = t
            .steps
            .get_mut(&step.id)
            .filter(|s| s.job_execution_id == step.job_execution_id)
            .ok_or(BatchError::UnknownPartition {
                job_execution_id: step.job_execution_id,
                step_execution_id: step.id,
            })?;

        if stored.version != step.version {
            return Err(BatchError::ConcurrencyConflict {
                entity: "step execution",
                id: step.id,
                expected: step.version,
                actual: stored.version,
            });
        }

        step.version += 1;
        step.last_updated = Some(Utc::now());
        *stored = step.clone();
        Ok(())
    }

    async fn get_job_execution(&self, id: JobExecutionId) -> BatchResult<Option<JobExecution>> {
        let t = self.tables.lock();
        Ok(t.jobs.get(&id).map(|j| t.with_steps(j)))
    }

    async fn get_last_job_execution(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> BatchResult<Option<JobExecution>> {
        let t = self.tables.lock();
        let Some(instance) = t.find_instance(job_name, &params.identifying_key()) else {
            return Ok(None);
        };
        Ok(t
            .executions_of(instance.id)
            .first()
            .map(|j| t.with_steps(j)))
    }

    async fn find_running_job_executions(&self, job_name: &str) -> BatchResult<Vec<JobExecution>> {
        let t = self.tables.lock();
        Ok(t.jobs
            .values()
            .filter(|j| j.job_name == job_name && j.is_running())
            .map(|j| t.with_steps(j))
            .collect())
    }

    async fn get_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_execution_id: StepExecutionId,
    ) -> BatchResult<Option<StepExecution>> {
        let t = self.tables.lock();
        Ok(t.steps
            .get(&step_execution_id)
            .filter(|s| s.job_execution_id == job_execution_id)
            .cloned())
    }

    async fn get_job_executions(&self, instance: &JobInstance) -> BatchResult<Vec<JobExecution>> {
        let t = self.tables.lock();
        Ok(t.executions_of(instance.id)
            .into_iter()
            .map(|j| t.with_steps(j))
            .collect())
    }

    async fn find_job_instances(
        &self,
        job_name: &str,
        start: usize,
        count: usize,
    ) -> BatchResult<Vec<JobInstance>> {
        let t = self.tables.lock();
        Ok(t.instances
            .values()
            .rev()
            .filter(|(i, _)| i.job_name == job_name)
            .skip(start)
            .take(count)
            .map(|(i, _)| i.clone())
            .collect())
    }

    async fn job_names(&self) -> BatchResult<Vec<String>> {
        let t = self.tables.lock();
        let mut names: Vec<String> = t
            .instances
            .values()
            .map(|(i, _)| i.job_name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn find_step_executions(
        &self,
        step_name: &str,
        count: usize,
    ) -> BatchResult<Vec<StepExecution>> {
        let t = self.tables.lock();
        let mut out: Vec<StepExecution> = t
            .steps
            .values()
            .filter(|s| s.step_name == step_name)
            .cloned()
            .collect();
        out.sort_by_key(|s| std::cmp::Reverse((s.start_time, s.id)));
        out.truncate(count);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_assigned_sequentially() {
        let store = MemoryExecutionStore::new();
        let a = store
            .create_job_execution("a", &JobParameters::new().with_long("run.id", 1))
            .await
            .unwrap();
        let b = store
            .create_job_execution("b", &JobParameters::new())
            .await
            .unwrap();

        assert_eq!((a.id, b.id), (1, 2));
        assert_ne!(a.instance_id, b.instance_id);
    }

    #[tokio::test]
    async fn step_lookup_checks_owning_job() {
        let store = MemoryExecutionStore::new();
        let job = store
            .create_job_execution("a", &JobParameters::new())
            .await
            .unwrap();

        let mut step = StepExecution::new("load", job.id);
        store.add_step_execution(&mut step).await.unwrap();

        assert!(store.get_step_execution(job.id, step.id).await.unwrap().is_some());
        assert!(store.get_step_execution(job.id + 1, step.id).await.unwrap().is_none());
    }
}
