//! SqliteExecutionStore
//! --------------------
//! SQLite-backed `ExecutionRecordStore`. Timestamps are stored as epoch
//! milliseconds; parameters, execution contexts and failure lists as JSON.
//!
//! Updates are optimistic: `UPDATE ... WHERE id = ? AND version = ?` and a
//! zero row count is reported as a concurrency conflict.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument, warn};

use common::logger::warn_if_slow;
use corelib::{
    BatchError, BatchResult, BatchStatus, ExitStatus, JobExecution, JobExecutionId, JobInstance,
    JobParameters, StepExecution, StepExecutionId,
};

use crate::ExecutionRecordStore;

const JOB_COLUMNS: &str = "id, instance_id, job_name, status, exit_code, exit_description, \
     create_time_ms, start_time_ms, end_time_ms, last_updated_ms, parameters_json, version";

const STEP_COLUMNS: &str = "id, job_execution_id, step_name, status, exit_code, exit_description, \
     read_count, write_count, commit_count, rollback_count, filter_count, \
     read_skip_count, write_skip_count, process_skip_count, \
     start_time_ms, end_time_ms, last_updated_ms, context_json, terminate_only, failures_json, version";

fn db_err(e: sqlx::Error) -> BatchError {
    BatchError::storage(e)
}

fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(ms: i64) -> BatchResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| BatchError::Storage(format!("timestamp out of range: {ms}")))
}

fn from_opt_ms(ms: Option<i64>) -> BatchResult<Option<DateTime<Utc>>> {
    ms.map(from_ms).transpose()
}

fn parse_status(s: &str) -> BatchResult<BatchStatus> {
    BatchStatus::from_str(s).map_err(|e| BatchError::Storage(e.to_string()))
}

pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if missing) the database at `url` and ensures the
    /// schema exists. In-memory databases are pinned to one connection so
    /// every query sees the same database.
    pub async fn connect(url: &str) -> BatchResult<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let opts = SqliteConnectOptions::from_str(url)
            .map_err(db_err)?
            .create_if_missing(true);

        let pool_opts = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(8)
                .acquire_timeout(Duration::from_secs(5))
        };

        let pool = pool_opts.connect_with(opts).await.map_err(db_err)?;
        let store = Self { pool };
        store.migrate().await?;

        info!(url = %url, in_memory, "sqlite execution store ready");
        Ok(store)
    }

    pub async fn migrate(&self) -> BatchResult<()> {
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS job_instances (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  job_name TEXT NOT NULL,
  job_key TEXT NOT NULL,
  UNIQUE (job_name, job_key)
);
"#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS job_executions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  instance_id INTEGER NOT NULL REFERENCES job_instances(id),
  job_name TEXT NOT NULL,
  status TEXT NOT NULL,
  exit_code TEXT NOT NULL,
  exit_description TEXT NOT NULL,
  create_time_ms BIGINT NOT NULL,
  start_time_ms BIGINT,
  end_time_ms BIGINT,
  last_updated_ms BIGINT,
  parameters_json TEXT NOT NULL,
  version BIGINT NOT NULL
);
"#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS step_executions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  job_execution_id INTEGER NOT NULL REFERENCES job_executions(id),
  step_name TEXT NOT NULL,
  status TEXT NOT NULL,
  exit_code TEXT NOT NULL,
  exit_description TEXT NOT NULL,
  read_count BIGINT NOT NULL,
  write_count BIGINT NOT NULL,
  commit_count BIGINT NOT NULL,
  rollback_count BIGINT NOT NULL,
  filter_count BIGINT NOT NULL,
  read_skip_count BIGINT NOT NULL,
  write_skip_count BIGINT NOT NULL,
  process_skip_count BIGINT NOT NULL,
  start_time_ms BIGINT NOT NULL,
  end_time_ms BIGINT,
  last_updated_ms BIGINT,
  context_json TEXT NOT NULL,
  terminate_only INTEGER NOT NULL CHECK (terminate_only IN (0,1)),
  failures_json TEXT NOT NULL,
  version BIGINT NOT NULL
);
"#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_job_executions_name ON job_executions(job_name);"#)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_step_executions_job ON step_executions(job_execution_id);"#)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_step_executions_name ON step_executions(step_name);"#)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    async fn load_steps(&self, job: &mut JobExecution) -> BatchResult<()> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_executions WHERE job_execution_id = ? ORDER BY id"
        ))
        .bind(job.id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        job.step_executions = rows
            .iter()
            .map(row_to_step_execution)
            .collect::<BatchResult<Vec<_>>>()?;
        Ok(())
    }

    async fn jobs_with_steps(&self, rows: Vec<SqliteRow>) -> BatchResult<Vec<JobExecution>> {
        let mut out = Vec::with_capacity(rows.len());
        for r in &rows {
            let mut job = row_to_job_execution(r)?;
            self.load_steps(&mut job).await?;
            out.push(job);
        }
        Ok(out)
    }

    async fn current_version(&self, table: &'static str, id: i64) -> BatchResult<Option<u64>> {
        let row = sqlx::query(&format!("SELECT version FROM {table} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|r| r.try_get::<i64, _>("version").map(|v| v as u64))
            .transpose()
            .map_err(db_err)
    }
}

#[async_trait]
impl ExecutionRecordStore for SqliteExecutionStore {
    #[instrument(skip(self, params), target = "store", fields(job_name = %job_name))]
    async fn create_job_execution(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> BatchResult<JobExecution> {
        let key = params.identifying_key();
        let parameters_json = serde_json::to_string(params)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let existing = sqlx::query("SELECT id FROM job_instances WHERE job_name = ? AND job_key = ?")
            .bind(job_name)
            .bind(&key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

        let instance_id = match existing {
            Some(r) => r.try_get::<i64, _>("id").map_err(db_err)?,
            None => sqlx::query("INSERT INTO job_instances (job_name, job_key) VALUES (?, ?)")
                .bind(job_name)
                .bind(&key)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .last_insert_rowid(),
        };

        let prior = sqlx::query(
            "SELECT id, status, end_time_ms FROM job_executions WHERE instance_id = ? ORDER BY id DESC",
        )
        .bind(instance_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        for r in &prior {
            let id: i64 = r.try_get("id").map_err(db_err)?;
            let status = parse_status(&r.try_get::<String, _>("status").map_err(db_err)?)?;
            let end: Option<i64> = r.try_get("end_time_ms").map_err(db_err)?;

            if status.is_running() && end.is_none() {
                return Err(BatchError::AlreadyRunning {
                    job_name: job_name.to_string(),
                    execution_id: Some(id),
                });
            }
            if status == BatchStatus::Completed && params.has_identifying() {
                return Err(BatchError::InstanceAlreadyComplete {
                    job_name: job_name.to_string(),
                    parameters: key,
                });
            }
        }

        let instance = JobInstance {
            id: instance_id,
            job_name: job_name.to_string(),
        };
        let mut execution = JobExecution::new(0, &instance, params.clone(), Utc::now());

        let id = sqlx::query(
            r#"
INSERT INTO job_executions (
  instance_id, job_name, status, exit_code, exit_description,
  create_time_ms, start_time_ms, end_time_ms, last_updated_ms,
  parameters_json, version
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#,
        )
        .bind(instance_id)
        .bind(job_name)
        .bind(execution.status.as_str())
        .bind(&execution.exit_status.exit_code)
        .bind(&execution.exit_status.exit_description)
        .bind(to_ms(execution.create_time))
        .bind(execution.start_time.map(to_ms))
        .bind(execution.end_time.map(to_ms))
        .bind(execution.last_updated.map(to_ms))
        .bind(parameters_json)
        .bind(execution.version as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .last_insert_rowid();

        tx.commit().await.map_err(db_err)?;

        execution.id = id;
        debug!(job_execution_id = id, instance_id, "job execution created");
        Ok(execution)
    }

    async fn update_job_execution(&self, execution: &mut JobExecution) -> BatchResult<()> {
        let now = Utc::now();
        let parameters_json = serde_json::to_string(&execution.parameters)?;

        let result = warn_if_slow("db_update_job_execution", Duration::from_millis(100), async {
            sqlx::query(
                r#"
UPDATE job_executions SET
  status = ?, exit_code = ?, exit_description = ?,
  start_time_ms = ?, end_time_ms = ?, last_updated_ms = ?,
  parameters_json = ?, version = version + 1
WHERE id = ? AND version = ?
"#,
            )
            .bind(execution.status.as_str())
            .bind(&execution.exit_status.exit_code)
            .bind(&execution.exit_status.exit_description)
            .bind(execution.start_time.map(to_ms))
            .bind(execution.end_time.map(to_ms))
            .bind(to_ms(now))
            .bind(parameters_json)
            .bind(execution.id)
            .bind(execution.version as i64)
            .execute(&self.pool)
            .await
        })
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return match self.current_version("job_executions", execution.id).await? {
                Some(actual) => {
                    warn!(job_execution_id = execution.id, expected = execution.version, actual, "stale job execution update");
                    Err(BatchError::ConcurrencyConflict {
                        entity: "job execution",
                        id: execution.id,
                        expected: execution.version,
                        actual,
                    })
                }
                None => Err(BatchError::Storage(format!(
                    "job execution {} not found",
                    execution.id
                ))),
            };
        }

        execution.version += 1;
        execution.last_updated = Some(now);
        Ok(())
    }

    async fn add_step_execution(&self, step: &mut StepExecution) -> BatchResult<()> {
        let now = Utc::now();
        let context_json = serde_json::to_string(&step.execution_context)?;
        let failures_json = serde_json::to_string(&step.failure_exceptions)?;

        let id = sqlx::query(&format!(
            "INSERT INTO step_executions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            STEP_COLUMNS
        ))
        .bind(None::<i64>)
        .bind(step.job_execution_id)
        .bind(&step.step_name)
        .bind(step.status.as_str())
        .bind(&step.exit_status.exit_code)
        .bind(&step.exit_status.exit_description)
        .bind(step.read_count as i64)
        .bind(step.write_count as i64)
        .bind(step.commit_count as i64)
        .bind(step.rollback_count as i64)
        .bind(step.filter_count as i64)
        .bind(step.read_skip_count as i64)
        .bind(step.write_skip_count as i64)
        .bind(step.process_skip_count as i64)
        .bind(to_ms(step.start_time))
        .bind(step.end_time.map(to_ms))
        .bind(to_ms(now))
        .bind(context_json)
        .bind(step.terminate_only)
        .bind(failures_json)
        .bind(0_i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .last_insert_rowid();

        step.id = id;
        step.version = 0;
        step.last_updated = Some(now);
        Ok(())
    }

    async fn update_step_execution(&self, step: &mut StepExecution) -> BatchResult<()> {
        let now = Utc::now();
        let context_json = serde_json::to_string(&step.execution_context)?;
        let failures_json = serde_json::to_string(&step.failure_exceptions)?;

        let result = warn_if_slow("db_update_step_execution", Duration::from_millis(100), async {
            sqlx::query(
                r#"
UPDATE step_executions SET
  status = ?, exit_code = ?, exit_description = ?,
  read_count = ?, write_count = ?, commit_count = ?, rollback_count = ?, filter_count = ?,
  read_skip_count = ?, write_skip_count = ?, process_skip_count = ?,
  start_time_ms = ?, end_time_ms = ?, last_updated_ms = ?,
  context_json = ?, terminate_only = ?, failures_json = ?,
  version = version + 1
WHERE id = ? AND job_execution_id = ? AND version = ?
"#,
            )
            .bind(step.status.as_str())
            .bind(&step.exit_status.exit_code)
            .bind(&step.exit_status.exit_description)
            .bind(step.read_count as i64)
            .bind(step.write_count as i64)
            .bind(step.commit_count as i64)
            .bind(step.rollback_count as i64)
            .bind(step.filter_count as i64)
            .bind(step.read_skip_count as i64)
            .bind(step.write_skip_count as i64)
            .bind(step.process_skip_count as i64)
            .bind(to_ms(step.start_time))
            .bind(step.end_time.map(to_ms))
            .bind(to_ms(now))
            .bind(context_json)
            .bind(step.terminate_only)
            .bind(failures_json)
            .bind(step.id)
            .bind(step.job_execution_id)
            .bind(step.version as i64)
            .execute(&self.pool)
            .await
        })
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return match self.get_step_execution(step.job_execution_id, step.id).await? {
                Some(stored) => Err(BatchError::ConcurrencyConflict {
                    entity: "step execution",
                    id: step.id,
                    expected: step.version,
                    actual: stored.version,
                }),
                None => Err(BatchError::UnknownPartition {
                    job_execution_id: step.job_execution_id,
                    step_execution_id: step.id,
                }),
            };
        }

        step.version += 1;
        step.last_updated = Some(now);
        Ok(())
    }

    async fn get_job_execution(&self, id: JobExecutionId) -> BatchResult<Option<JobExecution>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM job_executions WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(r) => {
                let mut job = row_to_job_execution(&r)?;
                self.load_steps(&mut job).await?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn get_last_job_execution(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> BatchResult<Option<JobExecution>> {
        let row = sqlx::query(&format!(
            r#"
SELECT {JOB_COLUMNS} FROM job_executions
WHERE instance_id = (SELECT id FROM job_instances WHERE job_name = ? AND job_key = ?)
ORDER BY create_time_ms DESC, id DESC
LIMIT 1
"#
        ))
        .bind(job_name)
        .bind(params.identifying_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(r) => {
                let mut job = row_to_job_execution(&r)?;
                self.load_steps(&mut job).await?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn find_running_job_executions(&self, job_name: &str) -> BatchResult<Vec<JobExecution>> {
        let rows = sqlx::query(&format!(
            r#"
SELECT {JOB_COLUMNS} FROM job_executions
WHERE job_name = ? AND end_time_ms IS NULL AND status IN ('STARTING', 'STARTED', 'STOPPING')
ORDER BY id
"#
        ))
        .bind(job_name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        self.jobs_with_steps(rows).await
    }

    async fn get_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_execution_id: StepExecutionId,
    ) -> BatchResult<Option<StepExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_executions WHERE id = ? AND job_execution_id = ?"
        ))
        .bind(step_execution_id)
        .bind(job_execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_step_execution).transpose()
    }

    async fn get_job_executions(&self, instance: &JobInstance) -> BatchResult<Vec<JobExecution>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job_executions WHERE instance_id = ? ORDER BY create_time_ms DESC, id DESC"
        ))
        .bind(instance.id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        self.jobs_with_steps(rows).await
    }

    async fn find_job_instances(
        &self,
        job_name: &str,
        start: usize,
        count: usize,
    ) -> BatchResult<Vec<JobInstance>> {
        let rows = sqlx::query(
            "SELECT id, job_name FROM job_instances WHERE job_name = ? ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(job_name)
        .bind(count as i64)
        .bind(start as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| {
                Ok(JobInstance {
                    id: r.try_get("id").map_err(db_err)?,
                    job_name: r.try_get("job_name").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn job_names(&self) -> BatchResult<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT job_name FROM job_instances ORDER BY job_name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("job_name").map_err(db_err))
            .collect()
    }

    async fn find_step_executions(
        &self,
        step_name: &str,
        count: usize,
    ) -> BatchResult<Vec<StepExecution>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_executions WHERE step_name = ? ORDER BY start_time_ms DESC, id DESC LIMIT ?"
        ))
        .bind(step_name)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_step_execution).collect()
    }
}

fn row_to_job_execution(r: &SqliteRow) -> BatchResult<JobExecution> {
    let parameters_json: String = r.try_get("parameters_json").map_err(db_err)?;
    let parameters: JobParameters = serde_json::from_str(&parameters_json)?;

    Ok(JobExecution {
        id: r.try_get("id").map_err(db_err)?,
        instance_id: r.try_get("instance_id").map_err(db_err)?,
        job_name: r.try_get("job_name").map_err(db_err)?,
        status: parse_status(&r.try_get::<String, _>("status").map_err(db_err)?)?,
        exit_status: ExitStatus {
            exit_code: r.try_get("exit_code").map_err(db_err)?,
            exit_description: r.try_get("exit_description").map_err(db_err)?,
        },
        create_time: from_ms(r.try_get("create_time_ms").map_err(db_err)?)?,
        start_time: from_opt_ms(r.try_get("start_time_ms").map_err(db_err)?)?,
        end_time: from_opt_ms(r.try_get("end_time_ms").map_err(db_err)?)?,
        last_updated: from_opt_ms(r.try_get("last_updated_ms").map_err(db_err)?)?,
        parameters,
        version: r.try_get::<i64, _>("version").map_err(db_err)? as u64,
        step_executions: Vec::new(),
    })
}

fn row_to_step_execution(r: &SqliteRow) -> BatchResult<StepExecution> {
    let count = |col: &str| -> BatchResult<u64> {
        Ok(r.try_get::<i64, _>(col).map_err(db_err)?.max(0) as u64)
    };

    let context_json: String = r.try_get("context_json").map_err(db_err)?;
    let failures_json: String = r.try_get("failures_json").map_err(db_err)?;

    Ok(StepExecution {
        id: r.try_get("id").map_err(db_err)?,
        job_execution_id: r.try_get("job_execution_id").map_err(db_err)?,
        step_name: r.try_get("step_name").map_err(db_err)?,
        status: parse_status(&r.try_get::<String, _>("status").map_err(db_err)?)?,
        exit_status: ExitStatus {
            exit_code: r.try_get("exit_code").map_err(db_err)?,
            exit_description: r.try_get("exit_description").map_err(db_err)?,
        },
        read_count: count("read_count")?,
        write_count: count("write_count")?,
        commit_count: count("commit_count")?,
        rollback_count: count("rollback_count")?,
        filter_count: count("filter_count")?,
        read_skip_count: count("read_skip_count")?,
        write_skip_count: count("write_skip_count")?,
        process_skip_count: count("process_skip_count")?,
        start_time: from_ms(r.try_get("start_time_ms").map_err(db_err)?)?,
        end_time: from_opt_ms(r.try_get("end_time_ms").map_err(db_err)?)?,
        last_updated: from_opt_ms(r.try_get("last_updated_ms").map_err(db_err)?)?,
        execution_context: serde_json::from_str(&context_json)?,
        terminate_only: r.try_get("terminate_only").map_err(db_err)?,
        failure_exceptions: serde_json::from_str(&failures_json)?,
        version: count("version")?,
    })
}
