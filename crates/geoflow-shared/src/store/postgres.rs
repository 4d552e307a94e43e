//! # PostgreSQL State Store
//!
//! Production backend for job and task records. Every status transition
//! is a guarded `UPDATE ... WHERE status = <expected>`; the terminal
//! task writes run in a transaction that also takes a row lock on the
//! owning job before counting remaining work, so stage closure for one
//! job is serialized and exactly one completer observes zero.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::errors::StoreError;
use crate::models::{JobRecord, JobStatus, StageResultMap, StageTaskResult, TaskRecord, TaskStatus};

use super::{MarkProcessingOutcome, TaskCounts, TerminalWrite};

/// PostgreSQL-backed state store
#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {e}")))
    }

    pub async fn insert_job_if_absent(
        &self,
        record: &JobRecord,
    ) -> Result<(JobRecord, bool), StoreError> {
        let stage_results = serde_json::to_value(&record.stage_results)?;
        let result = sqlx::query(
            r"INSERT INTO geoflow_jobs
                (job_id, job_type, status, stage, total_stages, parameters,
                 stage_results, result_data, error_message, created_at, updated_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
              ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(&record.job_id)
        .bind(&record.job_type)
        .bind(record.status.as_str())
        .bind(record.stage)
        .bind(record.total_stages)
        .bind(record.parameters.clone())
        .bind(stage_results)
        .bind(record.result_data.clone())
        .bind(&record.error_message)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        let stored = self
            .get_job(&record.job_id)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(record.job_id.clone()))?;
        Ok((stored, inserted))
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM geoflow_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    pub async fn update_job_status(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE geoflow_jobs SET status = $3, updated_at = now()
             WHERE job_id = $1 AND status = $2",
        )
        .bind(job_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_tasks(&self, tasks: &[TaskRecord]) -> Result<u64, StoreError> {
        if tasks.is_empty() {
            return Ok(0);
        }
        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO geoflow_tasks
               (task_id, job_id, stage, task_type, status, parameters,
                result_data, error_message, error_type, retry_count,
                heartbeat, created_at, updated_at) ",
        );
        builder.push_values(tasks, |mut b, task| {
            b.push_bind(&task.task_id)
                .push_bind(&task.job_id)
                .push_bind(task.stage)
                .push_bind(&task.task_type)
                .push_bind(task.status.as_str())
                .push_bind(task.parameters.clone())
                .push_bind(task.result_data.clone())
                .push_bind(&task.error_message)
                .push_bind(&task.error_type)
                .push_bind(task.retry_count)
                .push_bind(task.heartbeat)
                .push_bind(task.created_at)
                .push_bind(task.updated_at);
        });
        builder.push(" ON CONFLICT (task_id) DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM geoflow_tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    pub async fn get_stage_tasks(
        &self,
        job_id: &str,
        stage: i32,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM geoflow_tasks
             WHERE job_id = $1 AND stage = $2
             ORDER BY task_id ASC",
        )
        .bind(job_id)
        .bind(stage)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn mark_task_processing(
        &self,
        task_id: &str,
    ) -> Result<MarkProcessingOutcome, StoreError> {
        let result = sqlx::query(
            "UPDATE geoflow_tasks
             SET status = 'PROCESSING', heartbeat = now(), updated_at = now()
             WHERE task_id = $1 AND status = 'QUEUED'",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(MarkProcessingOutcome::Started);
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM geoflow_tasks WHERE task_id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(match status.as_deref() {
            None => MarkProcessingOutcome::NotFound,
            Some("COMPLETED") | Some("FAILED") => MarkProcessingOutcome::AlreadyTerminal,
            // PROCESSING, or QUEUED again after a reconciler reclaim; the
            // reclaim enqueued a fresh message, so this delivery is stale.
            Some(_) => MarkProcessingOutcome::AlreadyProcessing,
        })
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        result: &Value,
    ) -> Result<TerminalWrite, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "UPDATE geoflow_tasks
             SET status = 'COMPLETED', result_data = $2, updated_at = now()
             WHERE task_id = $1 AND status = 'PROCESSING'
             RETURNING job_id, stage",
        )
        .bind(task_id)
        .bind(result.clone())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(TerminalWrite::Rejected);
        };
        let job_id: String = row.try_get("job_id")?;
        let stage: i32 = row.try_get("stage")?;

        let remaining = Self::remaining_in_stage(&mut tx, &job_id, stage).await?;
        tx.commit().await?;
        Ok(TerminalWrite::Applied { remaining })
    }

    pub async fn fail_task(
        &self,
        task_id: &str,
        error: &str,
        error_type: Option<&str>,
    ) -> Result<TerminalWrite, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "UPDATE geoflow_tasks
             SET status = 'FAILED', error_message = $2, error_type = $3, updated_at = now()
             WHERE task_id = $1 AND status IN ('QUEUED', 'PROCESSING')
             RETURNING job_id, stage",
        )
        .bind(task_id)
        .bind(error)
        .bind(error_type)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(TerminalWrite::Rejected);
        };
        let job_id: String = row.try_get("job_id")?;
        let stage: i32 = row.try_get("stage")?;

        let remaining = Self::remaining_in_stage(&mut tx, &job_id, stage).await?;
        tx.commit().await?;
        Ok(TerminalWrite::Applied { remaining })
    }

    /// Count non-terminal tasks for `(job_id, stage)` under a row lock on
    /// the job, so concurrent completers count one at a time and exactly
    /// one of them observes zero.
    async fn remaining_in_stage(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job_id: &str,
        stage: i32,
    ) -> Result<i64, StoreError> {
        sqlx::query("SELECT 1 FROM geoflow_jobs WHERE job_id = $1 FOR UPDATE")
            .bind(job_id)
            .execute(&mut **tx)
            .await?;

        let remaining: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM geoflow_tasks
             WHERE job_id = $1 AND stage = $2
               AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(job_id)
        .bind(stage)
        .fetch_one(&mut **tx)
        .await?;
        Ok(remaining)
    }

    pub async fn load_stage_task_results(
        &self,
        job_id: &str,
        stage: i32,
    ) -> Result<Vec<StageTaskResult>, StoreError> {
        let rows = sqlx::query(
            "SELECT task_id, status, result_data, error_message, error_type
             FROM geoflow_tasks
             WHERE job_id = $1 AND stage = $2
             ORDER BY task_id ASC",
        )
        .bind(job_id)
        .bind(stage)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let status = parse_task_status(&status)?;
                Ok(StageTaskResult {
                    task_id: row.try_get("task_id")?,
                    status,
                    result: row.try_get("result_data")?,
                    error: row.try_get("error_message")?,
                    error_type: row.try_get("error_type")?,
                })
            })
            .collect()
    }

    pub async fn advance_job_stage(
        &self,
        job_id: &str,
        from_stage: i32,
        to_stage: i32,
        stage_results: &[StageTaskResult],
    ) -> Result<bool, StoreError> {
        let patch = stage_results_patch(from_stage, stage_results)?;
        let result = sqlx::query(
            "UPDATE geoflow_jobs
             SET stage = $3, stage_results = stage_results || $4::jsonb, updated_at = now()
             WHERE job_id = $1 AND stage = $2 AND status = 'PROCESSING'",
        )
        .bind(job_id)
        .bind(from_stage)
        .bind(to_stage)
        .bind(patch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn finalize_job(
        &self,
        job_id: &str,
        status: JobStatus,
        result_data: Option<&Value>,
        error_message: Option<&str>,
        final_stage_results: Option<(i32, &[StageTaskResult])>,
    ) -> Result<bool, StoreError> {
        let patch = match final_stage_results {
            Some((stage, results)) => stage_results_patch(stage, results)?,
            None => Value::Object(Map::new()),
        };
        let result = sqlx::query(
            "UPDATE geoflow_jobs
             SET status = $2, result_data = $3, error_message = $4,
                 stage_results = stage_results || $5::jsonb, updated_at = now()
             WHERE job_id = $1 AND status = 'PROCESSING'",
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(result_data.cloned())
        .bind(error_message)
        .bind(patch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn task_progress(&self, job_id: &str) -> Result<TaskCounts, StoreError> {
        let row = sqlx::query(
            "SELECT count(*) FILTER (WHERE status = 'COMPLETED') AS completed,
                    count(*) FILTER (WHERE status = 'FAILED') AS failed,
                    count(*) AS total
             FROM geoflow_tasks WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(TaskCounts {
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            total: row.try_get("total")?,
        })
    }

    pub async fn find_stale_processing_tasks(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM geoflow_tasks
             WHERE status = 'PROCESSING' AND COALESCE(heartbeat, updated_at) < $1
             ORDER BY updated_at ASC
             LIMIT $2",
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn requeue_task(&self, task_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE geoflow_tasks
             SET status = 'QUEUED', retry_count = retry_count + 1,
                 heartbeat = NULL, updated_at = now()
             WHERE task_id = $1 AND status = 'PROCESSING'",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn find_jobs_by_status_older_than(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM geoflow_jobs
             WHERE status = $1 AND updated_at < $2
             ORDER BY updated_at ASC
             LIMIT $3",
        )
        .bind(status.as_str())
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }
}

fn stage_results_patch(stage: i32, results: &[StageTaskResult]) -> Result<Value, StoreError> {
    let mut patch = Map::new();
    patch.insert(stage.to_string(), serde_json::to_value(results)?);
    Ok(Value::Object(patch))
}

fn parse_job_status(raw: &str) -> Result<JobStatus, StoreError> {
    raw.parse().map_err(StoreError::InvalidRecord)
}

fn parse_task_status(raw: &str) -> Result<TaskStatus, StoreError> {
    raw.parse().map_err(StoreError::InvalidRecord)
}

fn job_from_row(row: &PgRow) -> Result<JobRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let stage_results: Value = row.try_get("stage_results")?;
    let stage_results: StageResultMap = serde_json::from_value(stage_results)?;
    Ok(JobRecord {
        job_id: row.try_get("job_id")?,
        job_type: row.try_get("job_type")?,
        status: parse_job_status(&status)?,
        stage: row.try_get("stage")?,
        total_stages: row.try_get("total_stages")?,
        parameters: row.try_get("parameters")?,
        stage_results,
        result_data: row.try_get("result_data")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<TaskRecord, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(TaskRecord {
        task_id: row.try_get("task_id")?,
        job_id: row.try_get("job_id")?,
        stage: row.try_get("stage")?,
        task_type: row.try_get("task_type")?,
        status: parse_task_status(&status)?,
        parameters: row.try_get("parameters")?,
        result_data: row.try_get("result_data")?,
        error_message: row.try_get("error_message")?,
        error_type: row.try_get("error_type")?,
        retry_count: row.try_get("retry_count")?,
        heartbeat: row.try_get("heartbeat")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
