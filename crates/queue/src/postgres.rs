//! Postgres-backed job queue.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgExecutor, PgPool};

use crate::job::{Job, NewJob};
use crate::queue::{JobQueue, QueueError};

const JOB_COLUMNS: &str =
    "message_id, payload, attempts, active_at, created_at, locked_by, locked_until";

/// Insert a job through any executor, so the enqueuer can write it inside the
/// same transaction as the message row it belongs to.
pub async fn insert_job<'e, E>(executor: E, job: &NewJob) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO jobs (message_id, payload, attempts, active_at, created_at)
        VALUES ($1, $2, 0, NOW(), NOW())
        "#,
    )
    .bind(&job.message_id)
    .bind(&job.payload)
    .execute(executor)
    .await?;

    Ok(())
}

/// [`JobQueue`] over the `jobs` table.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    lease: Duration,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, lease: Duration) -> Self {
        Self { pool, lease }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<(), QueueError> {
        insert_job(&self.pool, &job).await?;
        tracing::debug!(message_id = %job.message_id, "Job enqueued");
        Ok(())
    }

    async fn reserve(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        // SKIP LOCKED makes concurrent reservers pick different rows; an
        // expired lease counts as free so crashed workers' jobs come back.
        let job: Option<Job> = sqlx::query_as(&format!(
            r#"
            UPDATE jobs
            SET locked_by = $1,
                locked_until = NOW() + make_interval(secs => $2)
            WHERE message_id = (
                SELECT message_id FROM jobs
                WHERE active_at <= NOW()
                  AND (locked_until IS NULL OR locked_until < NOW())
                ORDER BY active_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(self.lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &job {
            tracing::debug!(
                message_id = %job.message_id,
                worker_id,
                attempts = job.attempts,
                "Job reserved"
            );
        }

        Ok(job)
    }

    async fn retry(&self, job: &Job, delay: Duration) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1,
                active_at = NOW() + make_interval(secs => $3),
                locked_by = NULL,
                locked_until = NULL
            WHERE message_id = $1 AND locked_by IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(&job.message_id)
        .bind(&job.locked_by)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, job: &Job) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE message_id = $1 AND locked_by IS NOT DISTINCT FROM $2",
        )
        .bind(&job.message_id)
        .bind(&job.locked_by)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn len(&self) -> Result<u64, QueueError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}
