//! Message status records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use courier_common::types::{Message, MessageStatus};

use crate::store::StoreError;

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn find(&self, id: &str) -> Result<Option<Message>, StoreError>;

    /// Set the status and bump `updated_at`, but only while `holder` owns the
    /// lease on the message's job. Returns `false` if there is no such message
    /// or the lease has passed to another worker (or the job is gone).
    async fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        holder: &str,
    ) -> Result<bool, StoreError>;

    /// Delete terminal messages last touched before `cutoff` that have no job
    /// left. Returns the number of rows removed.
    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn find(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let message: Option<Message> = sqlx::query_as(
            "SELECT id, status, created_at, updated_at FROM messages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }

    async fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        holder: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET status = $1, updated_at = NOW()
            WHERE id = $2
              AND EXISTS (SELECT 1 FROM jobs j WHERE j.message_id = $2 AND j.locked_by = $3)
            "#,
        )
        .bind(status)
        .bind(id)
        .bind(holder)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM messages m
            WHERE m.updated_at < $1
              AND m.status IN ('delivered', 'undeliverable')
              AND NOT EXISTS (SELECT 1 FROM jobs j WHERE j.message_id = m.id)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
