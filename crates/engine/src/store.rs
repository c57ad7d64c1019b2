//! Transactional writes of message rows together with their jobs.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;

use courier_common::types::MessageStatus;
use courier_queue::NewJob;
use courier_queue::postgres::insert_job;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Opens storage transactions.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// One all-or-nothing unit of work. Dropping it without `commit` discards
/// every write made through it.
#[async_trait]
pub trait StoreTx: Send {
    async fn upsert_message(&mut self, id: &str, status: MessageStatus) -> Result<(), StoreError>;

    async fn insert_job(&mut self, job: &NewJob) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }
}

struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn upsert_message(&mut self, id: &str, status: MessageStatus) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, status, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(status)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_job(&mut self, job: &NewJob) -> Result<(), StoreError> {
        insert_job(&mut *self.tx, job).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
