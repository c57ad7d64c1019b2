use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::{Job, NewJob};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Persistent, lease-based work queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert with zero attempts, eligible immediately.
    async fn enqueue(&self, job: NewJob) -> Result<(), QueueError>;

    /// Claim one eligible, unleased job for `worker_id`, or `None` when idle.
    /// Two concurrent callers never receive the same job.
    async fn reserve(&self, worker_id: &str) -> Result<Option<Job>, QueueError>;

    /// Count the attempt, push `active_at` out by `delay` and release the lease.
    /// Returns `false` when the caller no longer holds the lease.
    async fn retry(&self, job: &Job, delay: Duration) -> Result<bool, QueueError>;

    /// Remove the job for good. Returns `false` when the caller no longer
    /// holds the lease.
    async fn delete(&self, job: &Job) -> Result<bool, QueueError>;

    /// Number of jobs in the queue, leased or not.
    async fn len(&self) -> Result<u64, QueueError>;
}
