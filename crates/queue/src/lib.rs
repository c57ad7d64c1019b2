//! Durable delivery job queue.
//!
//! Jobs are rows in the `jobs` table keyed by their message id. Workers claim
//! them through an atomic storage-level lease (`FOR UPDATE SKIP LOCKED`), so
//! any number of workers in any number of processes can share one queue
//! without in-memory coordination. A crashed worker's lease simply expires.

pub mod feed;
pub mod job;
pub mod postgres;
pub mod queue;
pub mod retry;

pub use feed::{JobFeed, Wakeup};
pub use job::{Job, NewJob};
pub use postgres::PgJobQueue;
pub use queue::{JobQueue, QueueError};
pub use retry::RetryPolicy;
