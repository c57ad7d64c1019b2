use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use crate::job::Job;
use crate::queue::{JobQueue, QueueError};

/// In-process signal raised after new jobs are committed, so idle workers
/// in this process wake without waiting for their next poll.
#[derive(Debug, Clone, Default)]
pub struct Wakeup(Arc<Notify>);

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.0.notify_waiters();
    }

    pub fn notified(&self) -> Notified<'_> {
        self.0.notified()
    }
}

/// Blocking front-end over [`JobQueue::reserve`].
///
/// Jobs enqueued by other processes, or becoming eligible after a backoff,
/// are picked up by the poll; local enqueues short-circuit it via [`Wakeup`].
#[derive(Clone)]
pub struct JobFeed {
    queue: Arc<dyn JobQueue>,
    wakeup: Wakeup,
    poll_interval: Duration,
}

impl JobFeed {
    pub fn new(queue: Arc<dyn JobQueue>, wakeup: Wakeup, poll_interval: Duration) -> Self {
        Self {
            queue,
            wakeup,
            poll_interval,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Wait until a job can be reserved for `worker_id`.
    pub async fn next(&self, worker_id: &str) -> Result<Job, QueueError> {
        loop {
            // Registered before the reserve attempt so a concurrent notify is not lost.
            let notified = self.wakeup.notified();

            if let Some(job) = self.queue.reserve(worker_id).await? {
                return Ok(job);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
