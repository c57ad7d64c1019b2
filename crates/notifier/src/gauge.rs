//! Periodic queue-length report, emitted by the elected leader only.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use courier_engine::election::LeaderElection;
use courier_queue::JobQueue;

const DUTY: &str = "queue-gauge";

const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub struct QueueGauge {
    queue: Arc<dyn JobQueue>,
    election: Arc<dyn LeaderElection>,
    interval: Duration,
}

impl QueueGauge {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        election: Arc<dyn LeaderElection>,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            election,
            interval,
        }
    }

    /// Report once if leading. Returns the observed length.
    pub async fn tick(&self) -> Option<u64> {
        if !self.election.acquire(DUTY, self.interval.saturating_mul(2)).await {
            return None;
        }

        match self.queue.len().await {
            Ok(length) => {
                tracing::info!(queue_length = length, "Queue gauge");
                Some(length)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read queue length");
                None
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval.max(MIN_INTERVAL));
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}
