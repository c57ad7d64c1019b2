//! Message GC — periodic removal of old terminal message records.
//!
//! Only terminal messages (`delivered`, `undeliverable`) untouched for longer
//! than the retention window are removed, and never while a job row still
//! references them. A failed sweep is logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;

use crate::election::LeaderElection;
use crate::messages::MessageRepository;
use crate::store::StoreError;

const DUTY: &str = "message-gc";

/// Shortest period the sweep loop will tick at.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub struct MessageGc {
    messages: Arc<dyn MessageRepository>,
    election: Arc<dyn LeaderElection>,
    retention: Duration,
    interval: Duration,
}

impl MessageGc {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        election: Arc<dyn LeaderElection>,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            messages,
            election,
            retention,
            interval,
        }
    }

    /// Messages last updated before this instant are old enough to collect.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let retention = TimeDelta::from_std(self.retention).unwrap_or(TimeDelta::MAX);
        now.checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Delete expired terminal messages, regardless of leadership.
    pub async fn sweep(&self) -> Result<u64, StoreError> {
        let cutoff = self.cutoff(Utc::now());
        let deleted = self.messages.delete_expired(cutoff).await?;

        tracing::info!(deleted, cutoff = %cutoff, "Message GC sweep finished");
        Ok(deleted)
    }

    /// One scheduled run: sweep if this instance leads the GC duty.
    /// Returns the number of deleted messages, or `None` if skipped or failed.
    pub async fn tick(&self) -> Option<u64> {
        // Lease a little longer than the interval so the holder keeps it.
        if !self.election.acquire(DUTY, self.interval.saturating_mul(2)).await {
            tracing::debug!("Not the GC leader; skipping sweep");
            return None;
        }

        match self.sweep().await {
            Ok(deleted) => Some(deleted),
            Err(e) => {
                tracing::error!(error = %e, "Message GC sweep failed; retrying next tick");
                None
            }
        }
    }

    pub async fn run(self) {
        tracing::info!(
            retention_secs = self.retention.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Message GC started"
        );

        let mut ticker = tokio::time::interval(self.interval.max(MIN_INTERVAL));
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
