use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A persisted unit of delivery work for exactly one message.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Job {
    pub message_id: String,
    pub payload: serde_json::Value,
    /// Number of completed attempts that ended in a retry.
    pub attempts: i32,
    /// Earliest time the job may be reserved again.
    pub active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Worker currently holding the lease, if any.
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
}

impl Job {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn attempts(&self) -> u32 {
        u32::try_from(self.attempts).unwrap_or(0)
    }
}

/// A job that has not been written yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub message_id: String,
    pub payload: serde_json::Value,
}

impl NewJob {
    pub fn new<T: Serialize>(message_id: impl Into<String>, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }
}
