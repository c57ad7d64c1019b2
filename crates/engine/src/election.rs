//! Leader election for background duties.
//!
//! Message GC and the queue gauge must run on exactly one instance. Which one
//! is decided explicitly: either a fixed role from configuration, or a
//! per-duty Redis lease (`SET NX PX`) that the holder keeps renewing.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Returns `true` if this instance should perform `duty` for the next `term`.
    async fn acquire(&self, duty: &str, term: Duration) -> bool;
}

/// Role fixed at startup.
#[derive(Debug, Clone, Copy)]
pub struct FixedRole {
    pub leader: bool,
}

impl FixedRole {
    pub fn leader() -> Self {
        Self { leader: true }
    }

    pub fn follower() -> Self {
        Self { leader: false }
    }
}

#[async_trait]
impl LeaderElection for FixedRole {
    async fn acquire(&self, _duty: &str, _term: Duration) -> bool {
        self.leader
    }
}

/// Redis-backed lease per duty.
#[derive(Clone)]
pub struct RedisLeaderLock {
    redis: ConnectionManager,
    instance_id: String,
}

impl RedisLeaderLock {
    pub async fn connect(redis_url: &str, instance_id: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;

        tracing::info!("Connected to Redis");
        Ok(Self {
            redis,
            instance_id: instance_id.into(),
        })
    }

    fn key(duty: &str) -> String {
        format!("courier:leader:{}", duty)
    }

    async fn try_acquire(&self, duty: &str, term: Duration) -> redis::RedisResult<bool> {
        let mut redis = self.redis.clone();
        let key = Self::key(duty);
        let ttl_ms = lease_millis(term);

        // SET key instance NX PX ttl
        // Returns Some("OK") if the lease was free
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&self.instance_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut redis)
            .await?;

        if claimed.is_some() {
            return Ok(true);
        }

        let holder: Option<String> = redis.get(&key).await?;
        if holder.as_deref() == Some(self.instance_id.as_str()) {
            redis.pexpire::<_, ()>(&key, ttl_ms).await?;
            return Ok(true);
        }

        Ok(false)
    }
}

/// Lease length in milliseconds as Redis takes it: at least 1, at most `i64::MAX`.
fn lease_millis(term: Duration) -> i64 {
    i64::try_from(term.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl LeaderElection for RedisLeaderLock {
    async fn acquire(&self, duty: &str, term: Duration) -> bool {
        match self.try_acquire(duty, term).await {
            Ok(leader) => leader,
            Err(e) => {
                tracing::warn!(duty, error = %e, "Leader election failed; skipping this tick");
                false
            }
        }
    }
}
