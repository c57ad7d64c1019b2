use std::time::Duration;

use serde::Deserialize;

/// Which background duties (message GC, queue gauge) this instance performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundRole {
    /// Compete for a Redis lease on every tick.
    Elect,
    /// Always run background duties.
    Leader,
    /// Never run background duties.
    Follower,
}

impl std::str::FromStr for BackgroundRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "elect" => Ok(Self::Elect),
            "leader" => Ok(Self::Leader),
            "follower" => Ok(Self::Follower),
            other => Err(anyhow::anyhow!(
                "BACKGROUND_ROLE must be one of elect, leader, follower (got '{}')",
                other
            )),
        }
    }
}

/// Global application configuration loaded from environment variables.
///
/// Built once at boot and handed to every component that needs it; nothing
/// reads configuration from a mutable global afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string, used for background leader election
    pub redis_url: String,

    /// HTTP listen port (default: 3000)
    pub port: u16,

    /// Number of delivery workers started by this instance (default: 10)
    pub worker_count: usize,

    /// Delivery attempts before a transient failure becomes terminal (default: 10)
    pub max_delivery_attempts: u32,

    /// First retry delay in seconds, doubled per attempt (default: 60)
    pub retry_base_delay_secs: u64,

    /// Upper bound on the retry delay in seconds (default: 3600)
    pub retry_max_delay_secs: u64,

    /// How long a reserved job stays leased to its worker (default: 300)
    pub job_lease_secs: u64,

    /// How often idle workers poll the queue, in milliseconds (default: 250)
    pub queue_poll_interval_ms: u64,

    /// Age after which terminal messages are garbage collected (default: 24)
    pub message_retention_hours: u64,

    /// Message GC tick interval in seconds (default: 3600)
    pub message_gc_interval_secs: u64,

    /// Queue gauge tick interval in seconds (default: 1)
    pub queue_gauge_interval_secs: u64,

    /// Background duty role for this instance (default: elect)
    pub background_role: BackgroundRole,

    /// Hex-encoded 32-byte key used to mask message bodies at rest
    pub encryption_key: String,

    /// From address on outbound mail
    pub sender: String,

    /// Domain used in generated Message-ID headers
    pub domain: String,

    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_pass: Option<String>,
    /// Require STARTTLS on the SMTP connection (default: true)
    pub smtp_tls: bool,

    /// UAA base URL
    pub uaa_host: String,
    pub uaa_client_id: String,
    pub uaa_client_secret: String,
    /// PEM-encoded UAA token signing key; fetched from UAA at boot when unset
    pub uaa_public_key: Option<String>,

    /// Cloud Controller base URL
    pub cc_host: String,

    /// Verify TLS certificates on directory calls (default: true)
    pub verify_ssl: bool,

    /// Optional JSON file with per-kind templates
    pub templates_path: Option<String>,

    /// Skip the SMTP connectivity check at boot
    pub test_mode: bool,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: required("DATABASE_URL")?,
            db_max_connections: parsed("DB_MAX_CONNECTIONS", "20")?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            port: parsed("PORT", "3000")?,
            worker_count: parsed("WORKER_COUNT", "10")?,
            max_delivery_attempts: parsed("MAX_DELIVERY_ATTEMPTS", "10")?,
            retry_base_delay_secs: parsed("RETRY_BASE_DELAY_SECS", "60")?,
            retry_max_delay_secs: parsed("RETRY_MAX_DELAY_SECS", "3600")?,
            job_lease_secs: parsed("JOB_LEASE_SECS", "300")?,
            queue_poll_interval_ms: parsed("QUEUE_POLL_INTERVAL_MS", "250")?,
            message_retention_hours: parsed("MESSAGE_RETENTION_HOURS", "24")?,
            message_gc_interval_secs: parsed("MESSAGE_GC_INTERVAL_SECS", "3600")?,
            queue_gauge_interval_secs: parsed("QUEUE_GAUGE_INTERVAL_SECS", "1")?,
            background_role: parsed("BACKGROUND_ROLE", "elect")?,
            encryption_key: required("ENCRYPTION_KEY")?,
            sender: required("SENDER")?,
            domain: std::env::var("DOMAIN").unwrap_or_else(|_| "localhost".to_string()),
            smtp_host: required("SMTP_HOST")?,
            smtp_port: parsed("SMTP_PORT", "587")?,
            smtp_user: std::env::var("SMTP_USER").ok(),
            smtp_pass: std::env::var("SMTP_PASS").ok(),
            smtp_tls: parsed("SMTP_TLS", "true")?,
            uaa_host: required("UAA_HOST")?,
            uaa_client_id: required("UAA_CLIENT_ID")?,
            uaa_client_secret: required("UAA_CLIENT_SECRET")?,
            uaa_public_key: std::env::var("UAA_PUBLIC_KEY").ok(),
            cc_host: required("CC_HOST")?,
            verify_ssl: parsed("VERIFY_SSL", "true")?,
            templates_path: std::env::var("TEMPLATES_PATH").ok(),
            test_mode: parsed("TEST_MODE", "false")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the background tasks and the worker pool cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (key, value) in [
            ("WORKER_COUNT", self.worker_count as u64),
            ("MAX_DELIVERY_ATTEMPTS", u64::from(self.max_delivery_attempts)),
            ("JOB_LEASE_SECS", self.job_lease_secs),
            ("QUEUE_POLL_INTERVAL_MS", self.queue_poll_interval_ms),
            ("MESSAGE_GC_INTERVAL_SECS", self.message_gc_interval_secs),
            ("QUEUE_GAUGE_INTERVAL_SECS", self.queue_gauge_interval_secs),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", key);
            }
        }

        if self.message_retention_hours.checked_mul(3600).is_none() {
            anyhow::bail!("MESSAGE_RETENTION_HOURS is too large");
        }
        if self.retry_base_delay_secs > self.retry_max_delay_secs {
            anyhow::bail!("RETRY_BASE_DELAY_SECS must not exceed RETRY_MAX_DELAY_SECS");
        }
        Ok(())
    }

    pub fn job_lease(&self) -> Duration {
        Duration::from_secs(self.job_lease_secs)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn message_retention(&self) -> Duration {
        Duration::from_secs(self.message_retention_hours.saturating_mul(3600))
    }

    pub fn message_gc_interval(&self) -> Duration {
        Duration::from_secs(self.message_gc_interval_secs)
    }

    pub fn queue_gauge_interval(&self) -> Duration {
        Duration::from_secs(self.queue_gauge_interval_secs)
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

fn parsed<T: std::str::FromStr>(key: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| anyhow::anyhow!("{} has an invalid value", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_role_parses_case_insensitively() {
        assert_eq!("Leader".parse::<BackgroundRole>().unwrap(), BackgroundRole::Leader);
        assert_eq!("elect".parse::<BackgroundRole>().unwrap(), BackgroundRole::Elect);
        assert_eq!("FOLLOWER".parse::<BackgroundRole>().unwrap(), BackgroundRole::Follower);
    }

    fn config() -> AppConfig {
        AppConfig {
            database_url: "postgres://localhost/courier".into(),
            db_max_connections: 20,
            redis_url: "redis://localhost:6379".into(),
            port: 3000,
            worker_count: 10,
            max_delivery_attempts: 10,
            retry_base_delay_secs: 60,
            retry_max_delay_secs: 3600,
            job_lease_secs: 300,
            queue_poll_interval_ms: 250,
            message_retention_hours: 24,
            message_gc_interval_secs: 3600,
            queue_gauge_interval_secs: 1,
            background_role: BackgroundRole::Elect,
            encryption_key: "00".repeat(32),
            sender: "no-reply@example.com".into(),
            domain: "example.com".into(),
            smtp_host: "localhost".into(),
            smtp_port: 587,
            smtp_user: None,
            smtp_pass: None,
            smtp_tls: true,
            uaa_host: "https://uaa.example.com".into(),
            uaa_client_id: "courier".into(),
            uaa_client_secret: "secret".into(),
            uaa_public_key: None,
            cc_host: "https://api.example.com".into(),
            verify_ssl: true,
            templates_path: None,
            test_mode: false,
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut gc = config();
        gc.message_gc_interval_secs = 0;
        let err = gc.validate().unwrap_err().to_string();
        assert!(err.contains("MESSAGE_GC_INTERVAL_SECS"));

        let mut gauge = config();
        gauge.queue_gauge_interval_secs = 0;
        assert!(gauge.validate().is_err());

        let mut workers = config();
        workers.worker_count = 0;
        let err = workers.validate().unwrap_err().to_string();
        assert!(err.contains("WORKER_COUNT"));
    }

    #[test]
    fn test_oversized_retention_rejected() {
        let mut config = config();
        config.message_retention_hours = u64::MAX;
        assert!(config.validate().is_err());
        assert_eq!(config.message_retention(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_retry_delays_must_be_ordered() {
        let mut config = config();
        config.retry_base_delay_secs = 7200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_background_role_rejects_unknown() {
        assert!("primary".parse::<BackgroundRole>().is_err());
    }
}
