//! Courier binary entrypoint: HTTP API, delivery workers and background
//! duties in one process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use courier_common::cipher::{AesGcmCipher, Cipher};
use courier_common::config::{AppConfig, BackgroundRole};
use courier_common::db;
use courier_common::directory::Directory;
use courier_directory::{CloudDirectory, DirectoryConfig};
use courier_engine::election::{FixedRole, LeaderElection, RedisLeaderLock};
use courier_engine::enqueuer::Enqueuer;
use courier_engine::gc::MessageGc;
use courier_engine::ids::UuidGenerator;
use courier_engine::messages::{MessageRepository, PgMessageRepository};
use courier_engine::preferences::{PgPreferences, Preferences};
use courier_engine::store::PgStore;
use courier_engine::strategies::Strategies;
use courier_notifier::{
    DeliveryServices, QueueGauge, SmtpConfig, SmtpMailer, StorageRetry, Templates, WorkerPool,
};
use courier_queue::{JobFeed, JobQueue, PgJobQueue, RetryPolicy, Wakeup};

use courier_api::middleware::auth::Authenticator;
use courier_api::routes::create_router;
use courier_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "courier_api=info,courier_engine=info,courier_notifier=info,courier_queue=info,tower_http=info",
            )
        }))
        .init();

    tracing::info!("Starting Courier...");

    let config = AppConfig::from_env()?;
    let instance_id = Uuid::new_v4().to_string();

    let pool = db::connect(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    let election: Arc<dyn LeaderElection> = match config.background_role {
        BackgroundRole::Elect => {
            Arc::new(RedisLeaderLock::connect(&config.redis_url, instance_id.clone()).await?)
        }
        BackgroundRole::Leader => Arc::new(FixedRole::leader()),
        BackgroundRole::Follower => Arc::new(FixedRole::follower()),
    };
    tracing::info!(role = ?config.background_role, "Background role configured");

    let mailer = SmtpMailer::new(&SmtpConfig {
        host: config.smtp_host.clone(),
        port: config.smtp_port,
        user: config.smtp_user.clone(),
        pass: config.smtp_pass.clone(),
        tls: config.smtp_tls,
        sender: config.sender.clone(),
        domain: config.domain.clone(),
    })?;
    if config.test_mode {
        tracing::warn!("TEST_MODE set; skipping SMTP connection check");
    } else {
        mailer.verify().await?;
    }

    let templates = match &config.templates_path {
        Some(path) => Templates::load(path)?,
        None => Templates::default(),
    };

    let cipher: Arc<dyn Cipher> = Arc::new(AesGcmCipher::from_hex(&config.encryption_key)?);
    let cloud = CloudDirectory::new(DirectoryConfig {
        uaa_host: config.uaa_host.clone(),
        cc_host: config.cc_host.clone(),
        client_id: config.uaa_client_id.clone(),
        client_secret: config.uaa_client_secret.clone(),
        verify_ssl: config.verify_ssl,
    })?;
    let uaa_public_key = match &config.uaa_public_key {
        Some(key) => key.clone(),
        None => {
            let key = cloud
                .token_key()
                .await
                .map_err(|e| anyhow::anyhow!("failed to fetch UAA token key: {}", e))?;
            tracing::info!(uaa_host = %config.uaa_host, "Fetched UAA token key");
            key
        }
    };
    let authenticator = Authenticator::from_rsa_pem(&uaa_public_key)?;
    let directory: Arc<dyn Directory> = Arc::new(cloud);

    let wakeup = Wakeup::new();
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool.clone(), config.job_lease()));
    let messages: Arc<dyn MessageRepository> = Arc::new(PgMessageRepository::new(pool.clone()));
    let preferences: Arc<dyn Preferences> = Arc::new(PgPreferences::new(pool.clone()));

    // Delivery workers
    let services = DeliveryServices {
        feed: JobFeed::new(queue.clone(), wakeup.clone(), config.queue_poll_interval()),
        messages: messages.clone(),
        directory: directory.clone(),
        preferences: preferences.clone(),
        renderer: Arc::new(templates),
        mailer: Arc::new(mailer),
        cipher: cipher.clone(),
        policy: RetryPolicy {
            max_attempts: config.max_delivery_attempts,
            base_delay: Duration::from_secs(config.retry_base_delay_secs),
            max_delay: Duration::from_secs(config.retry_max_delay_secs),
        },
        storage_retry: StorageRetry::default(),
    };
    let mut workers = WorkerPool::start(config.worker_count, &instance_id, services);

    // Background duties
    let mut gc = MessageGc::new(
        messages.clone(),
        election.clone(),
        config.message_retention(),
        config.message_gc_interval(),
    )
    .spawn();
    let mut gauge = QueueGauge::new(queue.clone(), election, config.queue_gauge_interval()).spawn();

    // HTTP API
    let enqueuer = Enqueuer::new(
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(UuidGenerator),
        cipher,
        wakeup,
    );
    let state = AppState::new(
        Strategies::new(directory, enqueuer),
        messages,
        preferences,
        authenticator,
    );
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
            tracing::info!("API server stopped");
        }
        result = workers.wait() => {
            result?;
            anyhow::bail!("delivery worker exited unexpectedly");
        }
        result = &mut gc => {
            result?;
            anyhow::bail!("message GC exited unexpectedly");
        }
        result = &mut gauge => {
            result?;
            anyhow::bail!("queue gauge exited unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    gc.abort();
    gauge.abort();
    workers.shutdown().await;
    Ok(())
}
