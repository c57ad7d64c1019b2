//! Test support for the Courier crates: an in-memory store implementing
//! every storage trait, scriptable fakes, and a [`Harness`] that wires them
//! into a real enqueuer, strategy set and delivery services.

mod fakes;
mod memory;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use courier_common::cipher::Cipher;
use courier_common::types::NotificationOptions;
use courier_engine::enqueuer::Enqueuer;
use courier_engine::ids::IdGenerator;
use courier_engine::strategies::{NotifyRequest, Strategies};
use courier_notifier::{DeliveryServices, DeliveryWorker, Resolution, StorageRetry, Templates};
use courier_queue::{JobFeed, RetryPolicy, Wakeup};

pub use fakes::{
    BrokenCipher, ConstantIds, FailingIds, FakeDirectory, FakeMailer, FakePreferences,
    IncrementingIds, test_cipher,
};
pub use memory::MemoryStore;

/// A fully wired in-memory system.
pub struct Harness {
    pub store: MemoryStore,
    pub directory: FakeDirectory,
    pub preferences: FakePreferences,
    pub mailer: FakeMailer,
    pub cipher: BrokenCipher,
    pub wakeup: Wakeup,
    pub enqueuer: Enqueuer,
    pub strategies: Strategies,
    pub services: DeliveryServices,
}

impl Harness {
    pub fn new(directory: FakeDirectory) -> Self {
        Self::with_ids(directory, Arc::new(IncrementingIds::new()))
    }

    pub fn with_ids(directory: FakeDirectory, ids: Arc<dyn IdGenerator>) -> Self {
        Self::build(directory, ids, Templates::default())
    }

    pub fn with_templates(directory: FakeDirectory, templates: Templates) -> Self {
        Self::build(directory, Arc::new(IncrementingIds::new()), templates)
    }

    fn build(directory: FakeDirectory, ids: Arc<dyn IdGenerator>, templates: Templates) -> Self {
        let store = MemoryStore::default();
        let preferences = FakePreferences::new();
        let mailer = FakeMailer::new();
        let cipher = BrokenCipher::default();
        let wakeup = Wakeup::new();
        let shared_cipher: Arc<dyn Cipher> = Arc::new(cipher.clone());

        let enqueuer = Enqueuer::new(
            Arc::new(store.clone()),
            ids,
            shared_cipher.clone(),
            wakeup.clone(),
        );
        let strategies = Strategies::new(Arc::new(directory.clone()), enqueuer.clone());

        let services = DeliveryServices {
            feed: JobFeed::new(
                Arc::new(store.clone()),
                wakeup.clone(),
                Duration::from_millis(10),
            ),
            messages: Arc::new(store.clone()),
            directory: Arc::new(directory.clone()),
            preferences: Arc::new(preferences.clone()),
            renderer: Arc::new(templates),
            mailer: Arc::new(mailer.clone()),
            cipher: shared_cipher,
            policy: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            storage_retry: StorageRetry {
                attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        };

        Self {
            store,
            directory,
            preferences,
            mailer,
            cipher,
            wakeup,
            enqueuer,
            strategies,
            services,
        }
    }

    pub fn worker(&self, id: &str) -> DeliveryWorker {
        DeliveryWorker::new(id, self.services.clone())
    }

    /// Reserve and process jobs with one worker until the queue is idle.
    pub async fn drain(&self) -> Vec<Resolution> {
        let worker = self.worker("drain-worker");
        let queue = self.services.feed.queue().clone();
        let mut resolutions = Vec::new();

        while let Some(job) = queue.reserve(worker.id()).await.unwrap() {
            resolutions.push(worker.process(job).await.unwrap());
        }
        resolutions
    }
}

pub fn options(kind_id: &str, text: &str) -> NotificationOptions {
    NotificationOptions {
        kind_id: kind_id.to_string(),
        subject: "Maintenance".to_string(),
        text: text.to_string(),
        ..Default::default()
    }
}

pub fn request(options: NotificationOptions) -> NotifyRequest {
    NotifyRequest {
        client_id: "mister-client".to_string(),
        options,
        correlation_id: "req-abc".to_string(),
        received_at: Utc::now(),
    }
}
