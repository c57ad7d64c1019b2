//! Delivery worker — the per-job delivery procedure.
//!
//! For each reserved job:
//! 1. Decode the delivery payload (malformed → undeliverable, job dropped)
//! 2. Mark the message `delivering`
//! 3. For user recipients, check the unsubscribe preferences; a user who
//!    opted out of a non-critical kind is not mailed (→ `undeliverable`)
//! 4. Resolve the recipient address through the directory if needed
//! 5. Unmask the bodies, render the kind's template, compose and send
//! 6. Record the outcome and resolve the job
//!
//! Outcomes: success → `delivered`, job deleted. Transient failure → `failed`,
//! job rescheduled with backoff until the attempt budget runs out, then
//! `undeliverable`. Permanent failure → `undeliverable`, job deleted.
//!
//! Status writes only land while this worker still holds the job's lease. A
//! worker that finds its lease gone abandons the job without touching the
//! message or the job again; the current holder owns both.
//!
//! Storage writes are retried a few times; if storage stays unreachable the
//! worker stops with [`WorkerError::Storage`] rather than carry on without
//! being able to record outcomes.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use courier_common::cipher::{Cipher, CipherError};
use courier_common::directory::{Directory, DirectoryError};
use courier_common::types::{Delivery, MessageStatus, NotificationOptions};
use courier_engine::messages::MessageRepository;
use courier_engine::preferences::Preferences;
use courier_queue::{Job, JobFeed, RetryPolicy};

use crate::mailer::{Mailer, OutboundMail, SendError};
use crate::templates::{RenderContext, TemplateRenderer};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("storage unavailable while {action} for message {message_id}: {reason}")]
    Storage {
        action: &'static str,
        message_id: String,
        reason: String,
    },
}

/// How hard to push a storage write before giving up.
#[derive(Debug, Clone, Copy)]
pub struct StorageRetry {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for StorageRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// How a job ended up after one processing round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Delivered,
    Retried { delay: Duration },
    Undeliverable,
    /// The user opted out of this kind; nothing was sent.
    Unsubscribed,
    /// The lease passed to another worker; nothing was recorded.
    Abandoned,
}

/// Result of one delivery attempt, before it is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Unsubscribed,
    Transient(String),
    Permanent(String),
}

/// Everything a worker needs, shared by the whole pool.
#[derive(Clone)]
pub struct DeliveryServices {
    pub feed: JobFeed,
    pub messages: Arc<dyn MessageRepository>,
    pub directory: Arc<dyn Directory>,
    pub preferences: Arc<dyn Preferences>,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub mailer: Arc<dyn Mailer>,
    pub cipher: Arc<dyn Cipher>,
    pub policy: RetryPolicy,
    pub storage_retry: StorageRetry,
}

pub struct DeliveryWorker {
    id: String,
    services: DeliveryServices,
}

impl DeliveryWorker {
    pub fn new(id: impl Into<String>, services: DeliveryServices) -> Self {
        Self {
            id: id.into(),
            services,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reserve and process jobs forever. Only returns on a storage failure
    /// the worker cannot recover from.
    pub async fn run(self) -> Result<(), WorkerError> {
        tracing::info!(worker_id = %self.id, "Delivery worker started");

        loop {
            let job = match self.services.feed.next(&self.id).await {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(worker_id = %self.id, error = %e, "Failed to reserve a job");
                    tokio::time::sleep(self.services.storage_retry.base_delay).await;
                    continue;
                }
            };

            self.process(job).await?;
        }
    }

    /// Run the delivery procedure for one reserved job and resolve it.
    pub async fn process(&self, job: Job) -> Result<Resolution, WorkerError> {
        let delivery: Delivery = match job.decode() {
            Ok(delivery) => delivery,
            Err(e) => {
                tracing::error!(
                    worker_id = %self.id,
                    message_id = %job.message_id,
                    error = %e,
                    "Malformed delivery payload"
                );
                return self
                    .resolve(&job, Outcome::Permanent(format!("malformed payload: {e}")))
                    .await;
            }
        };

        if !self.set_status(&job, MessageStatus::Delivering).await? {
            return Ok(self.abandon(&job));
        }

        let outcome = self.deliver(&delivery).await;
        self.resolve(&job, outcome).await
    }

    async fn deliver(&self, delivery: &Delivery) -> Outcome {
        if let Some(outcome) = self.check_preferences(delivery).await {
            return outcome;
        }

        let email = match self.resolve_email(delivery).await {
            Ok(email) => email,
            Err(outcome) => return outcome,
        };

        let options = match self.unmask(&delivery.options) {
            Ok(options) => options,
            Err(e) => {
                tracing::error!(
                    worker_id = %self.id,
                    message_id = %delivery.message_id,
                    error = %e,
                    "Failed to unmask message body"
                );
                return Outcome::Transient(format!("decrypt: {e}"));
            }
        };

        let context = RenderContext::new(delivery, &options, &email);
        let rendered = match self
            .services
            .renderer
            .render(&options.kind_id, &context)
            .await
        {
            Ok(rendered) => rendered,
            Err(e) => return Outcome::Permanent(format!("render: {e}")),
        };

        let mail = OutboundMail {
            to: email,
            reply_to: Some(options.reply_to.clone()).filter(|r| !r.is_empty()),
            subject: rendered.subject,
            text: rendered.text,
            html: rendered.html,
            message_id: delivery.message_id.clone(),
        };

        match self.services.mailer.send(&mail).await {
            Ok(()) => Outcome::Delivered,
            Err(SendError::Transient(reason)) => Outcome::Transient(reason),
            Err(SendError::Permanent(reason)) => Outcome::Permanent(reason),
        }
    }

    /// `Some` when preferences stop the send, or could not be read.
    async fn check_preferences(&self, delivery: &Delivery) -> Option<Outcome> {
        let guid = delivery.user_guid.as_deref()?;

        match self
            .services
            .preferences
            .allows(guid, &delivery.client_id, &delivery.options.kind_id)
            .await
        {
            Ok(true) => None,
            Ok(false) => Some(Outcome::Unsubscribed),
            Err(e) => Some(Outcome::Transient(format!("preferences lookup: {e}"))),
        }
    }

    async fn resolve_email(&self, delivery: &Delivery) -> Result<String, Outcome> {
        if let Some(email) = delivery.email.as_ref().filter(|e| !e.is_empty()) {
            return Ok(email.clone());
        }

        let Some(guid) = delivery.user_guid.as_deref() else {
            return Err(Outcome::Permanent(
                "recipient has neither an email nor a user guid".to_string(),
            ));
        };

        match self.services.directory.resolve_email(guid).await {
            Ok(email) if email.is_empty() => Err(Outcome::Permanent(format!(
                "user {guid} has no email address"
            ))),
            Ok(email) => Ok(email),
            Err(DirectoryError::NotFound(what)) => {
                Err(Outcome::Permanent(format!("{what} not found")))
            }
            Err(e) => Err(Outcome::Transient(e.to_string())),
        }
    }

    fn unmask(&self, options: &NotificationOptions) -> Result<NotificationOptions, CipherError> {
        let mut plain = options.clone();
        if !options.text.is_empty() {
            plain.text = open(self.services.cipher.as_ref(), &options.text)?;
        }
        if !options.html.is_empty() {
            plain.html = open(self.services.cipher.as_ref(), &options.html)?;
        }
        Ok(plain)
    }

    /// Record the outcome, then delete or reschedule the job. The status
    /// write always happens before the job is touched.
    async fn resolve(&self, job: &Job, outcome: Outcome) -> Result<Resolution, WorkerError> {
        let attempts = job.attempts();

        match outcome {
            Outcome::Delivered => {
                if !self.set_status(job, MessageStatus::Delivered).await? {
                    return Ok(self.abandon(job));
                }
                self.delete(job).await?;

                tracing::info!(
                    worker_id = %self.id,
                    message_id = %job.message_id,
                    attempts = attempts + 1,
                    "Message delivered"
                );
                Ok(Resolution::Delivered)
            }
            Outcome::Unsubscribed => {
                if !self.set_status(job, MessageStatus::Undeliverable).await? {
                    return Ok(self.abandon(job));
                }
                self.delete(job).await?;

                tracing::info!(
                    worker_id = %self.id,
                    message_id = %job.message_id,
                    "Recipient unsubscribed; not sending"
                );
                Ok(Resolution::Unsubscribed)
            }
            Outcome::Transient(reason) if !self.services.policy.is_exhausted(attempts) => {
                let delay = self.services.policy.delay_for(attempts);
                if !self.set_status(job, MessageStatus::Failed).await? {
                    return Ok(self.abandon(job));
                }

                let still_ours = self
                    .persist("rescheduling job", &job.message_id, move || {
                        self.services.feed.queue().retry(job, delay)
                    })
                    .await?;
                if !still_ours {
                    tracing::warn!(message_id = %job.message_id, "Lease lost before retry");
                }

                tracing::warn!(
                    worker_id = %self.id,
                    message_id = %job.message_id,
                    attempts = attempts + 1,
                    retry_in_secs = delay.as_secs(),
                    reason = %reason,
                    "Delivery failed; will retry"
                );
                Ok(Resolution::Retried { delay })
            }
            Outcome::Transient(reason) | Outcome::Permanent(reason) => {
                if !self.set_status(job, MessageStatus::Undeliverable).await? {
                    return Ok(self.abandon(job));
                }
                self.delete(job).await?;

                tracing::warn!(
                    worker_id = %self.id,
                    message_id = %job.message_id,
                    attempts = attempts + 1,
                    reason = %reason,
                    "Message undeliverable"
                );
                Ok(Resolution::Undeliverable)
            }
        }
    }

    /// Write `status` under the job's lease. `false` means the lease is gone.
    async fn set_status(&self, job: &Job, status: MessageStatus) -> Result<bool, WorkerError> {
        let holder = job.locked_by.as_deref().unwrap_or_default();
        let message_id = job.message_id.as_str();

        self.persist("updating message status", message_id, move || {
            self.services.messages.update_status(message_id, status, holder)
        })
        .await
    }

    fn abandon(&self, job: &Job) -> Resolution {
        tracing::warn!(
            worker_id = %self.id,
            message_id = %job.message_id,
            "Lease lost; abandoning job"
        );
        Resolution::Abandoned
    }

    async fn delete(&self, job: &Job) -> Result<(), WorkerError> {
        let still_ours = self
            .persist("deleting job", &job.message_id, move || {
                self.services.feed.queue().delete(job)
            })
            .await?;

        if !still_ours {
            tracing::warn!(message_id = %job.message_id, "Lease lost before delete");
        }
        Ok(())
    }

    /// Retry a storage write with doubling delays; give up after the
    /// configured number of attempts.
    async fn persist<T, E, F, Fut>(
        &self,
        action: &'static str,
        message_id: &str,
        mut op: F,
    ) -> Result<T, WorkerError>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let retry = self.services.storage_retry;
        let mut attempt = 0u32;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < retry.attempts => {
                    let delay = retry.base_delay * 2u32.saturating_pow(attempt);
                    tracing::warn!(
                        worker_id = %self.id,
                        message_id,
                        action,
                        attempt = attempt + 1,
                        error = %e,
                        "Storage write failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        worker_id = %self.id,
                        message_id,
                        action,
                        error = %e,
                        "Storage write failed; giving up"
                    );
                    return Err(WorkerError::Storage {
                        action,
                        message_id: message_id.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

fn open(cipher: &dyn Cipher, sealed: &str) -> Result<String, CipherError> {
    let bytes = cipher.decrypt(sealed)?;
    String::from_utf8(bytes).map_err(|e| CipherError::Open(e.to_string()))
}
