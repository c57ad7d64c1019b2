//! Enqueuer — turns a resolved recipient list into durable work.
//!
//! For one request it:
//! 1. Generates a fresh message id per recipient
//! 2. Builds a `queued` message and a delivery job per recipient
//! 3. Writes every message row *and* every job row in one transaction
//! 4. Wakes idle workers once the transaction has committed
//!
//! Writing the jobs in the same transaction as the messages means a request
//! is either fully recorded or not recorded at all; there is no window in
//! which a committed message is left without a job.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use courier_common::cipher::{Cipher, CipherError};
use courier_common::types::{
    Delivery, MessageStatus, NotificationOptions, Organization, Recipient, Response, Space,
};
use courier_queue::{NewJob, Wakeup};

use crate::ids::{IdError, IdGenerator};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    IdGeneration(#[from] IdError),

    #[error("message id {0} was generated twice")]
    IdCollision(String),

    #[error("failed to mask message body: {0}")]
    Cipher(#[from] CipherError),

    #[error("failed to serialize delivery: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Request-scoped fields copied into every job of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryContext {
    pub space: Space,
    pub organization: Organization,
    pub client_id: String,
    pub scope: String,
}

#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn Store>,
    ids: Arc<dyn IdGenerator>,
    cipher: Arc<dyn Cipher>,
    wakeup: Wakeup,
}

impl Enqueuer {
    pub fn new(
        store: Arc<dyn Store>,
        ids: Arc<dyn IdGenerator>,
        cipher: Arc<dyn Cipher>,
        wakeup: Wakeup,
    ) -> Self {
        Self {
            store,
            ids,
            cipher,
            wakeup,
        }
    }

    /// Record one message and one job per recipient.
    ///
    /// Returns one `queued` response per recipient. An empty list with no
    /// error means the storage transaction failed and nothing was recorded;
    /// callers must treat it as a total failure of the request.
    pub async fn enqueue(
        &self,
        recipients: &[Recipient],
        options: &NotificationOptions,
        context: &DeliveryContext,
        correlation_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Vec<Response>, EnqueueError> {
        if recipients.is_empty() {
            return Ok(Vec::new());
        }

        let masked = self.mask(options)?;

        let mut seen = HashSet::with_capacity(recipients.len());
        let mut jobs = Vec::with_capacity(recipients.len());
        let mut responses = Vec::with_capacity(recipients.len());

        for recipient in recipients {
            let message_id = self.ids.generate()?;
            if !seen.insert(message_id.clone()) {
                return Err(EnqueueError::IdCollision(message_id));
            }

            let delivery = Delivery {
                message_id: message_id.clone(),
                options: masked.clone(),
                user_guid: recipient.guid.clone(),
                email: recipient.email.clone(),
                space: context.space.clone(),
                organization: context.organization.clone(),
                client_id: context.client_id.clone(),
                scope: context.scope.clone(),
                correlation_id: correlation_id.to_string(),
                request_received: received_at,
            };
            jobs.push(NewJob::new(message_id.clone(), &delivery)?);

            responses.push(Response {
                status: MessageStatus::Queued,
                recipient: recipient.display(),
                message_id,
                correlation_id: correlation_id.to_string(),
            });
        }

        if let Err(e) = self.persist(&jobs).await {
            tracing::error!(
                error = %e,
                correlation_id,
                recipients = recipients.len(),
                "Failed to record notification; nothing was queued"
            );
            return Ok(Vec::new());
        }

        self.wakeup.notify();

        tracing::info!(
            correlation_id,
            client_id = %context.client_id,
            kind_id = %options.kind_id,
            recipients = responses.len(),
            "Notification queued"
        );

        Ok(responses)
    }

    async fn persist(&self, jobs: &[NewJob]) -> Result<(), StoreError> {
        let mut tx = self.store.begin().await?;

        for job in jobs {
            let written = match tx.upsert_message(&job.message_id, MessageStatus::Queued).await {
                Ok(()) => tx.insert_job(job).await,
                Err(e) => Err(e),
            };

            if let Err(e) = written {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback failed");
                }
                return Err(e);
            }
        }

        tx.commit().await
    }

    /// Seal the bodies so they are never stored in clear text.
    fn mask(&self, options: &NotificationOptions) -> Result<NotificationOptions, CipherError> {
        let mut masked = options.clone();
        if !options.text.is_empty() {
            masked.text = self.cipher.encrypt(options.text.as_bytes())?;
        }
        if !options.html.is_empty() {
            masked.html = self.cipher.encrypt(options.html.as_bytes())?;
        }
        Ok(masked)
    }
}
