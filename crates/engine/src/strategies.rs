//! Recipient resolution strategies.
//!
//! Each [`Target`] variant has its own resolution function. The caller picks
//! the variant; [`Strategies::notify`] only dispatches on it. Every strategy
//! expands the target through the [`Directory`], drops duplicate users and
//! hands the result to the [`Enqueuer`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use courier_common::directory::{Directory, DirectoryError};
use courier_common::types::{NotificationOptions, OrgRole, Recipient, Response};

use crate::enqueuer::{DeliveryContext, EnqueueError, Enqueuer};

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    /// Recipients were resolved but the storage transaction failed, so
    /// nothing was recorded.
    #[error("failed to queue notification for {recipients} recipients")]
    NotQueued { recipients: usize },
}

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    User(String),
    Space(String),
    Organization { guid: String, role: Option<OrgRole> },
    Scope(String),
    Everyone,
    Email(String),
}

/// Caller-supplied fields of one notification request.
#[derive(Debug, Clone)]
pub struct NotifyRequest {
    pub client_id: String,
    pub options: NotificationOptions,
    pub correlation_id: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Strategies {
    directory: Arc<dyn Directory>,
    enqueuer: Enqueuer,
}

impl Strategies {
    pub fn new(directory: Arc<dyn Directory>, enqueuer: Enqueuer) -> Self {
        Self {
            directory,
            enqueuer,
        }
    }

    pub async fn notify(
        &self,
        target: &Target,
        request: NotifyRequest,
    ) -> Result<Vec<Response>, StrategyError> {
        match target {
            Target::User(guid) => self.notify_user(guid, request).await,
            Target::Space(guid) => self.notify_space(guid, request).await,
            Target::Organization { guid, role } => {
                self.notify_organization(guid, *role, request).await
            }
            Target::Scope(scope) => self.notify_scope(scope, request).await,
            Target::Everyone => self.notify_everyone(request).await,
            Target::Email(address) => self.notify_email(address, request).await,
        }
    }

    pub async fn notify_user(
        &self,
        user_guid: &str,
        request: NotifyRequest,
    ) -> Result<Vec<Response>, StrategyError> {
        let recipients = vec![Recipient::user(user_guid)];
        let context = DeliveryContext {
            client_id: request.client_id.clone(),
            ..Default::default()
        };

        self.enqueue(
            &recipients,
            request,
            context,
            "This message was sent directly to you.".to_string(),
        )
        .await
    }

    pub async fn notify_space(
        &self,
        space_guid: &str,
        request: NotifyRequest,
    ) -> Result<Vec<Response>, StrategyError> {
        let space = self.directory.space(space_guid).await?;
        let organization = self.directory.organization(&space.organization_guid).await?;
        let members = self.directory.space_members(space_guid).await?;
        let recipients = unique_users(members);

        tracing::debug!(
            space_guid,
            recipients = recipients.len(),
            "Resolved space members"
        );

        let endorsement = format!(
            "You received this message because you belong to the {} space in the {} organization.",
            space.name, organization.name
        );
        let context = DeliveryContext {
            space,
            organization,
            client_id: request.client_id.clone(),
            scope: String::new(),
        };

        self.enqueue(&recipients, request, context, endorsement).await
    }

    pub async fn notify_organization(
        &self,
        org_guid: &str,
        role: Option<OrgRole>,
        request: NotifyRequest,
    ) -> Result<Vec<Response>, StrategyError> {
        let organization = self.directory.organization(org_guid).await?;
        let members = self.directory.organization_members(org_guid, role).await?;
        let recipients = unique_users(members);

        tracing::debug!(
            org_guid,
            ?role,
            recipients = recipients.len(),
            "Resolved organization members"
        );

        let endorsement = match role {
            Some(role) => format!(
                "You received this message because you are {} in the {} organization.",
                role.with_article(),
                organization.name
            ),
            None => format!(
                "You received this message because you belong to the {} organization.",
                organization.name
            ),
        };
        let context = DeliveryContext {
            organization,
            client_id: request.client_id.clone(),
            ..Default::default()
        };

        self.enqueue(&recipients, request, context, endorsement).await
    }

    pub async fn notify_scope(
        &self,
        scope: &str,
        request: NotifyRequest,
    ) -> Result<Vec<Response>, StrategyError> {
        let members = self.directory.users_with_scope(scope).await?;
        let recipients = unique_users(members);

        let endorsement = format!(
            "You received this message because you have the {} scope.",
            scope
        );
        let context = DeliveryContext {
            client_id: request.client_id.clone(),
            scope: scope.to_string(),
            ..Default::default()
        };

        self.enqueue(&recipients, request, context, endorsement).await
    }

    pub async fn notify_everyone(
        &self,
        request: NotifyRequest,
    ) -> Result<Vec<Response>, StrategyError> {
        let members = self.directory.all_users().await?;
        let recipients = unique_users(members);

        let context = DeliveryContext {
            client_id: request.client_id.clone(),
            ..Default::default()
        };

        self.enqueue(
            &recipients,
            request,
            context,
            "This message was sent to everyone.".to_string(),
        )
        .await
    }

    pub async fn notify_email(
        &self,
        address: &str,
        request: NotifyRequest,
    ) -> Result<Vec<Response>, StrategyError> {
        let recipients = vec![Recipient::email(address)];
        let context = DeliveryContext {
            client_id: request.client_id.clone(),
            ..Default::default()
        };

        self.enqueue(
            &recipients,
            request,
            context,
            "This message was sent directly to your email address.".to_string(),
        )
        .await
    }

    async fn enqueue(
        &self,
        recipients: &[Recipient],
        request: NotifyRequest,
        context: DeliveryContext,
        endorsement: String,
    ) -> Result<Vec<Response>, StrategyError> {
        let mut options = request.options;
        if options.endorsement.is_empty() {
            options.endorsement = endorsement;
        }

        let responses = self
            .enqueuer
            .enqueue(
                recipients,
                &options,
                &context,
                &request.correlation_id,
                request.received_at,
            )
            .await?;

        if responses.is_empty() && !recipients.is_empty() {
            return Err(StrategyError::NotQueued {
                recipients: recipients.len(),
            });
        }
        Ok(responses)
    }
}

/// Drop repeated GUIDs, keeping first-seen order.
fn unique_users(guids: Vec<String>) -> Vec<Recipient> {
    let mut seen = HashSet::with_capacity(guids.len());
    guids
        .into_iter()
        .filter(|guid| seen.insert(guid.clone()))
        .map(Recipient::user)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_users_removes_duplicates_in_order() {
        let recipients = unique_users(vec![
            "user-2".to_string(),
            "user-1".to_string(),
            "user-2".to_string(),
            "user-3".to_string(),
            "user-1".to_string(),
        ]);

        let guids: Vec<_> = recipients
            .iter()
            .map(|r| r.guid.clone().unwrap())
            .collect();
        assert_eq!(guids, vec!["user-2", "user-1", "user-3"]);
    }

    #[test]
    fn test_unique_users_empty() {
        assert!(unique_users(Vec::new()).is_empty());
    }
}
