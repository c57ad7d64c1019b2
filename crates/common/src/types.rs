use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one message.
///
/// `queued → delivering → {delivered | undeliverable}`, with a bounded
/// `delivering → failed → delivering` retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Delivering,
    Delivered,
    Failed,
    Undeliverable,
}

impl MessageStatus {
    /// Terminal statuses are never processed again and are eligible for GC.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::Undeliverable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Delivering => "delivering",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
            MessageStatus::Undeliverable => "undeliverable",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable status record for one (request, recipient) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One addressable target of a notification.
///
/// User recipients carry only a GUID; their address is looked up at delivery
/// time so that enqueueing never waits on the directory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Recipient {
    pub guid: Option<String>,
    pub email: Option<String>,
}

impl Recipient {
    pub fn user(guid: impl Into<String>) -> Self {
        Self {
            guid: Some(guid.into()),
            email: None,
        }
    }

    pub fn email(address: impl Into<String>) -> Self {
        Self {
            guid: None,
            email: Some(address.into()),
        }
    }

    /// Identifier reported back to the caller: the email when known, else the GUID.
    pub fn display(&self) -> String {
        self.email
            .clone()
            .or_else(|| self.guid.clone())
            .unwrap_or_default()
    }
}

/// Content request shared by every recipient of one notification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotificationOptions {
    pub kind_id: String,
    #[serde(default)]
    pub kind_description: String,
    #[serde(default)]
    pub source_description: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub reply_to: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub endorsement: String,
    #[serde(default)]
    pub template_id: String,
}

/// Organization roles that narrow an organization notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrgRole {
    OrgManager,
    OrgAuditor,
    BillingManager,
}

impl OrgRole {
    /// Human-readable name with its indefinite article, for endorsements.
    pub fn with_article(self) -> &'static str {
        match self {
            OrgRole::OrgManager => "an Org Manager",
            OrgRole::OrgAuditor => "an Org Auditor",
            OrgRole::BillingManager => "a Billing Manager",
        }
    }
}

impl std::fmt::Display for OrgRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OrgRole::OrgManager => "Org Manager",
            OrgRole::OrgAuditor => "Org Auditor",
            OrgRole::BillingManager => "Billing Manager",
        })
    }
}

impl std::str::FromStr for OrgRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OrgManager" => Ok(OrgRole::OrgManager),
            "OrgAuditor" => Ok(OrgRole::OrgAuditor),
            "BillingManager" => Ok(OrgRole::BillingManager),
            other => Err(format!(
                "Invalid role '{}'. Valid roles: OrgManager, OrgAuditor, BillingManager",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Space {
    pub guid: String,
    pub name: String,
    pub organization_guid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Organization {
    pub guid: String,
    pub name: String,
}

/// Per-recipient job payload, serialized into `jobs.payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub message_id: String,
    pub options: NotificationOptions,
    pub user_guid: Option<String>,
    pub email: Option<String>,
    pub space: Space,
    pub organization: Organization,
    pub client_id: String,
    pub scope: String,
    pub correlation_id: String,
    pub request_received: DateTime<Utc>,
}

/// Synchronous answer for one recipient of an accepted notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: MessageStatus,
    pub recipient: String,
    #[serde(rename = "notification_id")]
    pub message_id: String,
    #[serde(rename = "vcap_request_id")]
    pub correlation_id: String,
}
