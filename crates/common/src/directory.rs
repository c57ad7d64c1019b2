//! Directory capability: who the users are and how to reach them.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{OrgRole, Organization, Space};

#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The identity or resource no longer exists. Never worth retrying.
    #[error("{0} not found")]
    NotFound(String),

    /// Network failure, timeout or an unexpected upstream response.
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Identity and membership lookups used by the strategies (at enqueue time)
/// and by the delivery workers (email resolution at send time).
///
/// Membership listings may repeat a GUID when a user holds several roles;
/// callers de-duplicate.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn resolve_email(&self, user_guid: &str) -> Result<String, DirectoryError>;

    async fn space(&self, space_guid: &str) -> Result<Space, DirectoryError>;

    async fn organization(&self, org_guid: &str) -> Result<Organization, DirectoryError>;

    async fn space_members(&self, space_guid: &str) -> Result<Vec<String>, DirectoryError>;

    async fn organization_members(
        &self,
        org_guid: &str,
        role: Option<OrgRole>,
    ) -> Result<Vec<String>, DirectoryError>;

    async fn users_with_scope(&self, scope: &str) -> Result<Vec<String>, DirectoryError>;

    async fn all_users(&self) -> Result<Vec<String>, DirectoryError>;
}
