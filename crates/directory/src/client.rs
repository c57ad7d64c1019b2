use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use courier_common::directory::{Directory, DirectoryError};
use courier_common::types::{OrgRole, Organization, Space};

use crate::models::{
    CcOrganization, CcPage, CcResource, CcSpace, ScimGroup, ScimList, ScimUser, TokenKey,
    TokenResponse,
};

/// Refresh the client token this long before UAA says it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);
const USERS_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub uaa_host: String,
    pub cc_host: String,
    pub client_id: String,
    pub client_secret: String,
    pub verify_ssl: bool,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// [`Directory`] backed by UAA and the Cloud Controller, authenticated with
/// a client-credentials token that is cached between calls.
pub struct CloudDirectory {
    http: Client,
    uaa_host: String,
    cc_host: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl CloudDirectory {
    pub fn new(config: DirectoryConfig) -> Result<Self, DirectoryError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| DirectoryError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            uaa_host: config.uaa_host.trim_end_matches('/').to_string(),
            cc_host: config.cc_host.trim_end_matches('/').to_string(),
            client_id: config.client_id,
            client_secret: config.client_secret,
            token: Mutex::new(None),
        })
    }

    async fn token(&self) -> Result<String, DirectoryError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.expires_at > Instant::now()) {
            return Ok(token.value.clone());
        }

        let response: TokenResponse = self
            .http
            .post(format!("{}/oauth/token", self.uaa_host))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?
            .json()
            .await
            .map_err(unavailable)?;

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        tracing::debug!(expires_in = response.expires_in, "Fetched UAA client token");

        *cached = Some(CachedToken {
            value: response.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(response.access_token)
    }

    /// Fetch the PEM public key UAA signs access tokens with.
    pub async fn token_key(&self) -> Result<String, DirectoryError> {
        let response = self
            .http
            .get(format!("{}/token_key", self.uaa_host))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .send()
            .await
            .map_err(unavailable)?;

        if !response.status().is_success() {
            return Err(DirectoryError::Unavailable(format!(
                "fetching token key returned HTTP {}",
                response.status()
            )));
        }

        let key: TokenKey = response.json().await.map_err(unavailable)?;
        Ok(key.value)
    }

    /// Send an authenticated request and decode the JSON body. `what` names
    /// the resource in `NotFound` errors.
    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T, DirectoryError> {
        let token = self.token().await?;
        let response = request.bearer_auth(token).send().await.map_err(unavailable)?;

        match response.status() {
            status if status.is_success() => response.json().await.map_err(unavailable),
            StatusCode::NOT_FOUND => Err(DirectoryError::NotFound(what.to_string())),
            StatusCode::UNAUTHORIZED => {
                self.token.lock().await.take();
                Err(DirectoryError::Unavailable(format!(
                    "token rejected while fetching {what}"
                )))
            }
            status => Err(DirectoryError::Unavailable(format!(
                "fetching {what} returned HTTP {status}"
            ))),
        }
    }

    /// Follow `next_url` links and collect every resource GUID.
    async fn cc_guids(&self, first: String, what: &str) -> Result<Vec<String>, DirectoryError> {
        let mut guids = Vec::new();
        let mut next = Some(first);

        while let Some(path) = next {
            let page: CcPage = self
                .fetch(self.http.get(format!("{}{}", self.cc_host, path)), what)
                .await?;
            guids.extend(page.resources.into_iter().map(|r| r.metadata.guid));
            next = page.next_url;
        }
        Ok(guids)
    }
}

fn unavailable(e: reqwest::Error) -> DirectoryError {
    DirectoryError::Unavailable(e.to_string())
}

/// Cloud Controller listing for an organization role.
fn organization_members_path(org_guid: &str, role: Option<OrgRole>) -> String {
    let listing = match role {
        None => "users",
        Some(OrgRole::OrgManager) => "managers",
        Some(OrgRole::OrgAuditor) => "auditors",
        Some(OrgRole::BillingManager) => "billing_managers",
    };
    format!("/v2/organizations/{org_guid}/{listing}")
}

#[async_trait]
impl Directory for CloudDirectory {
    async fn resolve_email(&self, user_guid: &str) -> Result<String, DirectoryError> {
        let what = format!("user {user_guid}");
        let users: ScimList<ScimUser> = self
            .fetch(
                self.http
                    .get(format!("{}/Users", self.uaa_host))
                    .query(&[
                        ("filter", format!("id eq \"{user_guid}\"")),
                        ("attributes", "id,emails".to_string()),
                    ]),
                &what,
            )
            .await?;

        let user = users
            .resources
            .into_iter()
            .find(|u| u.id == user_guid)
            .ok_or(DirectoryError::NotFound(what))?;

        Ok(user.email().unwrap_or_default().to_string())
    }

    async fn space(&self, space_guid: &str) -> Result<Space, DirectoryError> {
        let space: CcResource<CcSpace> = self
            .fetch(
                self.http.get(format!("{}/v2/spaces/{space_guid}", self.cc_host)),
                &format!("space {space_guid}"),
            )
            .await?;

        Ok(Space {
            guid: space.metadata.guid,
            name: space.entity.name,
            organization_guid: space.entity.organization_guid,
        })
    }

    async fn organization(&self, org_guid: &str) -> Result<Organization, DirectoryError> {
        let org: CcResource<CcOrganization> = self
            .fetch(
                self.http
                    .get(format!("{}/v2/organizations/{org_guid}", self.cc_host)),
                &format!("organization {org_guid}"),
            )
            .await?;

        Ok(Organization {
            guid: org.metadata.guid,
            name: org.entity.name,
        })
    }

    async fn space_members(&self, space_guid: &str) -> Result<Vec<String>, DirectoryError> {
        self.cc_guids(
            format!("/v2/users?q=space_guid:{space_guid}"),
            &format!("space {space_guid}"),
        )
        .await
    }

    async fn organization_members(
        &self,
        org_guid: &str,
        role: Option<OrgRole>,
    ) -> Result<Vec<String>, DirectoryError> {
        self.cc_guids(
            organization_members_path(org_guid, role),
            &format!("organization {org_guid}"),
        )
        .await
    }

    async fn users_with_scope(&self, scope: &str) -> Result<Vec<String>, DirectoryError> {
        let groups: ScimList<ScimGroup> = self
            .fetch(
                self.http
                    .get(format!("{}/Groups", self.uaa_host))
                    .query(&[("filter", format!("displayName eq \"{scope}\""))]),
                &format!("scope {scope}"),
            )
            .await?;

        Ok(groups
            .resources
            .into_iter()
            .flat_map(|g| g.members)
            .filter(|m| m.kind.is_empty() || m.kind == "USER")
            .map(|m| m.value)
            .collect())
    }

    async fn all_users(&self) -> Result<Vec<String>, DirectoryError> {
        let mut guids = Vec::new();
        let mut start = 1;

        loop {
            let page: ScimList<ScimUser> = self
                .fetch(
                    self.http.get(format!("{}/Users", self.uaa_host)).query(&[
                        ("attributes", "id".to_string()),
                        ("startIndex", start.to_string()),
                        ("count", USERS_PAGE_SIZE.to_string()),
                    ]),
                    "users",
                )
                .await?;

            let fetched = page.resources.len();
            guids.extend(page.resources.into_iter().map(|u| u.id));
            start += fetched;

            if fetched == 0 || guids.len() >= page.total_results {
                break;
            }
        }
        Ok(guids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn directory(server: &MockServer) -> CloudDirectory {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "tok", "expires_in": 3600})),
            )
            .mount(server)
            .await;

        CloudDirectory::new(DirectoryConfig {
            uaa_host: server.uri(),
            cc_host: server.uri(),
            client_id: "notifications".to_string(),
            client_secret: "secret".to_string(),
            verify_ssl: true,
        })
        .unwrap()
    }

    #[test]
    fn test_organization_role_paths() {
        assert_eq!(organization_members_path("o", None), "/v2/organizations/o/users");
        assert_eq!(
            organization_members_path("o", Some(OrgRole::BillingManager)),
            "/v2/organizations/o/billing_managers"
        );
    }

    #[tokio::test]
    async fn test_token_key() {
        let server = MockServer::start().await;
        let directory = directory(&server).await;

        Mock::given(method("GET"))
            .and(path("/token_key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "alg": "SHA256withRSA",
                "value": "-----BEGIN PUBLIC KEY-----\nabc\n-----END PUBLIC KEY-----"
            })))
            .mount(&server)
            .await;

        let key = directory.token_key().await.unwrap();
        assert!(key.starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[tokio::test]
    async fn test_token_key_failure_is_unavailable() {
        let server = MockServer::start().await;
        let directory = directory(&server).await;

        Mock::given(method("GET"))
            .and(path("/token_key"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert!(matches!(
            directory.token_key().await,
            Err(DirectoryError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_email() {
        let server = MockServer::start().await;
        let directory = directory(&server).await;

        Mock::given(method("GET"))
            .and(path("/Users"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resources": [{"id": "user-1", "emails": [{"value": "one@example.com"}]}],
                "totalResults": 1
            })))
            .mount(&server)
            .await;

        assert_eq!(directory.resolve_email("user-1").await.unwrap(), "one@example.com");
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let server = MockServer::start().await;
        let directory = directory(&server).await;

        Mock::given(method("GET"))
            .and(path("/Users"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"resources": [], "totalResults": 0})),
            )
            .mount(&server)
            .await;

        assert!(matches!(
            directory.resolve_email("user-9").await,
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_space_is_not_found_and_errors_are_unavailable() {
        let server = MockServer::start().await;
        let directory = directory(&server).await;

        Mock::given(method("GET"))
            .and(path("/v2/spaces/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/organizations/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        assert!(matches!(
            directory.space("gone").await,
            Err(DirectoryError::NotFound(_))
        ));
        assert!(matches!(
            directory.organization("flaky").await,
            Err(DirectoryError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_space_members_follow_pagination() {
        let server = MockServer::start().await;
        let directory = directory(&server).await;

        Mock::given(method("GET"))
            .and(path("/v2/users"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "next_url": null,
                "resources": [{"metadata": {"guid": "user-3"}, "entity": {}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/users"))
            .and(query_param("q", "space_guid:space-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "next_url": "/v2/users?page=2",
                "resources": [
                    {"metadata": {"guid": "user-1"}, "entity": {}},
                    {"metadata": {"guid": "user-2"}, "entity": {}}
                ]
            })))
            .mount(&server)
            .await;

        let members = directory.space_members("space-1").await.unwrap();
        assert_eq!(members, vec!["user-1", "user-2", "user-3"]);
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "tok", "expires_in": 3600})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/organizations/org-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "metadata": {"guid": "org-1"},
                "entity": {"name": "acme"}
            })))
            .mount(&server)
            .await;

        let directory = CloudDirectory::new(DirectoryConfig {
            uaa_host: server.uri(),
            cc_host: server.uri(),
            client_id: "notifications".to_string(),
            client_secret: "secret".to_string(),
            verify_ssl: true,
        })
        .unwrap();

        for _ in 0..3 {
            assert_eq!(directory.organization("org-1").await.unwrap().name, "acme");
        }
    }
}
