//! Wire shapes of the UAA and Cloud Controller responses we read.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
}

fn default_expires_in() -> u64 {
    600
}

/// `GET /token_key`: the key UAA signs access tokens with.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenKey {
    pub value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ScimList<T> {
    #[serde(default = "Vec::new")]
    pub resources: Vec<T>,
    #[serde(default)]
    pub total_results: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScimUser {
    pub id: String,
    #[serde(default)]
    pub emails: Vec<ScimEmail>,
}

impl ScimUser {
    /// Primary address if flagged, else the first one.
    pub fn email(&self) -> Option<&str> {
        self.emails
            .iter()
            .find(|e| e.primary)
            .or_else(|| self.emails.first())
            .map(|e| e.value.as_str())
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScimEmail {
    pub value: String,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScimGroup {
    #[serde(default)]
    pub members: Vec<ScimMember>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScimMember {
    pub value: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CcResource<E> {
    pub metadata: CcMetadata,
    pub entity: E,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CcMetadata {
    pub guid: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CcSpace {
    pub name: String,
    pub organization_guid: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CcOrganization {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CcPage {
    pub next_url: Option<String>,
    #[serde(default)]
    pub resources: Vec<CcResource<serde::de::IgnoredAny>>,
}
