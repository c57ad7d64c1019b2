//! UAA bearer-token authentication.
//!
//! Tokens are RS256 JWTs issued by UAA. The verifying key is the UAA public
//! key from configuration, fixed for the life of the process. The `Client`
//! extractor validates the `Authorization` header and exposes the caller's
//! client id and scopes; handlers check the scope they need.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use courier_common::error::AppError;

use crate::state::AppState;

/// Claims we read from a UAA token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub iss: String,
    pub exp: i64,
}

/// Verifies UAA tokens against a fixed public key.
pub struct Authenticator {
    key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    pub fn from_rsa_pem(pem: &str) -> Result<Self, AppError> {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AppError::Config(format!("Invalid UAA_PUBLIC_KEY: {}", e)))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;

        Ok(Self { key, validation })
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AppError> {
        let token_data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

        Ok(token_data.claims)
    }
}

/// Authenticated API client.
#[derive(Debug, Clone)]
pub struct Client {
    pub client_id: String,
    pub scopes: Vec<String>,
}

impl Client {
    pub fn require(&self, scope: &str) -> Result<(), AppError> {
        if self.scopes.iter().any(|s| s == scope) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "You are not authorized to perform the requested action: missing scope {}",
                scope
            )))
        }
    }
}

impl FromRequestParts<AppState> for Client {
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let authenticator = state.authenticator.clone();
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        async move {
            let Some(token) = auth_header
                .as_deref()
                .and_then(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("bearer ")))
            else {
                return Err(AppError::Auth(
                    "Missing or invalid Authorization header. Use 'Bearer <token>'".to_string(),
                ));
            };

            let claims = authenticator.verify(token)?;
            Ok(Client {
                client_id: claims.client_id,
                scopes: claims.scope,
            })
        }
    }
}
