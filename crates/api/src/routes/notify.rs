//! Notification endpoints, one per target kind.
//!
//! Every endpoint answers with one `queued` entry per recipient. Bodies are
//! validated here; recipient expansion and enqueueing happen in the engine.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{NotificationOptions, OrgRole, Response};
use courier_engine::strategies::{NotifyRequest, StrategyError, Target};

use crate::middleware::auth::Client;
use crate::state::AppState;

const NOTIFICATION_WRITE: &str = "notification.write";
const EMAILS_WRITE: &str = "emails.write";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users/{guid}", post(notify_user))
        .route("/spaces/{guid}", post(notify_space))
        .route("/organizations/{guid}", post(notify_organization))
        .route("/uaa_scopes/{scope}", post(notify_scope))
        .route("/everyone", post(notify_everyone))
        .route("/emails", post(notify_email))
}

/// Request body shared by every notification endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct NotifyBody {
    #[serde(default)]
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
}

impl NotifyBody {
    fn validate(&self) -> Result<(), AppError> {
        let mut errors = Vec::new();

        if self.kind_id.is_empty() {
            errors.push("\"kind_id\" is a required field");
        } else if !valid_kind_id(&self.kind_id) {
            errors.push("\"kind_id\" is improperly formatted");
        }
        if self.text.is_empty() && self.html.is_empty() {
            errors.push("\"text\" or \"html\" fields must be supplied");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(errors.join(", ")))
        }
    }

    fn into_options(self) -> NotificationOptions {
        NotificationOptions {
            kind_id: self.kind_id,
            kind_description: self.kind_description,
            source_description: self.source_description,
            subject: self.subject,
            text: self.text,
            html: self.html,
            reply_to: self.reply_to,
            to: self.to,
            role: self.role,
            ..Default::default()
        }
    }
}

pub(crate) fn valid_kind_id(kind_id: &str) -> bool {
    kind_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Caller-supplied request id, or a fresh one.
fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get("x-vcap-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn strategy_error(e: StrategyError) -> AppError {
    match e {
        StrategyError::Directory(e) => AppError::Directory(e),
        other => AppError::Internal(other.to_string()),
    }
}

async fn dispatch(
    state: &AppState,
    client: &Client,
    headers: &HeaderMap,
    target: Target,
    body: NotifyBody,
) -> Result<Json<Vec<Response>>, AppError> {
    body.validate()?;

    let request = NotifyRequest {
        client_id: client.client_id.clone(),
        options: body.into_options(),
        correlation_id: correlation_id(headers),
        received_at: Utc::now(),
    };

    let responses = state
        .strategies
        .notify(&target, request)
        .await
        .map_err(strategy_error)?;

    Ok(Json(responses))
}

/// POST /users/:guid — Notify one user.
async fn notify_user(
    State(state): State<AppState>,
    client: Client,
    headers: HeaderMap,
    Path(guid): Path<String>,
    Json(body): Json<NotifyBody>,
) -> Result<Json<Vec<Response>>, AppError> {
    client.require(NOTIFICATION_WRITE)?;
    dispatch(&state, &client, &headers, Target::User(guid), body).await
}

/// POST /spaces/:guid — Notify every member of a space.
async fn notify_space(
    State(state): State<AppState>,
    client: Client,
    headers: HeaderMap,
    Path(guid): Path<String>,
    Json(body): Json<NotifyBody>,
) -> Result<Json<Vec<Response>>, AppError> {
    client.require(NOTIFICATION_WRITE)?;
    dispatch(&state, &client, &headers, Target::Space(guid), body).await
}

/// POST /organizations/:guid — Notify an organization, optionally one role.
async fn notify_organization(
    State(state): State<AppState>,
    client: Client,
    headers: HeaderMap,
    Path(guid): Path<String>,
    Json(body): Json<NotifyBody>,
) -> Result<Json<Vec<Response>>, AppError> {
    client.require(NOTIFICATION_WRITE)?;

    let role = if body.role.is_empty() {
        None
    } else {
        Some(body.role.parse::<OrgRole>().map_err(AppError::Validation)?)
    };

    dispatch(
        &state,
        &client,
        &headers,
        Target::Organization { guid, role },
        body,
    )
    .await
}

/// POST /uaa_scopes/:scope — Notify every user holding a scope.
async fn notify_scope(
    State(state): State<AppState>,
    client: Client,
    headers: HeaderMap,
    Path(scope): Path<String>,
    Json(body): Json<NotifyBody>,
) -> Result<Json<Vec<Response>>, AppError> {
    client.require(NOTIFICATION_WRITE)?;
    dispatch(&state, &client, &headers, Target::Scope(scope), body).await
}

/// POST /everyone — Notify every user.
async fn notify_everyone(
    State(state): State<AppState>,
    client: Client,
    headers: HeaderMap,
    Json(body): Json<NotifyBody>,
) -> Result<Json<Vec<Response>>, AppError> {
    client.require(NOTIFICATION_WRITE)?;
    dispatch(&state, &client, &headers, Target::Everyone, body).await
}

/// POST /emails — Send to a raw address in `to`.
async fn notify_email(
    State(state): State<AppState>,
    client: Client,
    headers: HeaderMap,
    Json(body): Json<NotifyBody>,
) -> Result<Json<Vec<Response>>, AppError> {
    client.require(EMAILS_WRITE)?;

    if !body.to.contains('@') {
        return Err(AppError::Validation(
            "\"to\" must be a valid email address".to_string(),
        ));
    }

    let target = Target::Email(body.to.clone());
    dispatch(&state, &client, &headers, target, body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_id_format() {
        assert!(valid_kind_id("acme.maintenance-window_2"));
        assert!(!valid_kind_id("has space"));
        assert!(!valid_kind_id("slash/kind"));
    }

    #[test]
    fn test_validation_collects_errors() {
        let err = NotifyBody::default().validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("kind_id"));
        assert!(message.contains("\"text\" or \"html\""));

        let ok = NotifyBody {
            kind_id: "k".to_string(),
            html: "<p>hi</p>".to_string(),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_correlation_id_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-vcap-request-id", "req-42".parse().unwrap());
        assert_eq!(correlation_id(&headers), "req-42");

        let generated = correlation_id(&HeaderMap::new());
        assert!(Uuid::parse_str(&generated).is_ok());
    }
}
