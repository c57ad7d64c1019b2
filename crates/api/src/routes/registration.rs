//! Client and kind registration.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::put;
use axum::{Json, Router};
use serde::Deserialize;

use courier_common::error::AppError;
use courier_engine::preferences::{KindRegistration, Registration};

use crate::middleware::auth::Client;
use crate::routes::notify::valid_kind_id;
use crate::state::AppState;

const NOTIFICATION_WRITE: &str = "notification.write";
const CRITICAL_WRITE: &str = "critical_notifications.write";

pub fn router() -> Router<AppState> {
    Router::new().route("/registration", put(register))
}

#[derive(Debug, Default, Deserialize)]
pub struct RegistrationBody {
    #[serde(default)]
    pub source_description: String,
    #[serde(default)]
    pub kinds: Vec<KindBody>,
}

#[derive(Debug, Default, Deserialize)]
pub struct KindBody {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub critical: bool,
}

impl RegistrationBody {
    fn validate(&self) -> Result<(), AppError> {
        let mut errors = Vec::new();

        if self.source_description.is_empty() {
            errors.push("\"source_description\" is a required field".to_string());
        }
        for kind in &self.kinds {
            if kind.id.is_empty() {
                errors.push("\"kind.id\" is a required field".to_string());
            } else if !valid_kind_id(&kind.id) {
                errors.push(format!("\"kind.id\" {} is improperly formatted", kind.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(errors.join(", ")))
        }
    }

    fn into_registration(self, client_id: String) -> Registration {
        Registration {
            client_id,
            source_description: self.source_description,
            kinds: self
                .kinds
                .into_iter()
                .map(|k| KindRegistration {
                    id: k.id,
                    description: k.description,
                    critical: k.critical,
                })
                .collect(),
        }
    }
}

/// PUT /registration — Register the calling client and the kinds it sends.
/// Marking a kind critical needs the extra critical-notifications scope.
async fn register(
    State(state): State<AppState>,
    client: Client,
    Json(body): Json<RegistrationBody>,
) -> Result<StatusCode, AppError> {
    client.require(NOTIFICATION_WRITE)?;
    body.validate()?;

    let registration = body.into_registration(client.client_id.clone());
    if registration.has_critical_kinds() {
        client.require(CRITICAL_WRITE)?;
    }

    state
        .preferences
        .register(&registration)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(StatusCode::NO_CONTENT)
}
