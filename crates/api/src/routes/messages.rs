//! Message status lookup.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use courier_common::error::AppError;
use courier_common::types::MessageStatus;

use crate::middleware::auth::Client;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/messages/{id}", get(get_message))
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub status: MessageStatus,
}

/// GET /messages/:id — Current delivery status of one message.
async fn get_message(
    State(state): State<AppState>,
    client: Client,
    Path(id): Path<String>,
) -> Result<Json<MessageView>, AppError> {
    client.require("notification.write")?;

    let message = state
        .messages
        .find(&id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("Message {} not found", id)))?;

    Ok(Json(MessageView {
        status: message.status,
    }))
}
