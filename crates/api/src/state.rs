//! Shared application state for the Axum API server.

use std::sync::Arc;

use courier_engine::messages::MessageRepository;
use courier_engine::preferences::Preferences;
use courier_engine::strategies::Strategies;

use crate::middleware::auth::Authenticator;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub strategies: Strategies,
    pub messages: Arc<dyn MessageRepository>,
    pub preferences: Arc<dyn Preferences>,
    pub authenticator: Arc<Authenticator>,
}

impl AppState {
    pub fn new(
        strategies: Strategies,
        messages: Arc<dyn MessageRepository>,
        preferences: Arc<dyn Preferences>,
        authenticator: Authenticator,
    ) -> Self {
        Self {
            strategies,
            messages,
            preferences,
            authenticator: Arc::new(authenticator),
        }
    }
}
