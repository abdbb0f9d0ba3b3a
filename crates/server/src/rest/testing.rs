//! Integration-test support endpoint.

use super::types::TestingSetupResponse;
use super::{json, ApiResult};
use crate::server::App;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use std::sync::Arc;

/// POST /api/testing/setup: wipe the database and create a confirmed admin
/// sign-in token. The configuration record survives the wipe by design.
pub async fn setup(State(app): State<Arc<App>>) -> ApiResult {
    if !app.config.test_mode {
        tracing::warn!("Not in test mode");
        return Err((StatusCode::INTERNAL_SERVER_ERROR, "Not in test mode").into_response());
    }

    app.db.clear_database().map_err(|e| {
        tracing::warn!("Failed to reset database: {e}");
        (StatusCode::INTERNAL_SERVER_ERROR, "Failed to reset database").into_response()
    })?;

    let (_, token) = app
        .auth
        .create_user("hello@example.com", "John Doe", true, vec![])
        .map_err(|e| {
            tracing::error!("Error creating user: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })?;

    tracing::info!("Setting up testing environment with token {token}");
    Ok(json(TestingSetupResponse {
        signin_url: format!("/signin/{token}"),
    }))
}
