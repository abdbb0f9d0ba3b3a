//! Bootstrap endpoints, active only while the server is unconfigured.

use super::types::*;
use super::{bad_request, json, ApiResult};
use crate::server::App;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;

pub async fn status(State(app): State<Arc<App>>) -> ApiResult {
    let is_configured = app
        .db
        .get_configuration()
        .map(|c| c.is_configured())
        .unwrap_or(false);
    Ok(json(BootstrapStatusResponse { is_configured }))
}

/// POST /api/bootstrap/configure: write the configuration record. The server
/// is then restarted (manually) into normal mode.
pub async fn configure(
    State(app): State<Arc<App>>,
    Json(req): Json<BootstrapConfigureRequest>,
) -> ApiResult {
    if req.email.is_empty() {
        return Err(bad_request("Email is required"));
    }
    if req.site_fqdn.is_empty() {
        return Err(bad_request("Site FQDN is required"));
    }

    let already = app
        .db
        .get_configuration()
        .map(|c| c.is_configured())
        .unwrap_or(false);
    if already {
        return Err(bad_request("Server is already configured"));
    }

    let admin_fqdn = format!("account.{}", req.site_fqdn);
    let email = req.email.clone();
    let site_fqdn = req.site_fqdn.clone();
    let stored_admin = admin_fqdn.clone();
    let result = app.db.update_configuration(move |old| {
        let mut config = old.unwrap_or_default();
        config.email = email;
        config.site_fqdn = site_fqdn;
        config.admin_fqdn = stored_admin;
        Ok(config)
    });
    if let Err(e) = result {
        tracing::error!("Failed to save configuration: {e}");
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to save configuration",
        )
            .into_response());
    }

    tracing::info!(
        "Bootstrap configuration saved: email={}, siteFqdn={}, adminFqdn={admin_fqdn}",
        req.email,
        req.site_fqdn
    );
    Ok(json(BootstrapConfigureResponse { admin_fqdn }))
}
