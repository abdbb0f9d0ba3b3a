//! Credential endpoints.

use super::types::UpdateCredentialRequest;
use super::{json, require_session, ApiResult};
use crate::server::App;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;
use ubergang_common::Error;

pub async fn update(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<UpdateCredentialRequest>,
) -> ApiResult {
    let (user, _) = require_session(&app.session, &headers)?;

    let result = app.db.update_credential(&id, move |old| {
        let cred = old.ok_or_else(|| Error::not_found("credential", "credential"))?;
        // The same error for missing and foreign credentials, so existence
        // does not leak.
        if cred.user_id != user.id {
            return Err(Error::not_found("credential", "credential"));
        }
        let mut cred = cred;
        if let Some(name) = req.name {
            cred.name = name;
        }
        Ok(Some(cred))
    });
    result.map_err(|_| StatusCode::BAD_REQUEST.into_response())?;
    Ok(json(serde_json::json!({})))
}

pub async fn delete(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let (user, _) = require_session(&app.session, &headers)?;

    let result = app.db.update_credential(&id, move |old| {
        let cred = old.ok_or_else(|| Error::not_found("credential", "credential"))?;
        if !user.is_admin && cred.user_id != user.id {
            return Err(Error::not_found("credential", "credential"));
        }
        Ok(None)
    });
    result.map_err(|_| StatusCode::NOT_FOUND.into_response())?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
