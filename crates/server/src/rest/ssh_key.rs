//! SSH key endpoints: create, propose, WebAuthn-gated confirmation.

use super::types::*;
use super::{bad_request, json, require_session, ApiResult};
use crate::server::App;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use std::sync::Arc;
use ubergang_common::AuthStateKind;

pub async fn create(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(req): Json<CreateSshKeyRequest>,
) -> ApiResult {
    let (user, _) = require_session(&app.session, &headers)?;
    let key = app
        .auth
        .create_ssh_key(&user.id, &req.name)
        .map_err(|e| bad_request(&e.to_string()))?;
    Ok(json(CreateSshKeyResponse { key_id: key.id }))
}

pub async fn get_one(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let _ = require_session(&app.session, &headers)?;
    let key = app.db.get_ssh_key(&id).map_err(|_| {
        tracing::warn!("Failed to find ssh key: {id}");
        StatusCode::NOT_FOUND.into_response()
    })?;
    Ok(json(ApiSshKey::from(&key)))
}

/// POST /api/ssh-key/{id}: upload a public key. Unauthenticated; gated by
/// the shared secret instead.
pub async fn propose(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
    Json(req): Json<ProposeSshKeyRequest>,
) -> ApiResult {
    match app.auth.propose_ssh_key(&id, &req.key_secret, &req.public_key) {
        Ok(key) => Ok(json(ProposeSshKeyResponse {
            confirm_url: format!("https://{}/ssh/{}", app.config.admin_fqdn, key.id),
        })),
        Err(e) => {
            tracing::warn!("Failed to update key: {e}");
            Ok(json(ProposeSshKeyResponse::default()))
        }
    }
}

/// GET /api/ssh-key/{id}/confirm: assertion challenge bound to the key.
pub async fn confirm_start(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let (user, _) = require_session(&app.session, &headers)?;
    let engine = app.webauthn()?;

    let key = match app.db.get_ssh_key(&id) {
        Ok(key) if key.user_id == user.id => key,
        _ => {
            return Ok(json(GetConfirmSshKeyResponse {
                error: Some(GetConfirmSshKeyError { invalid_key: true }),
                authenticate: None,
            }))
        }
    };

    let credentials = app.db.list_credentials(&user.id);
    let (token, rcr) = engine
        .start_assertion(
            &user,
            &credentials,
            AuthStateKind::ConfirmSshKey {
                ssh_key_id: key.id.clone(),
            },
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())?;

    Ok(json(GetConfirmSshKeyResponse {
        error: None,
        authenticate: Some(GetConfirmSshKeyAuthenticate {
            key_name: key.name,
            token,
            assertion_request: serde_json::to_value(&rcr).unwrap_or_default(),
        }),
    }))
}

/// POST /api/ssh-key/{id}/confirm: verify the assertion and mark the key
/// confirmed, which is what makes it usable by the SSH server.
pub async fn confirm_finish(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(req): Json<ConfirmSshKeyRequest>,
) -> ApiResult {
    let (user, _) = require_session(&app.session, &headers)?;
    let engine = app.webauthn()?;

    let failed = || {
        Ok(json(ConfirmSshKeyResponse {
            error: Some(ConfirmSshKeyError {
                failed_authentication: true,
            }),
            result: None,
        }))
    };

    let state = match app.db.consume_authentication_state(&req.token) {
        Ok(state) => state,
        Err(_) => return failed(),
    };
    let AuthStateKind::ConfirmSshKey { ssh_key_id } = state.kind.clone() else {
        tracing::warn!("Token not found or not intended for this user or signing type");
        return failed();
    };
    if state.user_id != user.id {
        return failed();
    }

    if let Err(e) = engine.validate_assertion(&state, &req.credential) {
        tracing::warn!("Failed to validate assertion: {e}");
        return failed();
    }

    let key = app
        .auth
        .confirm_ssh_key(&ssh_key_id, Utc::now())
        .map_err(|e| {
            tracing::warn!("Failed to update ssh key: {e}");
            bad_request("bad request")
        })?;

    Ok(json(ConfirmSshKeyResponse {
        error: None,
        result: Some(ConfirmSshKeyResult {
            expires_at: key.expires_at().map(rfc3339).unwrap_or_default(),
        }),
    }))
}
