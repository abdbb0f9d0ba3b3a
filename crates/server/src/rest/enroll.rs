//! Passkey enrollment endpoints.

use super::types::*;
use super::{json, require_session, ApiResult};
use crate::server::App;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use ubergang_common::{AuthStateKind, Error};

fn invalid_enrollment() -> Response {
    json(FinishEnrollResponse {
        credential: None,
        error: Some(FinishEnrollError {
            invalid_enrollment: true,
        }),
    })
}

/// The relying-party policy for this deployment: platform authenticator,
/// resident key, user verification. Applied to the serialized creation
/// options handed to the browser.
fn apply_rp_policy(options: &mut serde_json::Value) {
    if let Some(public_key) = options.get_mut("publicKey") {
        public_key["attestation"] = serde_json::json!("none");
        public_key["authenticatorSelection"] = serde_json::json!({
            "authenticatorAttachment": "platform",
            "requireResidentKey": true,
            "residentKey": "required",
            "userVerification": "required",
        });
    }
}

pub async fn start(State(app): State<Arc<App>>, headers: HeaderMap) -> ApiResult {
    let (user, session) = require_session(&app.session, &headers)?;
    let engine = app.webauthn()?;

    let credentials = app.db.list_credentials(&user.id);
    let (token, ccr) = engine
        .start_enroll(&user, &session.id, &credentials)
        .map_err(|e| {
            tracing::warn!("Failed to create enroll request: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })?;

    let mut options = serde_json::to_value(&ccr)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())?;
    apply_rp_policy(&mut options);

    Ok(json(StartEnrollResponse {
        error: None,
        enroll_request: Some(EnrollRequest { token, options }),
    }))
}

pub async fn finish(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(req): Json<FinishEnrollRequest>,
) -> ApiResult {
    let (user, session) = require_session(&app.session, &headers)?;
    let engine = app.webauthn()?;

    let state = match app.db.consume_authentication_state(&req.token) {
        Ok(state) => state,
        Err(_) => return Ok(invalid_enrollment()),
    };
    match &state.kind {
        AuthStateKind::Enroll { session_id } if *session_id == session.id => {}
        _ => return Ok(invalid_enrollment()),
    }

    let credential = match engine.finish_enroll(&user, &session, &state, &req.credential) {
        Ok(credential) => credential,
        Err(e) => {
            tracing::warn!("Failed to create credential: {e}");
            return Ok(invalid_enrollment());
        }
    };

    let stored = credential.clone();
    let inserted = app.db.update_credential(&credential.id, move |old| {
        if old.is_some() {
            return Err(Error::Conflict("credential ID collision".into()));
        }
        Ok(Some(stored))
    });
    if inserted.is_err() {
        return Ok(invalid_enrollment());
    }

    Ok(json(FinishEnrollResponse {
        credential: Some(ApiCredential::from(&credential)),
        error: None,
    }))
}

/// Serve the icon for a known authenticator model.
pub async fn passkey_image(
    State(app): State<Arc<App>>,
    Path(aaguid): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    let engine = app.webauthn()?;
    let entry = engine
        .aaguid_table()
        .get(&aaguid)
        .ok_or_else(|| StatusCode::NOT_FOUND.into_response())?;

    let dark = headers
        .get("sec-ch-prefers-color-scheme")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "dark")
        .unwrap_or(false);
    let icon = if dark { &entry.icon_dark } else { &entry.icon_light };
    if icon.is_empty() {
        return Err(StatusCode::NOT_FOUND.into_response());
    }
    // Icons are stored as data: URIs; pass the payload through.
    let (mime, data) = icon
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
        .ok_or_else(|| StatusCode::NOT_FOUND.into_response())?;
    let bytes = data_encoding::BASE64
        .decode(data.as_bytes())
        .map_err(|_| StatusCode::NOT_FOUND.into_response())?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, mime.to_string())],
        bytes,
    )
        .into_response())
}
