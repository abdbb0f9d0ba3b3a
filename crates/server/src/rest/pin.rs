//! Cross-device PIN sign-in flow.
//!
//! Device A requests a sign-in by email and polls with the request id;
//! device B (already authenticated) looks the PIN up, proves itself with an
//! assertion, and confirms. Device A's next poll yields the session cookie.

use super::signin::{create_redirect, signin_session};
use super::types::*;
use super::{bad_request, json, read_user_ip, require_session, ApiResult};
use crate::server::{App, ClientAddr};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{Duration, Utc};
use std::sync::Arc;
use ubergang_common::{ids, AuthStateKind, Error, SigninRequest};
use uuid::Uuid;

/// POST /api/signin/pin/request (unauthenticated).
pub async fn request(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    peer: Option<Extension<ClientAddr>>,
    Json(req): Json<SigninPinRequest>,
) -> ApiResult {
    let user = match app.db.get_user_by_email(&req.email) {
        Ok(user) => user,
        Err(_) => {
            tracing::warn!("User not found for {}", req.email);
            return Ok(json(SigninPinRequestResponse {
                error: Some(SigninPinRequestError {
                    invalid_email: true,
                }),
                id: None,
            }));
        }
    };

    let pin = ids::make_signin_request_pin();
    let poll_id = Uuid::new_v4().to_string();
    let ip = read_user_ip(&headers, peer.as_ref().map(|e| &e.0));

    let entry = SigninRequest {
        id: poll_id.clone(),
        pin,
        expires_at: Utc::now() + Duration::minutes(30),
        confirmed: false,
        user_agent: req.user_agent,
        ip,
    };
    let result = app.db.update_user(&user.id, move |old| {
        let mut user = old.ok_or_else(|| Error::not_found("user", "gone"))?;
        user.signin_requests.push(entry);
        Ok(user)
    });
    if let Err(e) = result {
        tracing::warn!("Failed to update user: {e}");
        return Err(StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    Ok(json(SigninPinRequestResponse {
        error: None,
        id: Some(poll_id),
    }))
}

fn qr_code_data_url(contents: &str) -> Option<String> {
    use qrcode::render::svg;

    let code = qrcode::QrCode::new(contents.as_bytes()).ok()?;
    let image = code
        .render()
        .min_dimensions(256, 256)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();
    Some(format!(
        "data:image/svg+xml;base64,{}",
        data_encoding::BASE64.encode(image.as_bytes())
    ))
}

/// POST /api/signin/pin/poll (unauthenticated).
pub async fn poll(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    peer: Option<Extension<ClientAddr>>,
    Json(req): Json<SigninPinPollRequest>,
) -> ApiResult {
    let respond_err = |error: SigninPinPollError| {
        Ok(json(SigninPinPollResponse {
            error: Some(error),
            pending: None,
            success: None,
        }))
    };

    let user = match app.db.get_user_by_signin_request(&req.id) {
        Ok(user) => user,
        Err(_) => {
            tracing::warn!("User not found for {}", req.id);
            return respond_err(SigninPinPollError {
                invalid_token: true,
                ..Default::default()
            });
        }
    };

    let Some(entry) = user.signin_requests.iter().find(|e| e.id == req.id) else {
        return respond_err(SigninPinPollError {
            invalid_token: true,
            ..Default::default()
        });
    };

    if entry.expires_at < Utc::now() {
        return respond_err(SigninPinPollError {
            expired: true,
            ..Default::default()
        });
    }

    if !entry.confirmed {
        let confirm_url = format!("https://{}/confirm/", app.config.admin_fqdn);
        let Some(qr_code_url) = qr_code_data_url(&format!("{confirm_url}{}", entry.pin)) else {
            return respond_err(SigninPinPollError {
                internal_error: true,
                ..Default::default()
            });
        };
        return Ok(json(SigninPinPollResponse {
            error: None,
            pending: Some(SigninPinPending {
                pin: entry.pin.clone(),
                confirm_url,
                qr_code_url,
            }),
            success: None,
        }));
    }

    let session = match signin_session(&app, &headers, peer.as_ref().map(|e| &e.0), &user) {
        Ok(session) => session,
        Err(_) => {
            return respond_err(SigninPinPollError {
                internal_error: true,
                ..Default::default()
            })
        }
    };

    Ok(json(SigninPinPollResponse {
        error: None,
        pending: None,
        success: Some(SigninSuccess {
            cookie: app.session.create_session_cookie(&session),
            redirect: create_redirect(&app, &req.redirect, &session),
        }),
    }))
}

/// POST /api/signin/pin/query: the confirming device looks the PIN up.
pub async fn query(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(req): Json<SigninPinQueryRequest>,
) -> ApiResult {
    let (user, session) = require_session(&app.session, &headers)?;
    let engine = app.webauthn()?;

    // Users type PINs with separators; strip them before matching.
    let clean_pin: String = req
        .pin
        .trim()
        .chars()
        .filter(|c| *c != '-' && *c != ' ')
        .collect();

    let Some(entry) = user
        .signin_requests
        .iter()
        .find(|e| !e.pin.is_empty() && e.pin == clean_pin)
    else {
        return Ok(json(SigninPinQueryResponse {
            error: Some(SigninPinQueryError {
                invalid_pin: true,
                ..Default::default()
            }),
            ..Default::default()
        }));
    };

    let mut response = SigninPinQueryResponse {
        error: None,
        pin: entry.pin.clone(),
        requestor_user_agent: entry.user_agent.clone(),
        requestor_ip: entry.ip.clone(),
        token: String::new(),
        confirmed: entry.confirmed,
        assertion_request: None,
    };

    if !entry.confirmed {
        let credentials = app.db.list_credentials(&user.id);
        let kind = AuthStateKind::ConfirmSignin {
            signin_request_id: entry.id.clone(),
            session_id: session.id.clone(),
        };
        match engine.start_assertion(&user, &credentials, kind) {
            Ok((token, rcr)) => {
                response.token = token;
                response.assertion_request = serde_json::to_value(&rcr).ok();
            }
            Err(_) => {
                return Ok(json(SigninPinQueryResponse {
                    error: Some(SigninPinQueryError {
                        invalid_credentials: true,
                        ..Default::default()
                    }),
                    ..Default::default()
                }));
            }
        }
    }

    Ok(json(response))
}

/// POST /api/signin/pin/confirm: the confirming device proves the assertion
/// and flips the request to confirmed.
pub async fn confirm(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(req): Json<SigninPinConfirmRequest>,
) -> ApiResult {
    let (user, session) = require_session(&app.session, &headers)?;
    let engine = app.webauthn()?;

    let invalid = || {
        Ok(json(SigninPinConfirmResponse {
            error: Some(InvalidEnrollmentError {
                invalid_enrollment: true,
            }),
        }))
    };

    let state = match app.db.consume_authentication_state(&req.token) {
        Ok(state) => state,
        Err(_) => return invalid(),
    };
    let AuthStateKind::ConfirmSignin {
        signin_request_id,
        session_id,
    } = state.kind.clone()
    else {
        return invalid();
    };

    if state.user_id != user.id || session_id != session.id {
        tracing::warn!("Token not intended for this user or signing type");
        return Err(bad_request("bad request"));
    }

    if let Err(e) = engine.validate_assertion(&state, &req.credential) {
        tracing::warn!("Failed to validate assertion: {e}");
        return invalid();
    }

    let result = app.db.update_user(&user.id, move |old| {
        let mut user = old.ok_or_else(|| Error::not_found("user", "gone"))?;
        let entry = user
            .signin_requests
            .iter_mut()
            .find(|e| e.id == signin_request_id)
            .ok_or_else(|| Error::not_found("signin request", signin_request_id.clone()))?;
        entry.confirmed = true;
        Ok(user)
    });
    if let Err(e) = result {
        tracing::warn!("Failed to update user: {e}");
        return invalid();
    }

    Ok(json(SigninPinConfirmResponse { error: None }))
}
