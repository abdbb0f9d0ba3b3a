//! Email-led and passwordless sign-in endpoints.

use super::types::*;
use super::{json, read_user_ip, ApiResult};
use crate::server::{App, ClientAddr};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use std::sync::Arc;
use ubergang_common::{AuthStateKind, Result, Session, User};

/// Issue the session for a completed sign-in. An existing cookie whose
/// session belongs to the same user is reused (reuse-mode read, so the
/// secret does not gate re-authentication); otherwise a fresh session is
/// created. The session's user agent and address are refreshed either way.
pub(crate) fn signin_session(
    app: &App,
    headers: &HeaderMap,
    peer: Option<&ClientAddr>,
    user: &User,
) -> Result<Session> {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let remote_addr = read_user_ip(headers, peer);

    let mut session = match app.session.reuse_session(headers) {
        Ok((_, session)) if session.user_id == user.id => session,
        _ => app.auth.create_session(&user.id, &user_agent, &remote_addr)?,
    };
    session.user_agent = user_agent;
    session.remote_addr = remote_addr;

    let stored = session.clone();
    app.db.update_session(&session.id, move |_| Ok(stored))?;
    Ok(session)
}

/// Append the session trampoline parameter to a redirect target.
pub(crate) fn create_redirect(app: &App, redirect: &str, session: &Session) -> String {
    if redirect.is_empty() {
        return String::new();
    }
    let Ok(mut url) = url::Url::parse(redirect) else {
        return String::new();
    };
    url.query_pairs_mut()
        .append_pair("_ubergang_session", &app.session.encode_session_cookie(session));
    url.to_string()
}

/// GET /api/signin/start: challenge for a passwordless (resident key)
/// sign-in. The state rides in the returned JWT.
pub async fn start(State(app): State<Arc<App>>) -> ApiResult {
    let engine = app.webauthn()?;
    let (token, rcr) = engine.start_passwordless().map_err(|e| {
        tracing::warn!("Failed to start passwordless signin: {e}");
        axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })?;
    Ok(json(StartSigninResponse {
        token,
        assertion_request: serde_json::to_value(&rcr).unwrap_or_default(),
    }))
}

/// POST /api/signin/email: build an assertion restricted to the email's
/// credentials. Failures do not reveal whether the email exists.
pub async fn email(
    State(app): State<Arc<App>>,
    Json(req): Json<SigninEmailRequest>,
) -> ApiResult {
    let engine = app.webauthn()?;
    let respond_err = |error: SigninEmailError| {
        Ok(json(SigninEmailResponse {
            error: Some(error),
            success: None,
        }))
    };

    if req.email.is_empty() {
        return respond_err(SigninEmailError {
            wrong_email: true,
            ..Default::default()
        });
    }
    let user = match app.db.get_user_by_email(&req.email) {
        Ok(user) => user,
        Err(e) => {
            tracing::info!("User not found for {}: {e}", req.email);
            return respond_err(SigninEmailError {
                wrong_email: true,
                ..Default::default()
            });
        }
    };

    let credentials = app.db.list_credentials(&user.id);
    if credentials.is_empty() {
        return respond_err(SigninEmailError {
            no_credentials: true,
            ..Default::default()
        });
    }

    match engine.start_assertion(&user, &credentials, AuthStateKind::SignIn) {
        Ok((token, rcr)) => Ok(json(SigninEmailResponse {
            error: None,
            success: Some(SigninEmailSuccess {
                token,
                assertion_request: serde_json::to_value(&rcr).unwrap_or_default(),
            }),
        })),
        Err(e) => {
            tracing::warn!("Failed to create assertion: {e}");
            respond_err(SigninEmailError {
                internal_error: true,
                ..Default::default()
            })
        }
    }
}

/// POST /api/signin/webauthn: complete either flavor of sign-in. The token
/// is tried as a passwordless JWT first, then as a stored state id.
pub async fn webauthn(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    peer: Option<Extension<ClientAddr>>,
    Json(req): Json<SigninWebauthnRequest>,
) -> ApiResult {
    let engine = app.webauthn()?;
    let respond_err = |error: SigninWebauthnError| {
        Ok(json(SigninWebauthnResponse {
            error: Some(error),
            success: None,
        }))
    };

    let (user, auth_result) = match engine.finish_passwordless(&req.token, &req.credential) {
        Ok((user, _credentials, result)) => (user, result),
        Err(_) => {
            let state = match app.db.consume_authentication_state(&req.token) {
                Ok(state) if matches!(state.kind, AuthStateKind::SignIn) => state,
                _ => {
                    tracing::warn!("Authentication state not found or not intended for sign-in");
                    return respond_err(SigninWebauthnError {
                        internal_error: true,
                        ..Default::default()
                    });
                }
            };
            let user = match app.db.get_user_by_id(&state.user_id) {
                Ok(user) => user,
                Err(e) => {
                    tracing::warn!("User not found: {}; {e}", state.user_id);
                    return respond_err(SigninWebauthnError {
                        invalid_credential: true,
                        ..Default::default()
                    });
                }
            };
            match engine.validate_assertion(&state, &req.credential) {
                Ok(result) => (user, result),
                Err(e) => {
                    tracing::warn!("WebAuthn credential doesn't validate: {e}");
                    return respond_err(SigninWebauthnError {
                        invalid_credential: true,
                        ..Default::default()
                    });
                }
            }
        }
    };

    let session = match signin_session(&app, &headers, peer.as_ref().map(|e| &e.0), &user) {
        Ok(session) => session,
        Err(_) => {
            return respond_err(SigninWebauthnError {
                invalid_credential: true,
                ..Default::default()
            })
        }
    };

    if let Err(e) = engine.note_credential_used(&auth_result, &session.id) {
        tracing::warn!("WebAuthn credential doesn't match any credential: {e}");
        return respond_err(SigninWebauthnError {
            invalid_credential: true,
            ..Default::default()
        });
    }

    Ok(json(SigninWebauthnResponse {
        error: None,
        success: Some(SigninSuccess {
            cookie: app.session.create_session_cookie(&session),
            redirect: create_redirect(&app, &req.redirect, &session),
        }),
    }))
}
