//! Admin-host REST API.
//!
//! Thin JSON handlers over the gateway subsystems. Domain failures on the
//! sign-in surface come back as 200 responses with typed error envelopes;
//! everything else follows the usual 400/403/404/500 conventions.

pub mod backend;
pub mod bootstrap;
pub mod credential;
pub mod enroll;
pub mod mqtt_admin;
pub mod pin;
pub mod ssh_key;
pub mod signin;
pub mod testing;
pub mod user;
pub mod types;

use crate::server::{App, ClientAddr};
use crate::session::SessionStore;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use ubergang_common::{Session, User};

/// Handlers return `Result<Response, Response>` so auth helpers can bail out
/// with `?`.
pub type ApiResult = Result<Response, Response>;

pub fn admin_router(app: Arc<App>) -> Router {
    Router::new()
        // Enrolling
        .route("/api/enroll/start", post(enroll::start))
        .route("/api/enroll/finish", post(enroll::finish))
        // Signing in
        .route("/api/signin/start", get(signin::start))
        .route("/api/signin/email", post(signin::email))
        .route("/api/signin/webauthn", post(signin::webauthn))
        // Signing in, pin flow
        .route("/api/signin/pin/request", post(pin::request))
        .route("/api/signin/pin/poll", post(pin::poll))
        .route("/api/signin/pin/query", post(pin::query))
        .route("/api/signin/pin/confirm", post(pin::confirm))
        // SSH keys
        .route("/api/ssh-key", post(ssh_key::create))
        .route("/api/ssh-key/:id", get(ssh_key::get_one).post(ssh_key::propose))
        .route(
            "/api/ssh-key/:id/confirm",
            get(ssh_key::confirm_start).post(ssh_key::confirm_finish),
        )
        // Backends
        .route("/api/backend", get(backend::list))
        .route(
            "/api/backend/:fqdn",
            get(backend::get_one)
                .post(backend::update)
                .delete(backend::delete),
        )
        // MQTT profiles and clients
        .route("/api/mqtt-profile", get(mqtt_admin::profile_list))
        .route(
            "/api/mqtt-profile/:id",
            get(mqtt_admin::profile_get)
                .post(mqtt_admin::profile_update)
                .delete(mqtt_admin::profile_delete),
        )
        .route("/api/mqtt-client", get(mqtt_admin::client_list))
        .route(
            "/api/mqtt-client/:id",
            get(mqtt_admin::client_get)
                .post(mqtt_admin::client_update)
                .delete(mqtt_admin::client_delete),
        )
        .route("/api/mqtt/import", post(mqtt_admin::import))
        .route("/api/mqtt/export", get(mqtt_admin::export))
        // Credentials
        .route(
            "/api/credential/:id",
            post(credential::update).delete(credential::delete),
        )
        // Sessions
        .route("/api/session/:id", axum::routing::delete(user::session_delete))
        // Users
        .route("/api/user", post(user::create).get(user::list))
        .route(
            "/api/user/:id",
            get(user::get_one).post(user::update).delete(user::delete),
        )
        .route("/api/user/:id/recover", post(user::recover))
        // Testing
        .route("/api/testing/setup", post(testing::setup))
        // Authorize trampoline issuer
        .route("/authorize", get(crate::proxy::authorize::handle))
        // Passkey images
        .route("/passkey-image/:aaguid", get(enroll::passkey_image))
        .fallback(ui_fallback)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}

/// Bootstrap mode: no Host filter, only status/configure plus the UI.
pub fn bootstrap_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/api/bootstrap/status", get(bootstrap::status))
        .route("/api/bootstrap/configure", post(bootstrap::configure))
        .fallback(ui_fallback)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}

/// The embedded web UI is served separately; with `--local-dev` unmatched
/// admin-host requests proxy to the dev frontend instead.
async fn ui_fallback(State(app): State<Arc<App>>, req: Request) -> Response {
    if app.opts.local_dev {
        return crate::proxy::proxy_request(&app, req, crate::backends::Backend::DevFrontend, None)
            .await;
    }
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

pub(crate) fn json<T: Serialize>(value: T) -> Response {
    Json(value).into_response()
}

pub(crate) fn bad_request(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, msg.to_string()).into_response()
}

pub(crate) fn not_authorized() -> Response {
    (StatusCode::FORBIDDEN, "Not authorized").into_response()
}

/// Strict session check; failures turn into a 403.
pub(crate) fn require_session(
    session: &SessionStore,
    headers: &HeaderMap,
) -> Result<(User, Session), Response> {
    session.get(headers).map_err(|e| {
        tracing::warn!("Failed to authenticate: {e}");
        not_authorized()
    })
}

pub(crate) fn require_admin(
    session: &SessionStore,
    headers: &HeaderMap,
) -> Result<(User, Session), Response> {
    let (user, sess) = require_session(session, headers)?;
    if !user.is_admin {
        return Err(not_authorized());
    }
    Ok((user, sess))
}

/// Client IP resolution. Proxy-set headers are checked in order of trust
/// before falling back to the socket address.
pub(crate) fn read_user_ip(headers: &HeaderMap, peer: Option<&ClientAddr>) -> String {
    for header in [
        "cf-connecting-ip",
        "true-client-ip",
        "x-forwarded-for",
        "x-real-ip",
        "forwarded",
    ] {
        let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        match header {
            "x-forwarded-for" => {
                // Comma-separated; the first entry is the client and may
                // carry a port.
                let first = value.split(',').next().unwrap_or("").trim();
                let host = first.rsplit_once(':').map(|(h, _)| h).unwrap_or(first);
                if host.parse::<std::net::IpAddr>().is_ok() {
                    return host.to_string();
                }
                if first.parse::<std::net::IpAddr>().is_ok() {
                    return first.to_string();
                }
            }
            "forwarded" => {
                let first = value.split(',').next().unwrap_or("");
                for part in first.split(';') {
                    let part = part.trim().to_ascii_lowercase();
                    if let Some(v) = part.strip_prefix("for=") {
                        let v = v.trim_matches('"');
                        if v.parse::<std::net::IpAddr>().is_ok() {
                            return v.to_string();
                        }
                    }
                }
            }
            _ => {
                if value.parse::<std::net::IpAddr>().is_ok() {
                    return value.to_string();
                }
            }
        }
    }
    peer.map(|p| p.0.ip().to_string()).unwrap_or_default()
}
