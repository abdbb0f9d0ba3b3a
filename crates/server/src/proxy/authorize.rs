//! The `/authorize` endpoint on the admin host.
//!
//! Re-issues the session trampoline URL so the session cookie rebinds to the
//! target domain the user was trying to reach.

use crate::server::App;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct AuthorizeQuery {
    #[serde(default)]
    pub rd: String,
}

pub async fn handle(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Query(query): Query<AuthorizeQuery>,
) -> Response {
    let session = match app.session.get(&headers) {
        Ok((_, session)) => session,
        Err(e) => {
            tracing::info!("Failed to find session: {e}");
            return Response::builder()
                .status(StatusCode::FOUND)
                .header(
                    header::LOCATION,
                    format!("https://{}/signin?rd={}", app.config.admin_fqdn, query.rd),
                )
                .body(axum::body::Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
    };
    let _ = app.update_accessed.try_send(session.clone());

    let redirect = if query.rd.is_empty() {
        String::new()
    } else {
        match url::Url::parse(&query.rd) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair(
                    "_ubergang_session",
                    &app.session.encode_session_cookie(&session),
                );
                url.to_string()
            }
            Err(_) => String::new(),
        }
    };

    if redirect.is_empty() {
        return "Authorized\n".into_response();
    }
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, redirect)
        .body(axum::body::Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
