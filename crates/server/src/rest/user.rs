//! User and session endpoints.

use super::types::*;
use super::{bad_request, json, not_authorized, require_admin, require_session, ApiResult};
use crate::server::App;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{Duration, Utc};
use std::sync::Arc;
use ubergang_common::{ids, Error, SigninRequest, User};

fn to_api_user(app: &App, user: &User, current_session: Option<ApiSession>) -> ApiUser {
    ApiUser {
        id: user.id.clone(),
        email: user.email.clone(),
        display_name: user.display_name.clone(),
        allowed_hosts: user.allowed_hosts.clone(),
        is_admin: user.is_admin,
        credentials: app
            .db
            .list_credentials(&user.id)
            .iter()
            .map(ApiCredential::from)
            .collect(),
        sessions: app
            .db
            .list_sessions(&user.id)
            .iter()
            .map(ApiSession::from)
            .collect(),
        current_session,
        ssh_keys: app
            .db
            .list_ssh_keys(&user.id)
            .iter()
            .map(ApiSshKey::from)
            .collect(),
    }
}

pub async fn create(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    if req.email.is_empty() {
        return Err(bad_request("Email is required"));
    }
    let (user, _token) = app
        .auth
        .create_user(&req.email, &req.email, false, vec![])
        .map_err(|e| {
            tracing::warn!("Failed to create user: {e}");
            bad_request("Failed to create user")
        })?;
    Ok(json(CreateUserResponse { id: user.id }))
}

pub async fn list(State(app): State<Arc<App>>, headers: HeaderMap) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    let users = app
        .db
        .list_users()
        .iter()
        .map(|u| to_api_user(&app, u, None))
        .collect();
    Ok(json(ListUsersResponse { users }))
}

pub async fn get_one(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let (session_user, session) = require_session(&app.session, &headers)?;

    let (user, current_session) = if id == "me" {
        let current = ApiSession::from(&session);
        (session_user, Some(current))
    } else {
        let user = app
            .db
            .get_user_by_id(&id)
            .map_err(|_| StatusCode::NOT_FOUND.into_response())?;
        (user, None)
    };
    Ok(json(to_api_user(&app, &user, current_session)))
}

pub async fn update(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<UpdateUserRequest>,
) -> ApiResult {
    let (session_user, _) = require_session(&app.session, &headers)?;
    let updating_self = session_user.id == id;

    if !session_user.is_admin && !updating_self {
        return Err(not_authorized());
    }
    if !session_user.is_admin && req.admin.is_some() {
        return Err((StatusCode::FORBIDDEN, "Not authorized to change admin status").into_response());
    }
    if !session_user.is_admin && req.allowed_hosts.is_some() {
        return Err((StatusCode::FORBIDDEN, "Not authorized to change allowed hosts").into_response());
    }

    let result = app.db.update_user(&id, move |old| {
        let mut user = old.ok_or_else(|| Error::not_found("user", "user"))?;
        if let Some(email) = req.email {
            user.email = email;
        }
        if let Some(display_name) = req.display_name {
            user.display_name = display_name;
        }
        if let Some(admin) = req.admin {
            user.is_admin = admin;
        }
        if let Some(allowed_hosts) = req.allowed_hosts {
            user.allowed_hosts = allowed_hosts;
        }
        Ok(user)
    });
    match result {
        Ok(()) => Ok(json(serde_json::json!({}))),
        Err(e) if e.is_not_found() => Err(StatusCode::NOT_FOUND.into_response()),
        Err(e) => {
            tracing::warn!("Failed to update user: {e}");
            Err(StatusCode::BAD_REQUEST.into_response())
        }
    }
}

pub async fn delete(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    match app.db.delete_user(&id) {
        Ok(()) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(e) if e.is_not_found() => Err(StatusCode::NOT_FOUND.into_response()),
        Err(e) => Err(bad_request(&e.to_string())),
    }
}

/// POST /api/user/{id}/recover: append a pre-confirmed one-week sign-in
/// token and hand back the recovery link.
pub async fn recover(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    if id.is_empty() {
        return Err(bad_request("User ID is required"));
    }

    let poll_id = ids::make_signin_request_token();
    let entry = SigninRequest {
        id: poll_id.clone(),
        pin: String::new(),
        expires_at: Utc::now() + Duration::days(7),
        confirmed: true,
        user_agent: String::new(),
        ip: String::new(),
    };
    let result = app.db.update_user(&id, move |old| {
        let mut user = old.ok_or_else(|| Error::not_found("user", "user"))?;
        user.signin_requests.push(entry);
        Ok(user)
    });
    match result {
        Ok(()) => {
            tracing::info!("Created recovery token for user {id}");
            Ok(json(UserRecoverResponse {
                recovery_url: format!("https://{}/signin/{poll_id}", app.config.admin_fqdn),
            }))
        }
        Err(e) if e.is_not_found() => {
            Err((StatusCode::NOT_FOUND, "User not found").into_response())
        }
        Err(e) => {
            tracing::warn!("Failed to create recovery token for user {id}: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

pub async fn session_delete(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let (user, _) = require_session(&app.session, &headers)?;

    let (_, target) = app
        .db
        .get_session(&id)
        .map_err(|_| StatusCode::NOT_FOUND.into_response())?;
    if !user.is_admin && target.user_id != user.id {
        tracing::warn!(
            "User {} trying to delete session {id} belonging to user {}",
            user.id,
            target.user_id
        );
        return Err(not_authorized());
    }

    app.db
        .delete_session(&id)
        .map_err(|e| bad_request(&e.to_string()))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
