//! Backend administration endpoints (admin only).

use super::types::*;
use super::{bad_request, json, require_admin, ApiResult};
use crate::server::App;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use std::sync::Arc;
use ubergang_common::{AccessLevel, Backend, Header};

fn parse_access_level(s: &str) -> Result<AccessLevel, String> {
    match s {
        "PUBLIC" => Ok(AccessLevel::Public),
        "NORMAL" => Ok(AccessLevel::Normal),
        other => Err(format!("unknown access level: {other}")),
    }
}

pub async fn list(State(app): State<Arc<App>>, headers: HeaderMap) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    Ok(json(ListBackendsResponse {
        backends: app.db.list_backends().iter().map(ApiBackend::from).collect(),
    }))
}

pub async fn get_one(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(fqdn): Path<String>,
) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    let backend = app
        .db
        .get_backend(&fqdn)
        .map_err(|_| StatusCode::NOT_FOUND.into_response())?;
    Ok(json(ApiBackend::from(&backend)))
}

pub async fn update(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(fqdn): Path<String>,
    Json(req): Json<UpdateBackendRequest>,
) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;

    let access_level = match req.access_level.as_deref() {
        Some(s) => Some(parse_access_level(s).map_err(|e| bad_request(&e))?),
        None => None,
    };
    if !req.js_script.is_empty() {
        crate::scripting::check_script(&req.js_script)
            .map_err(|e| bad_request(&e.to_string()))?;
    }

    let fqdn_lower = fqdn.to_ascii_lowercase();
    let result = app.db.update_backend(&fqdn, move |old| {
        let now = Utc::now();
        let mut backend = old.unwrap_or(Backend {
            fqdn: fqdn_lower,
            upstream_url: String::new(),
            headers: vec![],
            access_level: AccessLevel::Normal,
            script: String::new(),
            created_at: now,
            updated_at: now,
        });
        if let Some(url) = req.upstream_url {
            backend.upstream_url = url;
        }
        if let Some(headers) = req.headers {
            backend.headers = headers
                .into_iter()
                .map(|h| Header {
                    name: h.name,
                    value: h.value,
                })
                .collect();
        }
        if let Some(level) = access_level {
            backend.access_level = level;
        }
        backend.script = req.js_script;
        backend.updated_at = now;
        Ok(Some(backend))
    });
    result.map_err(|e| bad_request(&e.to_string()))?;

    Ok(json(serde_json::json!({})))
}

pub async fn delete(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(fqdn): Path<String>,
) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    app.db
        .delete_backend(&fqdn)
        .map_err(|e| bad_request(&e.to_string()))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
