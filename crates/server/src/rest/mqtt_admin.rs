//! MQTT profile/client administration plus YAML import/export (admin only).

use super::types::*;
use super::{bad_request, json, require_admin, ApiResult};
use crate::server::App;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;
use ubergang_common::{Error, MqttClient, MqttProfile};

pub async fn profile_list(State(app): State<Arc<App>>, headers: HeaderMap) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    Ok(json(ListMqttProfilesResponse {
        mqtt_profiles: app
            .db
            .list_mqtt_profiles()
            .iter()
            .map(ApiMqttProfile::from)
            .collect(),
    }))
}

pub async fn profile_get(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    let profile = app
        .db
        .get_mqtt_profile(&id)
        .map_err(|_| StatusCode::NOT_FOUND.into_response())?;
    Ok(json(ApiMqttProfile::from(&profile)))
}

pub async fn profile_update(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<UpdateMqttProfileRequest>,
) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    let profile_id = id.clone();
    app.db
        .update_mqtt_profile(&id, move |old| {
            let mut profile = old.unwrap_or(MqttProfile {
                id: profile_id,
                allow_publish: vec![],
                allow_subscribe: vec![],
            });
            if let Some(allow_publish) = req.allow_publish {
                profile.allow_publish = allow_publish;
            }
            if let Some(allow_subscribe) = req.allow_subscribe {
                profile.allow_subscribe = allow_subscribe;
            }
            Ok(Some(profile))
        })
        .map_err(|e| bad_request(&e.to_string()))?;
    Ok(json(serde_json::json!({})))
}

pub async fn profile_delete(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    app.db
        .update_mqtt_profile(&id, |_| Ok(None))
        .map_err(|e| bad_request(&e.to_string()))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn client_list(State(app): State<Arc<App>>, headers: HeaderMap) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    let connections = app.tracker.get_connections().await;
    let mqtt_clients = app
        .db
        .list_mqtt_clients()
        .iter()
        .map(|c| {
            let mut api = ApiMqttClient::from(c);
            attach_connection_state(&mut api, connections.get(&c.id));
            api
        })
        .collect();
    Ok(json(ListMqttClientsResponse { mqtt_clients }))
}

fn attach_connection_state(
    api: &mut ApiMqttClient,
    state: Option<&crate::mqtt::tracker::ClientConnectionState>,
) {
    let Some(state) = state else { return };
    if let Some(connected) = &state.connected {
        api.connected = Some(ApiMqttConnected {
            remote_addr: connected.remote_addr.clone(),
            connected_at: rfc3339(connected.connected_at),
            connection_type: connected.connection_type.to_string(),
        });
    }
    if let Some(disconnected) = &state.disconnected {
        api.disconnected = Some(ApiMqttDisconnected {
            remote_addr: disconnected.remote_addr.clone(),
            disconnected_at: rfc3339(disconnected.disconnected_at),
        });
    }
}

pub async fn client_get(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    let client = app
        .db
        .get_mqtt_client(&id)
        .map_err(|_| StatusCode::NOT_FOUND.into_response())?;
    let connections = app.tracker.get_connections().await;
    let mut api = ApiMqttClient::from(&client);
    attach_connection_state(&mut api, connections.get(&client.id));
    Ok(json(api))
}

pub async fn client_update(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<UpdateMqttClientRequest>,
) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    let client_id = id.clone();
    app.db
        .update_mqtt_client(&id, move |old| {
            let mut client = old.unwrap_or(MqttClient {
                id: client_id,
                profile_id: String::new(),
                password: String::new(),
                values: Default::default(),
            });
            if let Some(new_id) = req.id {
                client.id = new_id;
            }
            if let Some(profile_id) = req.profile_id {
                client.profile_id = profile_id;
            }
            if let Some(password) = req.password {
                client.password = password;
            }
            if let Some(values) = req.values {
                client.values = values;
            }
            Ok(Some(client))
        })
        .map_err(|e| bad_request(&e.to_string()))?;
    Ok(json(serde_json::json!({})))
}

pub async fn client_delete(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;
    // Kick any live connection so the deleted account stops flowing.
    app.tracker.disconnect(&id).await;
    app.db
        .update_mqtt_client(&id, |_| Ok(None))
        .map_err(|e| bad_request(&e.to_string()))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// GET /api/mqtt/export: the full MQTT configuration as YAML.
pub async fn export(State(app): State<Arc<App>>, headers: HeaderMap) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;

    let config = YamlMqttConfig {
        profiles: app
            .db
            .list_mqtt_profiles()
            .into_iter()
            .map(|p| YamlMqttProfile {
                name: p.id,
                allow_publish: p.allow_publish,
                allow_subscribe: p.allow_subscribe,
            })
            .collect(),
        clients: app
            .db
            .list_mqtt_clients()
            .into_iter()
            .map(|c| YamlMqttClient {
                name: c.id,
                password: c.password,
                profile: c.profile_id,
                values: c.values,
            })
            .collect(),
    };

    let body = serde_yaml::to_string(&config).map_err(|e| {
        tracing::error!("Failed to marshal MQTT config to YAML: {e}");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-yaml"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=mqtt-config.yaml",
            ),
        ],
        body,
    )
        .into_response())
}

/// POST /api/mqtt/import: upsert profiles and clients from a YAML document.
/// Profile references are validated before anything is written.
pub async fn import(State(app): State<Arc<App>>, headers: HeaderMap, body: String) -> ApiResult {
    let _ = require_admin(&app.session, &headers)?;

    let config: YamlMqttConfig = serde_yaml::from_str(&body)
        .map_err(|e| bad_request(&format!("Failed to parse YAML: {e}")))?;

    for profile in &config.profiles {
        if profile.name.is_empty() {
            return Err(bad_request("Profile name cannot be empty"));
        }
    }
    for client in &config.clients {
        if client.name.is_empty() {
            return Err(bad_request("Client name cannot be empty"));
        }
        if client.profile.is_empty() {
            return Err(bad_request(&format!(
                "Client '{}' must have a profile",
                client.name
            )));
        }
        let provided = config.profiles.iter().any(|p| p.name == client.profile);
        if !provided && app.db.get_mqtt_profile(&client.profile).is_err() {
            return Err(bad_request(&format!(
                "Client '{}' references unknown profile '{}'",
                client.name, client.profile
            )));
        }
    }

    for profile in &config.profiles {
        let record = MqttProfile {
            id: profile.name.clone(),
            allow_publish: profile.allow_publish.clone(),
            allow_subscribe: profile.allow_subscribe.clone(),
        };
        app.db
            .update_mqtt_profile(&profile.name, move |_| Ok(Some(record)))
            .map_err(|e: Error| {
                tracing::error!("Failed to import profile {}: {e}", profile.name);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            })?;
    }
    for client in &config.clients {
        let record = MqttClient {
            id: client.name.clone(),
            profile_id: client.profile.clone(),
            password: client.password.clone(),
            values: client.values.clone(),
        };
        app.db
            .update_mqtt_client(&client.name, move |_| Ok(Some(record)))
            .map_err(|e: Error| {
                tracing::error!("Failed to import client {}: {e}", client.name);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            })?;
    }

    tracing::info!(
        profiles = config.profiles.len(),
        clients = config.clients.len(),
        "Imported MQTT configuration"
    );
    Ok(json(serde_json::json!({
        "success": true,
        "profiles_count": config.profiles.len(),
        "clients_count": config.clients.len(),
    })))
}
