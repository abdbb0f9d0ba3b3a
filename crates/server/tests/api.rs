//! API-level tests driven through the routers, no sockets involved.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;
use ubergang_common::{AccessLevel, Db};
use ubergang_server::rest;
use ubergang_server::server::{self, App, Options, Server};

fn options() -> Options {
    Options {
        ssh_port: 0,
        https_port: 0,
        http_port: 0,
        metrics_port: 0,
        mqtt_port: 0,
        mqtt_tls_port: 0,
        mqtt_server: String::new(),
        local_dev: false,
        proxy_test_port: 0,
    }
}

/// A server in test mode (configured, self-signed) with its admin router.
async fn test_app() -> (Arc<App>, Router) {
    let db = Db::open_memory().unwrap();
    server::start_test_mode(&db).unwrap();
    let server = Server::new(db, options()).await.unwrap();
    let app = server.app();
    let router = rest::admin_router(app.clone());
    (app, router)
}

async fn bootstrap_app() -> (Arc<App>, Router) {
    let db = Db::open_memory().unwrap();
    let server = Server::new(db, options()).await.unwrap();
    let app = server.app();
    let router = rest::bootstrap_router(app.clone());
    (app, router)
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed(mut req: Request<Body>, cookie: &str) -> Request<Body> {
    req.headers_mut().insert(
        header::COOKIE,
        format!("__ug_sess={cookie}").parse().unwrap(),
    );
    req
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

/// Create a user with a session, returning (user id, cookie value).
fn seed_user(app: &App, email: &str, admin: bool) -> (String, String) {
    let (user, _) = app.auth.create_user(email, email, admin, vec![]).unwrap();
    let session = app
        .auth
        .create_session(&user.id, "test-agent", "192.0.2.1:999")
        .unwrap();
    (user.id, format!("{}:{}", session.id, session.secret))
}

#[tokio::test]
async fn test_bootstrap_flow() {
    let (_, router) = bootstrap_app().await;

    let response = router
        .clone()
        .oneshot(Request::get("/api/bootstrap/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["isConfigured"], false);

    let response = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/bootstrap/configure",
            serde_json::json!({"email": "a@x", "siteFqdn": "x"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["admin_fqdn"], "account.x");

    let response = router
        .clone()
        .oneshot(Request::get("/api/bootstrap/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["isConfigured"], true);

    // Configuring twice is refused.
    let response = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/bootstrap/configure",
            serde_json::json!({"email": "b@x", "siteFqdn": "y"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_signin_email_without_credentials() {
    let (app, router) = test_app().await;
    seed_user(&app, "u@x", false);

    let response = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/signin/email",
            serde_json::json!({"email": "u@x"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["error"]["no_credentials"], true);

    // Unknown emails look the same as wrong ones.
    let response = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/signin/email",
            serde_json::json!({"email": "nobody@x"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["wrong_email"], true);
}

#[tokio::test]
async fn test_signin_start_returns_challenge() {
    let (_, router) = test_app().await;
    let response = router
        .clone()
        .oneshot(Request::get("/api/signin/start").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["token"].as_str().unwrap().contains('.')); // JWT shape
    assert!(body["assertionRequest"]["publicKey"]["challenge"].is_string());
}

#[tokio::test]
async fn test_pin_request_poll_query() {
    let (app, router) = test_app().await;
    let (_, cookie) = seed_user(&app, "u@x", false);

    // Device A requests a PIN.
    let response = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/signin/pin/request",
            serde_json::json!({"email": "u@x", "userAgent": "device-a"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    let poll_id = body["id"].as_str().unwrap().to_string();

    // Device A polls: pending, with the PIN and a QR data URL.
    let response = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/signin/pin/poll",
            serde_json::json!({"id": poll_id}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    let pin = body["pending"]["pin"].as_str().unwrap().to_string();
    assert_eq!(pin.len(), 6);
    assert!(body["pending"]["qr_code_url"]
        .as_str()
        .unwrap()
        .starts_with("data:image/svg+xml;base64,"));

    // Unknown poll ids report invalid-token.
    let response = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/signin/pin/poll",
            serde_json::json!({"id": "no-such-request"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["invalidToken"], true);

    // Device B queries with spaces and dashes around the PIN. The user has
    // no passkeys yet, so challenge creation reports invalid credentials,
    // which proves the normalized PIN matched.
    let padded = format!(" {}-{} ", &pin[..3], &pin[3..]);
    let response = router
        .clone()
        .oneshot(authed(
            json_request(
                "POST",
                "/api/signin/pin/query",
                serde_json::json!({"pin": padded}),
            ),
            &cookie,
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["invalidCredentials"], true);

    // A wrong PIN is invalid-pin.
    let response = router
        .clone()
        .oneshot(authed(
            json_request(
                "POST",
                "/api/signin/pin/query",
                serde_json::json!({"pin": "000000"}),
            ),
            &cookie,
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["invalidPin"], true);

    // Unauthenticated query is refused outright.
    let response = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/signin/pin/query",
            serde_json::json!({"pin": pin}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_credential_delete_authorization() {
    let (app, router) = test_app().await;
    let (u1, cookie1) = seed_user(&app, "u1@x", false);
    let (_u2, cookie2) = seed_user(&app, "u2@x", false);

    let now = chrono::Utc::now();
    app.db
        .update_credential("cred-sid", |_| {
            Ok(Some(ubergang_common::Credential {
                id: "cred-sid".into(),
                user_id: u1.clone(),
                name: "Passkey".into(),
                created_at: now,
                last_used_at: now,
                created_by_session_id: String::new(),
                used_by_session_ids: vec![],
                passkey: serde_json::json!({}),
                transports: vec![],
                aaguid: String::new(),
                sign_count: 0,
                clone_warning: false,
            }))
        })
        .unwrap();

    // Another user gets a 404, not a 403: existence must not leak.
    let response = router
        .clone()
        .oneshot(authed(
            Request::delete("/api/credential/cred-sid").body(Body::empty()).unwrap(),
            &cookie2,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(app.db.get_credential("cred-sid").is_ok());

    // The owner can delete.
    let response = router
        .clone()
        .oneshot(authed(
            Request::delete("/api/credential/cred-sid").body(Body::empty()).unwrap(),
            &cookie1,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(app.db.get_credential("cred-sid").is_err());
}

#[tokio::test]
async fn test_backend_admin_gating() {
    let (app, router) = test_app().await;
    let (_admin, admin_cookie) = seed_user(&app, "admin@x", true);
    let (_user, user_cookie) = seed_user(&app, "user@x", false);

    let update = serde_json::json!({
        "upstreamUrl": "http://10.0.0.1:8080",
        "accessLevel": "NORMAL",
        "jsScript": "",
    });

    let response = router
        .clone()
        .oneshot(authed(
            json_request("POST", "/api/backend/web.x", update.clone()),
            &user_cookie,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = router
        .clone()
        .oneshot(authed(
            json_request("POST", "/api/backend/web.x", update),
            &admin_cookie,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(authed(
            Request::get("/api/backend/web.x").body(Body::empty()).unwrap(),
            &admin_cookie,
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["fqdn"], "web.x");
    assert_eq!(body["upstreamUrl"], "http://10.0.0.1:8080");

    // A broken script fails the update.
    let response = router
        .clone()
        .oneshot(authed(
            json_request(
                "POST",
                "/api/backend/web.x",
                serde_json::json!({"jsScript": "proxy.get('/x',"}),
            ),
            &admin_cookie,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = router
        .clone()
        .oneshot(authed(
            Request::delete("/api/backend/web.x").body(Body::empty()).unwrap(),
            &admin_cookie,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_mqtt_import_export_round_trip() {
    let (app, router) = test_app().await;
    let (_admin, admin_cookie) = seed_user(&app, "admin@x", true);

    let yaml = r#"
profiles:
  - name: sensors
    allow_publish: ["$ID/out"]
    allow_subscribe: ["$ID/in"]
clients:
  - name: c1
    password: pw1
    profile: sensors
    values:
      LOC: oslo
"#;
    let response = router
        .clone()
        .oneshot(authed(
            Request::post("/api/mqtt/import")
                .body(Body::from(yaml.to_string()))
                .unwrap(),
            &admin_cookie,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["profiles_count"], 1);
    assert_eq!(body["clients_count"], 1);

    // Clients referencing unknown profiles are rejected before any write.
    let bad = "clients:\n  - name: c2\n    password: pw\n    profile: missing\n";
    let response = router
        .clone()
        .oneshot(authed(
            Request::post("/api/mqtt/import")
                .body(Body::from(bad.to_string()))
                .unwrap(),
            &admin_cookie,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.db.get_mqtt_client("c2").is_err());

    let response = router
        .clone()
        .oneshot(authed(
            Request::get("/api/mqtt/export").body(Body::empty()).unwrap(),
            &admin_cookie,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("name: sensors"));
    assert!(text.contains("name: c1"));
    assert!(text.contains("LOC: oslo"));

    // The profile is in use, so deleting it fails.
    let response = router
        .clone()
        .oneshot(authed(
            Request::delete("/api/mqtt-profile/sensors").body(Body::empty()).unwrap(),
            &admin_cookie,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_user_endpoints() {
    let (app, router) = test_app().await;
    let (admin_id, admin_cookie) = seed_user(&app, "admin@x", true);
    let (_user_id, user_cookie) = seed_user(&app, "user@x", false);

    // Non-admins cannot list users.
    let response = router
        .clone()
        .oneshot(authed(
            Request::get("/api/user").body(Body::empty()).unwrap(),
            &user_cookie,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // "me" resolves the session user and includes the current session.
    let response = router
        .clone()
        .oneshot(authed(
            Request::get("/api/user/me").body(Body::empty()).unwrap(),
            &admin_cookie,
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["id"], admin_id.as_str());
    assert!(body["currentSession"]["id"].is_string());

    // Admin creates a user and mints a recovery link.
    let response = router
        .clone()
        .oneshot(authed(
            json_request("POST", "/api/user", serde_json::json!({"email": "new@x"})),
            &admin_cookie,
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    let new_id = body["id"].as_str().unwrap().to_string();

    let response = router
        .clone()
        .oneshot(authed(
            json_request("POST", &format!("/api/user/{new_id}/recover"), serde_json::json!({})),
            &admin_cookie,
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    let recovery_url = body["recoveryUrl"].as_str().unwrap();
    assert!(recovery_url.starts_with("https://localhost:10443/signin/"));
    let token = recovery_url.rsplit('/').next().unwrap();
    assert_eq!(app.db.get_user_by_signin_request(token).unwrap().id, new_id);

    // Non-admins cannot escalate themselves.
    let response = router
        .clone()
        .oneshot(authed(
            json_request(
                "POST",
                &format!("/api/user/{new_id}"),
                serde_json::json!({"admin": true}),
            ),
            &user_cookie,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_session_delete_authorization() {
    let (app, router) = test_app().await;
    let (_u1, cookie1) = seed_user(&app, "u1@x", false);
    let (u2, _cookie2) = seed_user(&app, "u2@x", false);

    let other = app
        .auth
        .create_session(&u2, "agent", "192.0.2.2:1")
        .unwrap();

    let response = router
        .clone()
        .oneshot(authed(
            Request::delete(format!("/api/session/{}", other.id))
                .body(Body::empty())
                .unwrap(),
            &cookie1,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Deleting your own session works.
    let own = app.db.list_sessions(&u2).into_iter().next().unwrap();
    let own_cookie = format!("{}:{}", own.id, own.secret);
    let response = router
        .clone()
        .oneshot(authed(
            Request::delete(format!("/api/session/{}", own.id))
                .body(Body::empty())
                .unwrap(),
            &own_cookie,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_testing_setup_resets_but_keeps_config() {
    let (app, router) = test_app().await;
    seed_user(&app, "old@x", false);

    let response = router
        .clone()
        .oneshot(json_request("POST", "/api/testing/setup", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["signinUrl"].as_str().unwrap().starts_with("/signin/"));

    // Old identity is gone, configuration survives.
    assert!(app.db.get_user_by_email("old@x").is_err());
    assert!(app.db.get_user_by_email("hello@example.com").is_ok());
    assert!(app.db.get_configuration().unwrap().is_configured());
}

#[tokio::test]
async fn test_proxy_resolution_and_trampoline() {
    let (app, _router) = test_app().await;
    let (user_id, _) = seed_user(&app, "u@x", false);

    // Unknown hosts are a 502.
    let req = Request::get("https://nope.example.com/")
        .header(header::HOST, "nope.example.com")
        .body(Body::empty())
        .unwrap();
    let response = ubergang_server::proxy::handle(&app, req).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    // A protected backend without a cookie redirects to /authorize.
    let now = chrono::Utc::now();
    app.db
        .update_backend("web.example.com", |_| {
            Ok(Some(ubergang_common::models::Backend {
                fqdn: "web.example.com".into(),
                upstream_url: "http://127.0.0.1:1".into(),
                headers: vec![],
                access_level: AccessLevel::Normal,
                script: String::new(),
                created_at: now,
                updated_at: now,
            }))
        })
        .unwrap();
    let req = Request::get("/dashboard?x=1")
        .header(header::HOST, "web.example.com")
        .body(Body::empty())
        .unwrap();
    let response = ubergang_server::proxy::handle(&app, req).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with("https://localhost:10443/authorize?rd="));

    // The trampoline rebinds the session and strips its parameter, without
    // requiring the secret.
    let session = app
        .auth
        .create_session(&user_id, "agent", "192.0.2.3:1")
        .unwrap();
    let req = Request::get(format!(
        "/dashboard?x=1&_ubergang_session={}:not-the-secret",
        session.id
    ))
    .header(header::HOST, "web.example.com")
    .body(Body::empty())
    .unwrap();
    let response = ubergang_server::proxy::handle(&app, req).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    assert!(cookie.contains(&format!("__ug_sess={}:{}", session.id, session.secret)));
    assert!(cookie.contains("Secure"));
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(!location.contains("_ubergang_session"));
    assert!(location.contains("x=1"));

    // An authenticated user without the host in allowedHosts gets a 403.
    let cookie_value = format!("{}:{}", session.id, session.secret);
    let req = Request::get("/dashboard")
        .header(header::HOST, "web.example.com")
        .header(header::COOKIE, format!("__ug_sess={cookie_value}"))
        .body(Body::empty())
        .unwrap();
    let response = ubergang_server::proxy::handle(&app, req).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_script_interception_through_proxy() {
    let (app, _router) = test_app().await;

    let now = chrono::Utc::now();
    app.db
        .update_backend("scripted.example.com", |_| {
            Ok(Some(ubergang_common::models::Backend {
                fqdn: "scripted.example.com".into(),
                upstream_url: "http://127.0.0.1:1".into(),
                headers: vec![],
                access_level: AccessLevel::Public,
                script: r#"
                    proxy.get('/api/health', (req, res) => {
                        res.status(200).send('Proxy is Healthy');
                    });
                "#
                .into(),
                created_at: now,
                updated_at: now,
            }))
        })
        .unwrap();

    let req = Request::get("/api/health")
        .header(header::HOST, "scripted.example.com")
        .body(Body::empty())
        .unwrap();
    let response = ubergang_server::proxy::handle(&app, req).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"Proxy is Healthy");

    // Unmatched paths fall through to 404, not the backend.
    let req = Request::get("/other")
        .header(header::HOST, "scripted.example.com")
        .body(Body::empty())
        .unwrap();
    let response = ubergang_server::proxy::handle(&app, req).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
