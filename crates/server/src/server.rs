//! Server wiring: configuration, listeners, and host-based routing.

use crate::auth::{ssh_keys, Auth};
use crate::backends::BackendRegistry;
use crate::mqtt::publisher::Publisher;
use crate::mqtt::tracker::Tracker;
use crate::mqtt::MqttProxy;
use crate::proxy;
use crate::rest;
use crate::session::SessionStore;
use crate::tasks;
use crate::tls::TlsManager;
use crate::webauthn::WebauthnEngine;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{debug, info};
use ubergang_common::{Configuration, Db, Error, Result, Session, User};

const TEST_MODE_ADMIN_HOST: &str = "localhost:10443";
const BACKUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub struct Options {
    pub ssh_port: u16,
    pub https_port: u16,
    pub http_port: u16,
    pub metrics_port: u16,
    pub mqtt_port: u16,
    pub mqtt_tls_port: u16,
    pub mqtt_server: String,
    pub local_dev: bool,
    pub proxy_test_port: u16,
}

/// Peer address of the TLS connection, injected into request extensions.
#[derive(Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Shared state for every subsystem.
pub struct App {
    pub db: Db,
    pub config: Configuration,
    pub opts: Options,
    pub session: SessionStore,
    pub auth: Auth,
    pub backends: BackendRegistry,
    pub tls: Arc<TlsManager>,
    pub tracker: Tracker,
    pub publisher: Option<Publisher>,
    pub update_accessed: mpsc::Sender<Session>,
    webauthn: Option<WebauthnEngine>,
}

impl App {
    /// The WebAuthn engine; absent only in bootstrap mode, where no endpoint
    /// that needs it is routable.
    pub fn webauthn(&self) -> std::result::Result<&WebauthnEngine, Response> {
        self.webauthn
            .as_ref()
            .ok_or_else(|| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// Write the configuration record (used by `--configure`).
pub fn configure(db: &Db, email: &str, site_fqdn: &str) -> Result<()> {
    if email.is_empty() || site_fqdn.is_empty() {
        return Err(Error::InvalidConfig(
            "email and site FQDN are required".into(),
        ));
    }
    let email = email.to_string();
    let site_fqdn = site_fqdn.to_string();
    db.update_configuration(move |old| {
        let mut config = old.unwrap_or_default();
        config.admin_fqdn = format!("account.{site_fqdn}");
        config.email = email;
        config.site_fqdn = site_fqdn;
        Ok(config)
    })
}

/// Enter test mode: fixed admin host, wiped-by-endpoint database. Refuses to
/// run against a database configured for anything else.
pub fn start_test_mode(db: &Db) -> Result<()> {
    db.update_configuration(|old| {
        if let Some(old) = &old {
            if old.is_configured() && old.admin_fqdn != TEST_MODE_ADMIN_HOST {
                return Err(Error::InvalidConfig(
                    "test mode is restricted to integration tests".into(),
                ));
            }
        }
        Ok(Configuration {
            email: "hello@example.com".into(),
            site_fqdn: "example.com".into(),
            admin_fqdn: TEST_MODE_ADMIN_HOST.into(),
            test_mode: true,
        })
    })
}

pub struct Server {
    app: Arc<App>,
}

impl Server {
    pub async fn new(db: Db, opts: Options) -> anyhow::Result<Self> {
        let config = db.get_configuration().unwrap_or_default();

        let backends = BackendRegistry::new(db.clone());
        let tls = TlsManager::build(&db, &config, backends.clone())?;
        let session = SessionStore::new(db.clone());
        let auth = Auth::new(db.clone());
        let webauthn = if config.is_configured() {
            Some(WebauthnEngine::new(&config, db.clone())?)
        } else {
            None
        };
        let tracker = Tracker::spawn(db.clone());
        let publisher = if opts.mqtt_server.is_empty() {
            None
        } else {
            info!("Created MQTT publisher for broker {}", opts.mqtt_server);
            Some(Publisher::spawn(opts.mqtt_server.clone()))
        };
        let update_accessed = tasks::spawn_session_access_updater(db.clone());

        Ok(Self {
            app: Arc::new(App {
                db,
                config,
                opts,
                session,
                auth,
                backends,
                tls,
                tracker,
                publisher,
                update_accessed,
                webauthn,
            }),
        })
    }

    pub fn admin_fqdn(&self) -> &str {
        &self.app.config.admin_fqdn
    }

    pub fn app(&self) -> Arc<App> {
        self.app.clone()
    }

    pub fn create_account(&self, email: &str, admin: bool) -> Result<(User, String)> {
        self.app.auth.create_user(email, email, admin, vec![])
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let app = self.app;
        let prometheus = crate::metrics::install();

        let key_pem = match app.db.get_ssh_server_key() {
            Ok(pem) => pem,
            Err(_) => {
                info!("Generating new SSH host key");
                let pem = ssh_keys::generate_ssh_server_key()?;
                app.db.update_ssh_server_key(&pem)?;
                pem
            }
        };

        tasks::spawn_periodic_backups(app.db.clone(), std::env::temp_dir(), BACKUP_INTERVAL);

        let ssh_handle: JoinHandle<anyhow::Result<()>> = {
            let app = app.clone();
            let port = app.opts.ssh_port;
            tokio::spawn(async move { crate::ssh::serve(app, key_pem, port).await })
        };
        let metrics_handle = {
            let app = app.clone();
            tokio::spawn(serve_metrics(app, prometheus))
        };
        let https_handle = {
            let app = app.clone();
            tokio::spawn(serve_https(app))
        };

        if !app.opts.mqtt_server.is_empty() {
            let proxy = Arc::new(MqttProxy::new(
                app.db.clone(),
                app.tracker.clone(),
                app.tls.clone(),
                app.opts.mqtt_server.clone(),
            ));
            proxy.start(app.opts.mqtt_port, app.opts.mqtt_tls_port);
        }
        if app.opts.proxy_test_port != 0 {
            tokio::spawn(serve_proxy_test(app.clone()));
        }

        let http_handle = {
            let app = app.clone();
            tokio::spawn(serve_http(app))
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                Ok(())
            }
            result = https_handle => result?,
            result = http_handle => result?,
            result = metrics_handle => result?,
            result = ssh_handle => result?,
        }
    }
}

/// One handler for every HTTPS request: admin host requests go to the REST
/// router (or the bootstrap router while unconfigured), everything else is
/// reverse-proxied.
async fn route_request(
    app: Arc<App>,
    admin_router: Router,
    mut req: Request,
    peer: SocketAddr,
) -> Response {
    req.extensions_mut().insert(ClientAddr(peer));
    let host = proxy::request_host(&req);
    let host_without_port = host.split(':').next().unwrap_or(&host).to_string();
    let start = Instant::now();

    metrics::counter!("ubergang_http_request_size_bytes", "host" => host.clone()).increment(
        req.headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0),
    );

    let is_admin_host =
        host == app.config.admin_fqdn || host_without_port == app.config.admin_fqdn;
    let response = if !app.config.is_configured() || is_admin_host {
        match admin_router.oneshot(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    } else {
        proxy::handle(&app, req).await
    };

    metrics::counter!(
        "ubergang_http_requests_total",
        "host" => host.clone(),
        "status" => response.status().as_u16().to_string(),
    )
    .increment(1);
    metrics::counter!("ubergang_http_response_size_bytes", "host" => host.clone()).increment(
        response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0),
    );
    metrics::histogram!("ubergang_http_request_duration_seconds", "host" => host)
        .record(start.elapsed().as_secs_f64());

    response
}

async fn serve_https(app: Arc<App>) -> anyhow::Result<()> {
    let admin_router = if app.config.is_configured() {
        info!("Registering API endpoint at {}", app.config.admin_fqdn);
        rest::admin_router(app.clone())
    } else {
        info!("Bootstrap mode: serving setup UI on all hosts");
        rest::bootstrap_router(app.clone())
    };

    let listener = TcpListener::bind(("0.0.0.0", app.opts.https_port)).await?;
    info!("Starting HTTPS server on :{}", app.opts.https_port);

    loop {
        let (stream, peer) = listener.accept().await?;
        let app = app.clone();
        let admin_router = admin_router.clone();
        tokio::spawn(async move {
            let tls_stream = match app.tls.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("TLS handshake with {peer} failed: {e}");
                    return;
                }
            };
            let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let app = app.clone();
                let admin_router = admin_router.clone();
                async move {
                    let req = req.map(Body::new);
                    Ok::<_, std::convert::Infallible>(
                        route_request(app, admin_router, req, peer).await,
                    )
                }
            });
            let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
            if let Err(e) = builder
                .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                .await
            {
                debug!("HTTPS connection from {peer} ended: {e}");
            }
        });
    }
}

/// Plain HTTP: ACME HTTP-01 challenges from storage, everything else
/// redirects to HTTPS.
async fn serve_http(app: Arc<App>) -> anyhow::Result<()> {
    async fn challenge(
        State(app): State<Arc<App>>,
        axum::extract::Host(host): axum::extract::Host,
        Path(_token): Path<String>,
    ) -> Response {
        let host = host.split(':').next().unwrap_or(&host).to_string();
        match app.tls.http01_key_authorization(&host) {
            Some(key_authorization) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                key_authorization,
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn redirect_to_https(req: Request) -> Response {
        let host = proxy::request_host(&req);
        let uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, format!("https://{host}{uri}"))
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    let router = Router::new()
        .route("/.well-known/acme-challenge/:token", get(challenge))
        .fallback(redirect_to_https)
        .with_state(app.clone());

    let listener = TcpListener::bind(("0.0.0.0", app.opts.http_port)).await?;
    info!("Starting HTTP server on :{}", app.opts.http_port);
    axum::serve(listener, router).await?;
    Ok(())
}

/// Metrics port: Prometheus exposition plus the database backup endpoint.
async fn serve_metrics(app: Arc<App>, prometheus: PrometheusHandle) -> anyhow::Result<()> {
    async fn backup(State(app): State<Arc<App>>) -> Response {
        match app.db.snapshot() {
            Ok(bytes) => (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        "attachment; filename=\"ubergang.db\"".to_string(),
                    ),
                ],
                bytes,
            )
                .into_response(),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }

    let router = Router::new()
        .route(
            "/metrics",
            get(move || {
                let prometheus = prometheus.clone();
                async move { prometheus.render() }
            }),
        )
        .route("/backup", get(backup))
        .with_state(app.clone());

    let listener = TcpListener::bind(("0.0.0.0", app.opts.metrics_port)).await?;
    info!("Starting Metrics server on :{}", app.opts.metrics_port);
    axum::serve(listener, router).await?;
    Ok(())
}

/// Diagnostics listener used by integration tests against the proxy.
async fn serve_proxy_test(app: Arc<App>) -> anyhow::Result<()> {
    async fn echo(req: Request) -> Response {
        let headers: std::collections::HashMap<String, String> = req
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();
        axum::Json(serde_json::json!({
            "method": req.method().as_str(),
            "path": req.uri().path(),
            "query": req.uri().query().unwrap_or(""),
            "headers": headers,
        }))
        .into_response()
    }

    async fn status(Path(code): Path<u16>) -> Response {
        StatusCode::from_u16(code)
            .map(|status| status.into_response())
            .unwrap_or_else(|_| StatusCode::BAD_REQUEST.into_response())
    }

    let router = Router::new()
        .route("/echo", axum::routing::any(echo))
        .route("/echo/*rest", axum::routing::any(echo))
        .route("/status/:code", get(status));

    let listener = TcpListener::bind(("0.0.0.0", app.opts.proxy_test_port)).await?;
    info!("Starting proxy test server on :{}", app.opts.proxy_test_port);
    axum::serve(listener, router).await?;
    Ok(())
}
