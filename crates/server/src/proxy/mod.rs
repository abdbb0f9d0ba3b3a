//! Host-addressed reverse proxy.
//!
//! Order of operations per request: session trampoline, backend resolve,
//! authorization, script interception, then the upstream round-trip over a
//! per-request connection obtained from the backend's dialer (plain TCP for
//! persistent backends, an SSH channel for roaming ones).

pub mod authorize;

use crate::backends::{Backend, BoxedStream};
use crate::scripting::{self, ScriptDecision, ScriptRequest};
use crate::server::App;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use ubergang_common::User;

const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const UPSTREAM_TLS_TIMEOUT: Duration = Duration::from_secs(10);

/// The request's target host as sent, lowercased (may include a port).
pub fn request_host(req: &Request) -> String {
    let raw = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();
    raw.to_ascii_lowercase()
}

fn query_pairs(uri: &Uri) -> Vec<(String, String)> {
    uri.query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

fn is_allowed(user: &User, host: &str) -> bool {
    user.is_admin || user.allowed_hosts.iter().any(|h| h == host)
}

fn redirect(location: String) -> Response {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn redirect_signin(app: &App, req: &Request) -> Response {
    let rd = query_pairs(req.uri())
        .into_iter()
        .find(|(k, _)| k == "rd")
        .map(|(_, v)| v)
        .unwrap_or_default();
    redirect(format!(
        "https://{}/signin?rd={}",
        app.config.admin_fqdn, rd
    ))
}

fn redirect_authorize(app: &App, req: &Request) -> Response {
    let host = request_host(req);
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let rd: String =
        url::form_urlencoded::byte_serialize(format!("https://{host}{uri}").as_bytes()).collect();
    redirect(format!(
        "https://{}/authorize?rd={rd}",
        app.config.admin_fqdn
    ))
}

/// The session trampoline: a `_ubergang_session` query parameter rebinds an
/// existing session to this domain. The secret is not validated here; the
/// trampoline URL itself is the proof.
fn handle_trampoline(app: &App, req: &Request) -> Option<Response> {
    let pairs = query_pairs(req.uri());
    let value = pairs
        .iter()
        .find(|(k, _)| k == "_ubergang_session")
        .map(|(_, v)| v.clone())?;

    let session = match app.session.decode_session_cookie(&value, false) {
        Ok((_, session)) => session,
        Err(e) => {
            warn!("Failed to find session from trampoline: {e}");
            return Some(redirect_signin(app, req));
        }
    };

    let mut cleaned = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in pairs.iter().filter(|(k, _)| k != "_ubergang_session") {
        cleaned.append_pair(k, v);
    }
    let query = cleaned.finish();
    let location = if query.is_empty() {
        req.uri().path().to_string()
    } else {
        format!("{}?{query}", req.uri().path())
    };

    tracing::info!("Set session cookie");
    Some(
        Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, location)
            .header(
                header::SET_COOKIE,
                app.session.create_session_cookie(&session),
            )
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
    )
}

/// Entry point for every non-admin host.
pub async fn handle(app: &App, req: Request) -> Response {
    if let Some(response) = handle_trampoline(app, &req) {
        return response;
    }

    let host = request_host(&req);
    let backend = match app.backends.lookup(&host) {
        Ok(backend) => backend,
        Err(e) => {
            warn!("Failed to find backend {host}: {e}");
            return (StatusCode::BAD_GATEWAY, "No backend found").into_response();
        }
    };
    debug!("Resolved {host} to {} backend ({})", backend.kind(), backend.url());

    let mut user: Option<User> = None;
    if backend.needs_auth() {
        match app.session.get(req.headers()) {
            Ok((u, _session)) => {
                if !is_allowed(&u, backend.host()) {
                    warn!("User {} is not allowed to access {}", u.email, backend.host());
                    return (StatusCode::FORBIDDEN, "Forbidden").into_response();
                }
                user = Some(u);
            }
            Err(_) => return redirect_authorize(app, &req),
        }
    }

    if let Some(script) = backend.script() {
        match run_script(app, script, &req) {
            Ok(Some(response)) => return response,
            Ok(None) => {}
            Err(e) => {
                warn!("Script evaluation failed: {e}");
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        }
    }

    proxy_request(app, req, backend, user.as_ref()).await
}

/// Run the backend's interception script. `Ok(None)` means proxy through.
fn run_script(
    app: &App,
    script: &str,
    req: &Request,
) -> ubergang_common::Result<Option<Response>> {
    let headers: HashMap<String, String> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect();
    let mut query = HashMap::new();
    for (k, v) in query_pairs(req.uri()) {
        query.entry(k).or_insert(v);
    }

    let script_req = ScriptRequest {
        method: req.method().as_str().to_string(),
        path: req.uri().path().to_string(),
        params: HashMap::new(),
        headers,
        query,
    };
    let connected = app
        .publisher
        .as_ref()
        .map(|p| p.is_connected())
        .unwrap_or(false);
    let outcome = scripting::execute(script, &script_req, connected)?;

    if let Some(publisher) = &app.publisher {
        for publish in &outcome.publishes {
            if let Err(e) =
                publisher.publish(&publish.topic, publish.payload.as_bytes(), publish.qos, publish.retain)
            {
                warn!("Script publish to {} failed: {e}", publish.topic);
            }
        }
    }

    Ok(match outcome.decision {
        ScriptDecision::Proxy => None,
        ScriptDecision::Respond {
            status,
            content_type,
            body,
        } => {
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
            if let Some(content_type) = content_type {
                builder = builder.header(header::CONTENT_TYPE, content_type);
            }
            Some(
                builder
                    .body(Body::from(body))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
            )
        }
        ScriptDecision::NotFound => Some((StatusCode::NOT_FOUND, "Not Found").into_response()),
        ScriptDecision::Failed(msg) => Some(
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Script error: {msg}"),
            )
                .into_response(),
        ),
    })
}

fn evaluate(value: &str, variables: &HashMap<&str, String>) -> String {
    if value.starts_with('$') {
        variables.get(value).cloned().unwrap_or_default()
    } else {
        value.to_string()
    }
}

/// Forward the request to the backend's upstream.
pub async fn proxy_request(
    app: &App,
    req: Request,
    backend: Backend,
    user: Option<&User>,
) -> Response {
    let upstream = backend.url();
    let http_host = request_host(&req);

    let stream = match backend.dial().await {
        Ok(stream) => stream,
        Err(e) => return connection_error(&http_host, &backend, e),
    };
    let stream: BoxedStream = if upstream.scheme() == "https" {
        match upstream_tls(stream, upstream.host_str().unwrap_or_default()).await {
            Ok(stream) => stream,
            Err(e) => return connection_error(&http_host, &backend, e),
        }
    } else {
        stream
    };

    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let mut variables: HashMap<&str, String> = HashMap::new();
    variables.insert("$http_host", http_host.clone());
    variables.insert(
        "$upstream_host",
        format!(
            "{}{}",
            upstream.host_str().unwrap_or_default(),
            upstream
                .port()
                .map(|p| format!(":{p}"))
                .unwrap_or_default()
        ),
    );

    let mut headers = parts.headers;
    for name in [
        header::CONNECTION,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-connection"),
    ] {
        headers.remove(name);
    }
    if let Ok(value) = HeaderValue::from_str(&http_host) {
        headers.insert("x-forwarded-host", value);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
    if let Some(user) = user {
        if let Ok(value) = HeaderValue::from_str(&user.email) {
            headers.insert("x-forwarded-email", value);
        }
    }
    if !headers.contains_key(header::USER_AGENT) {
        // Explicitly blank so the transport does not add a default.
        headers.insert(header::USER_AGENT, HeaderValue::from_static(""));
    }

    let mut outgoing_host = backend.host().to_string();
    for rule in backend.headers() {
        if rule.name.eq_ignore_ascii_case("host") {
            outgoing_host = evaluate(&rule.value, &variables);
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(rule.name.as_bytes()) else {
            continue;
        };
        if rule.value.is_empty() {
            headers.remove(&name);
        } else if let Ok(value) = HeaderValue::from_str(&evaluate(&rule.value, &variables)) {
            headers.insert(name, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&outgoing_host) {
        headers.insert(header::HOST, value);
    }

    let mut out_req = match Uri::try_from(path_and_query.as_str()) {
        Ok(uri) => Request::builder().method(parts.method).uri(uri),
        Err(_) => return (StatusCode::BAD_REQUEST, "Bad request path").into_response(),
    };
    if let Some(h) = out_req.headers_mut() {
        *h = headers;
    }
    let out_req = match out_req.body(body) {
        Ok(req) => req,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await
    {
        Ok(pair) => pair,
        Err(e) => {
            return connection_error(
                &http_host,
                &backend,
                ubergang_common::Error::Internal(e.to_string()),
            )
        }
    };
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection ended: {e}");
        }
    });

    match tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, sender.send_request(out_req)).await {
        Ok(Ok(response)) => response.map(Body::new),
        Ok(Err(e)) => connection_error(
            &http_host,
            &backend,
            ubergang_common::Error::Internal(e.to_string()),
        ),
        Err(_) => connection_error(
            &http_host,
            &backend,
            ubergang_common::Error::Internal("response header timeout".into()),
        ),
    }
}

fn connection_error(host: &str, backend: &Backend, e: ubergang_common::Error) -> Response {
    metrics::counter!(
        "ubergang_backend_connection_errors_total",
        "host" => host.to_string(),
        "backend" => backend.url().host_str().unwrap_or_default().to_string(),
    )
    .increment(1);
    warn!("Failed to connect to backend {}: {e}", backend.url());
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Failed to connect to backend",
    )
        .into_response()
}

/// Upstreams are under the operator's control and commonly self-signed, so
/// certificate verification is skipped on purpose.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

async fn upstream_tls(stream: BoxedStream, host: &str) -> ubergang_common::Result<BoxedStream> {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| ubergang_common::Error::Internal(format!("bad upstream host: {host}")))?;
    let tls = tokio::time::timeout(UPSTREAM_TLS_TIMEOUT, connector.connect(server_name, stream))
        .await
        .map_err(|_| ubergang_common::Error::Internal("upstream TLS timeout".into()))?
        .map_err(|e| ubergang_common::Error::Internal(format!("upstream TLS: {e}")))?;
    Ok(Box::new(tls))
}
