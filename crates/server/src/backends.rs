//! Backend resolution: persistent records from the store plus the ephemeral
//! overlay that the SSH server populates with roaming backends.

use parking_lot::RwLock;
use russh::server::Handle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use ubergang_common::{AccessLevel, Db, Error, Header, Result};
use url::Url;

/// Anything the proxy can read from and write to.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// A resolved reverse-proxy target.
#[derive(Clone)]
pub enum Backend {
    Persistent(PersistentBackend),
    Roaming(RoamingBackend),
    /// The local dev frontend used with `--local-dev`.
    DevFrontend,
}

#[derive(Clone)]
pub struct PersistentBackend {
    pub host: String,
    pub url: Url,
    pub headers: Vec<Header>,
    pub needs_auth: bool,
    pub script: Option<String>,
}

/// A backend published at runtime by an SSH reverse forward. Dialing opens a
/// `forwarded-tcpip` channel back over the owning SSH connection.
#[derive(Clone)]
pub struct RoamingBackend {
    pub id: u64,
    pub host: String,
    pub bind_addr: String,
    handle: Handle,
}

impl RoamingBackend {
    pub fn new(id: u64, host: String, bind_addr: String, handle: Handle) -> Self {
        Self {
            id,
            host,
            bind_addr,
            handle,
        }
    }
}

impl Backend {
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Persistent(_) => "local",
            Backend::Roaming(_) => "roaming",
            Backend::DevFrontend => "dev-frontend",
        }
    }

    pub fn host(&self) -> &str {
        match self {
            Backend::Persistent(b) => &b.host,
            Backend::Roaming(b) => &b.host,
            Backend::DevFrontend => "localhost",
        }
    }

    pub fn url(&self) -> Url {
        match self {
            Backend::Persistent(b) => b.url.clone(),
            Backend::Roaming(b) => Url::parse(&format!("http://{}", b.host))
                .expect("roaming host forms a valid URL"),
            Backend::DevFrontend => Url::parse("http://localhost:5173").unwrap(),
        }
    }

    pub fn needs_auth(&self) -> bool {
        match self {
            Backend::Persistent(b) => b.needs_auth,
            Backend::Roaming(_) => true,
            Backend::DevFrontend => false,
        }
    }

    pub fn headers(&self) -> &[Header] {
        match self {
            Backend::Persistent(b) => &b.headers,
            _ => &[],
        }
    }

    pub fn script(&self) -> Option<&str> {
        match self {
            Backend::Persistent(b) => b.script.as_deref(),
            _ => None,
        }
    }

    /// Open a byte stream to the upstream.
    pub async fn dial(&self) -> Result<BoxedStream> {
        match self {
            Backend::Persistent(b) => dial_url(&b.url).await,
            Backend::DevFrontend => dial_url(&self.url()).await,
            Backend::Roaming(b) => {
                let channel = b
                    .handle
                    .channel_open_forwarded_tcpip(
                        b.bind_addr.clone(),
                        80,
                        "127.0.0.1".to_string(),
                        0,
                    )
                    .await
                    .map_err(|e| {
                        warn!("Failed to open forwarded channel: {e:?}");
                        Error::Internal("failed to open SSH channel".into())
                    })?;
                Ok(Box::new(channel.into_stream()))
            }
        }
    }
}

async fn dial_url(url: &Url) -> Result<BoxedStream> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidConfig(format!("upstream URL without host: {url}")))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "https" { 443 } else { 80 });
    let address = format!("{host}:{port}");
    debug!("Dialing upstream {address}");
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&address))
        .await
        .map_err(|_| Error::Internal(format!("dial timeout: {address}")))?
        .map_err(Error::Io)?;
    stream.set_nodelay(true).ok();
    Ok(Box::new(stream))
}

/// Maps `Host` to a backend. Persistent records live in the store; roaming
/// entries are kept in an in-memory overlay consulted on store misses.
#[derive(Clone)]
pub struct BackendRegistry {
    db: Db,
    ephemeral: Arc<RwLock<HashMap<String, RoamingBackend>>>,
    next_id: Arc<AtomicU64>,
}

impl BackendRegistry {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            ephemeral: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_roaming_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve `host` (with or without port) to a backend. The script is
    /// syntax-checked here so a broken script fails the resolve, not the
    /// request.
    pub fn lookup(&self, host: &str) -> Result<Backend> {
        let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();

        match self.db.get_backend(&host) {
            Ok(record) => {
                let url = Url::parse(&record.upstream_url).map_err(|e| {
                    Error::InvalidConfig(format!("bad upstream URL for {host}: {e}"))
                })?;
                let script = if record.script.is_empty() {
                    None
                } else {
                    crate::scripting::check_script(&record.script)?;
                    Some(record.script.clone())
                };
                Ok(Backend::Persistent(PersistentBackend {
                    host,
                    url,
                    headers: record.headers,
                    needs_auth: record.access_level != AccessLevel::Public,
                    script,
                }))
            }
            Err(err) => {
                if let Some(b) = self.ephemeral.read().get(&host) {
                    return Ok(Backend::Roaming(b.clone()));
                }
                Err(err)
            }
        }
    }

    pub fn add_ephemeral(&self, backend: RoamingBackend) {
        let mut map = self.ephemeral.write();
        if let Some(old) = map.get(&backend.host) {
            info!("Replacing roaming backend for {} (id {})", old.host, old.id);
        } else {
            info!("Adding roaming backend for {}", backend.host);
        }
        map.insert(backend.host.clone(), backend);
    }

    /// Remove the overlay entry, but only if it is still the same
    /// registration; a newer replacement must not be clobbered.
    pub fn remove_ephemeral(&self, host: &str, id: u64) {
        let mut map = self.ephemeral.write();
        if map.get(host).map(|b| b.id) == Some(id) {
            info!("Removing roaming backend for {host}");
            map.remove(host);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ubergang_common::models::Backend as BackendRecord;

    fn registry_with(fqdn: &str, upstream: &str, level: AccessLevel) -> BackendRegistry {
        let db = Db::open_memory().unwrap();
        let now = Utc::now();
        db.update_backend(fqdn, |_| {
            Ok(Some(BackendRecord {
                fqdn: fqdn.to_string(),
                upstream_url: upstream.to_string(),
                headers: vec![],
                access_level: level,
                script: String::new(),
                created_at: now,
                updated_at: now,
            }))
        })
        .unwrap();
        BackendRegistry::new(db)
    }

    #[test]
    fn test_lookup_strips_port_and_case() {
        let reg = registry_with("web.example.com", "http://10.0.0.1:8080", AccessLevel::Normal);
        let b = reg.lookup("Web.Example.Com:10443").unwrap();
        assert_eq!(b.host(), "web.example.com");
        assert!(b.needs_auth());
    }

    #[test]
    fn test_public_backend_needs_no_auth() {
        let reg = registry_with("pub.example.com", "http://10.0.0.1", AccessLevel::Public);
        assert!(!reg.lookup("pub.example.com").unwrap().needs_auth());
    }

    #[test]
    fn test_miss_is_error() {
        let reg = BackendRegistry::new(Db::open_memory().unwrap());
        assert!(reg.lookup("nope.example.com").is_err());
    }
}
