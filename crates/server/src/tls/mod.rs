//! TLS certificate management.
//!
//! Three modes, chosen at startup: bootstrap (persisted self-signed
//! certificate while the server is unconfigured), test mode (fresh
//! self-signed), and production (on-demand ACME). The same manager feeds the
//! HTTPS listener and the MQTT-TLS listener.

pub mod acme;
pub mod dns;
pub mod self_signed;
pub mod storage;

use crate::backends::BackendRegistry;
use acme::AcmeManager;
use dns::GoogleCloudDns;
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Duration;
use storage::CertStorage;
use tokio::net::TcpStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::info;
use ubergang_common::{Configuration, Db, Error, Result};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub enum TlsManager {
    SelfSigned(Arc<ServerConfig>),
    Acme(Arc<AcmeManager>),
}

impl TlsManager {
    /// Pick the mode from the stored configuration, mirroring startup:
    /// unconfigured servers bootstrap with a persisted self-signed cert,
    /// test mode always self-signs, production goes through ACME.
    pub fn build(db: &Db, config: &Configuration, registry: BackendRegistry) -> Result<Arc<Self>> {
        if !config.is_configured() {
            info!("Server not configured - entering bootstrap mode with self-signed certificate");
            let (cert_pem, key_pem) = match db.get_self_signed_cert() {
                Ok(pair) => {
                    info!("Using existing bootstrap certificate from database");
                    pair
                }
                Err(_) => {
                    info!("Generating new bootstrap certificate");
                    let (cert_pem, key_pem) = self_signed::generate()?;
                    db.update_self_signed_cert(&cert_pem, &key_pem)?;
                    (cert_pem, key_pem)
                }
            };
            let config = self_signed::server_config_from_pem(&cert_pem, &key_pem)?;
            return Ok(Arc::new(TlsManager::SelfSigned(config)));
        }

        if config.test_mode {
            info!("Using self-signed certs (test mode)");
            let (cert_pem, key_pem) = self_signed::generate()?;
            let config = self_signed::server_config_from_pem(&cert_pem, &key_pem)?;
            return Ok(Arc::new(TlsManager::SelfSigned(config)));
        }

        let dns = match GoogleCloudDns::from_env() {
            Some(Ok(dns)) => {
                info!(
                    "Using LetsEncrypt certificates with DNS-01 (wildcard for *.{})",
                    config.site_fqdn
                );
                Some(dns)
            }
            Some(Err(e)) => {
                tracing::warn!("Failed to load DNS credentials: {e}; falling back to HTTP-01");
                None
            }
            None => {
                info!("Using LetsEncrypt certificates with HTTP-01");
                None
            }
        };

        let manager = Arc::new(AcmeManager::new(
            Arc::new(CertStorage::new(db.clone())),
            config.email.clone(),
            config.site_fqdn.clone(),
            config.admin_fqdn.clone(),
            registry,
            dns,
        ));
        manager.prefetch_wildcard();
        Ok(Arc::new(TlsManager::Acme(manager)))
    }

    /// TLS config for a handshake with the given SNI.
    pub async fn server_config_for(&self, sni: Option<&str>) -> Result<Arc<ServerConfig>> {
        match self {
            TlsManager::SelfSigned(config) => Ok(config.clone()),
            TlsManager::Acme(manager) => manager.config_for(sni).await,
        }
    }

    /// Accept a TLS connection, resolving the certificate from the client
    /// hello. Certificate errors surface as a failed handshake.
    pub async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<tokio_rustls::server::TlsStream<TcpStream>> {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor)
            .await
            .map_err(|_| Error::Internal("TLS client hello timeout".into()))?
            .map_err(|e| Error::Internal(format!("TLS accept: {e}")))?;
        let sni = start.client_hello().server_name().map(|s| s.to_string());
        let config = self.server_config_for(sni.as_deref()).await?;
        tokio::time::timeout(HANDSHAKE_TIMEOUT, start.into_stream(config))
            .await
            .map_err(|_| Error::Internal("TLS handshake timeout".into()))?
            .map_err(|e| Error::Internal(format!("TLS handshake: {e}")))
    }

    /// HTTP-01 key authorization lookup for the plain HTTP listener.
    pub fn http01_key_authorization(&self, host: &str) -> Option<String> {
        match self {
            TlsManager::SelfSigned(_) => None,
            TlsManager::Acme(manager) => manager.http01_key_authorization(host),
        }
    }
}
