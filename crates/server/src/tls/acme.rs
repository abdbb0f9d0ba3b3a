//! On-demand ACME certificate manager.
//!
//! Certificates are issued against Let's Encrypt on first use of a hostname,
//! gated by the host policy (admin host, registered backends, or any site
//! subdomain in wildcard mode). ACME state persists in [`CertStorage`], so
//! HTTP-01 challenges can be answered from storage by the plain HTTP
//! listener, and per-name locks keep concurrent handshakes from racing an
//! issuance.

use super::dns::GoogleCloudDns;
use super::self_signed::server_config_from_pem;
use super::storage::CertStorage;
use crate::backends::BackendRegistry;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use parking_lot::RwLock;
use rustls::ServerConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use ubergang_common::{Error, Result};

const CA_DIR: &str = "acme-v02.api.letsencrypt.org-directory";
const ISSUE_TIMEOUT: Duration = Duration::from_secs(120);
const WILDCARD_PREFETCH_TIMEOUT: Duration = Duration::from_secs(300);
const DNS_PROPAGATION_DELAY: Duration = Duration::from_secs(10);

fn cert_path(host: &str) -> String {
    let name = host.replace('*', "wildcard_");
    format!("certificates/{CA_DIR}/{name}/{name}.crt")
}

fn key_path(host: &str) -> String {
    let name = host.replace('*', "wildcard_");
    format!("certificates/{CA_DIR}/{name}/{name}.key")
}

fn challenge_path(host: &str) -> String {
    format!("acme/{CA_DIR}/challenge_tokens/{host}.json")
}

fn account_path() -> String {
    format!("acme/{CA_DIR}/account.json")
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ChallengeRecord {
    #[serde(rename = "type")]
    challenge_type: String,
    token: String,
    #[serde(rename = "keyAuthorization")]
    key_authorization: String,
}

pub struct AcmeManager {
    storage: Arc<CertStorage>,
    email: String,
    site_fqdn: String,
    admin_fqdn: String,
    registry: BackendRegistry,
    dns: Option<GoogleCloudDns>,
    configs: RwLock<HashMap<String, Arc<ServerConfig>>>,
}

impl AcmeManager {
    pub fn new(
        storage: Arc<CertStorage>,
        email: String,
        site_fqdn: String,
        admin_fqdn: String,
        registry: BackendRegistry,
        dns: Option<GoogleCloudDns>,
    ) -> Self {
        Self {
            storage,
            email,
            site_fqdn,
            admin_fqdn,
            registry,
            dns,
            configs: RwLock::new(HashMap::new()),
        }
    }

    pub fn wildcard_mode(&self) -> bool {
        self.dns.is_some()
    }

    /// Is `host` allowed to get a certificate on demand?
    pub fn check_host_policy(&self, host: &str) -> Result<()> {
        if host == self.admin_fqdn {
            return Ok(());
        }
        if self.registry.lookup(host).is_ok() {
            return Ok(());
        }
        if self.wildcard_mode()
            && (host == self.site_fqdn || host.ends_with(&format!(".{}", self.site_fqdn)))
        {
            return Ok(());
        }
        Err(Error::NotAuthorized(format!(
            "the hostname {host} can't be found in the registered list of backends"
        )))
    }

    /// Serve the HTTP-01 key authorization for `host` from storage, if a
    /// challenge is pending. Used by the plain HTTP listener.
    pub fn http01_key_authorization(&self, host: &str) -> Option<String> {
        let raw = self.storage.load(&challenge_path(host)).ok()?;
        let record: ChallengeRecord = serde_json::from_slice(&raw).ok()?;
        (!record.key_authorization.is_empty()).then_some(record.key_authorization)
    }

    /// Resolve a TLS config for the SNI host, issuing a certificate when
    /// needed. Errors surface to the handshake as a closed connection.
    pub async fn config_for(&self, sni: Option<&str>) -> Result<Arc<ServerConfig>> {
        let host = sni
            .map(|s| s.to_ascii_lowercase())
            .ok_or_else(|| Error::NotAuthorized("no SNI in client hello".into()))?;

        if let Some(config) = self.configs.read().get(&host) {
            return Ok(config.clone());
        }

        // Stored certificate for this exact host.
        if let Some(config) = self.load_config(&host)? {
            self.configs.write().insert(host.clone(), config.clone());
            return Ok(config);
        }

        // The wildcard covers first-level subdomains of the site.
        if self.wildcard_mode() && self.covered_by_wildcard(&host) {
            let wildcard = format!("*.{}", self.site_fqdn);
            if let Some(config) = self.load_config(&wildcard)? {
                self.configs.write().insert(host.clone(), config.clone());
                return Ok(config);
            }
        }

        self.check_host_policy(&host)?;
        let config = tokio::time::timeout(ISSUE_TIMEOUT, self.issue(&host))
            .await
            .map_err(|_| Error::Internal(format!("certificate issuance timed out for {host}")))??;
        self.configs.write().insert(host, config.clone());
        Ok(config)
    }

    fn covered_by_wildcard(&self, host: &str) -> bool {
        host.strip_suffix(&format!(".{}", self.site_fqdn))
            .map(|label| !label.is_empty() && !label.contains('.'))
            .unwrap_or(false)
    }

    fn load_config(&self, host: &str) -> Result<Option<Arc<ServerConfig>>> {
        let cert = match self.storage.load(&cert_path(host)) {
            Ok(cert) => cert,
            Err(_) => return Ok(None),
        };
        let key = self.storage.load(&key_path(host))?;
        Ok(Some(server_config_from_pem(&cert, &key)?))
    }

    /// Pre-fetch the wildcard certificate in the background. The server does
    /// not block startup on it; failures fall back to on-demand issuance.
    pub fn prefetch_wildcard(self: &Arc<Self>) {
        if !self.wildcard_mode() {
            return;
        }
        let manager = self.clone();
        let wildcard = format!("*.{}", self.site_fqdn);
        info!("Scheduling wildcard certificate acquisition for: {wildcard}");
        tokio::spawn(async move {
            if manager.load_config(&wildcard).ok().flatten().is_some() {
                info!("Wildcard certificate already present");
                return;
            }
            match tokio::time::timeout(WILDCARD_PREFETCH_TIMEOUT, manager.issue(&wildcard)).await {
                Ok(Ok(_)) => info!("Wildcard certificate obtained for {wildcard}"),
                Ok(Err(e)) => {
                    warn!("Failed to obtain wildcard certificate for {wildcard}: {e}");
                    warn!("Server will use on-demand certificate issuance as fallback");
                }
                Err(_) => warn!("Wildcard certificate acquisition timed out for {wildcard}"),
            }
        });
    }

    async fn account(&self) -> Result<Account> {
        if let Ok(raw) = self.storage.load(&account_path()) {
            let credentials: AccountCredentials = serde_json::from_slice(&raw)?;
            return Account::from_credentials(credentials)
                .await
                .map_err(|e| Error::Internal(format!("ACME account restore failed: {e}")));
        }
        let contact = format!("mailto:{}", self.email);
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            LetsEncrypt::Production.url(),
            None,
        )
        .await
        .map_err(|e| Error::Internal(format!("ACME account creation failed: {e}")))?;
        self.storage
            .store(&account_path(), &serde_json::to_vec(&credentials)?)?;
        Ok(account)
    }

    /// Issue a certificate for `host`, holding the per-name lock across the
    /// whole ACME round-trip.
    async fn issue(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let _guard = self.storage.lock(host).await;

        // Someone else may have finished while we waited on the lock.
        if let Some(config) = self.load_config(host)? {
            return Ok(config);
        }
        info!("Obtaining certificate for {host}");

        let account = self.account().await?;
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[Identifier::Dns(host.to_string())],
            })
            .await
            .map_err(|e| Error::Internal(format!("ACME order failed: {e}")))?;

        let wanted = if self.dns.is_some() {
            ChallengeType::Dns01
        } else {
            ChallengeType::Http01
        };

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| Error::Internal(format!("ACME authorizations failed: {e}")))?;

        let mut cleanup: Vec<String> = Vec::new();
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(Error::Internal(format!(
                        "unexpected authorization status: {status:?}"
                    )))
                }
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == wanted)
                .ok_or_else(|| Error::Internal("CA offered no usable challenge".into()))?;
            let key_auth = order.key_authorization(challenge);

            match &self.dns {
                Some(dns) => {
                    let record = format!(
                        "_acme-challenge.{}",
                        host.trim_start_matches("*.")
                    );
                    dns.set_txt_record(&record, &key_auth.dns_value()).await?;
                    cleanup.push(record);
                    tokio::time::sleep(DNS_PROPAGATION_DELAY).await;
                }
                None => {
                    let record = ChallengeRecord {
                        challenge_type: "http-01".into(),
                        token: challenge.token.clone(),
                        key_authorization: key_auth.as_str().to_string(),
                    };
                    self.storage
                        .store(&challenge_path(host), &serde_json::to_vec(&record)?)?;
                    cleanup.push(challenge_path(host));
                }
            }

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| Error::Internal(format!("ACME challenge ready failed: {e}")))?;
        }

        let result = self.finalize(host, &mut order).await;

        for entry in cleanup {
            match &self.dns {
                Some(dns) => {
                    let _ = dns.clear_txt_record(&entry).await;
                }
                None => {
                    let _ = self.storage.delete(&entry);
                }
            }
        }

        result
    }

    async fn finalize(
        &self,
        host: &str,
        order: &mut instant_acme::Order,
    ) -> Result<Arc<ServerConfig>> {
        let mut delay = Duration::from_millis(500);
        let mut tries = 0;
        loop {
            tokio::time::sleep(delay).await;
            let status = order
                .refresh()
                .await
                .map_err(|e| Error::Internal(format!("ACME order refresh failed: {e}")))?
                .status;
            match status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    return Err(Error::Internal(format!("ACME order invalid for {host}")))
                }
                _ => {
                    tries += 1;
                    if tries > 20 {
                        return Err(Error::Internal(format!(
                            "ACME order not ready for {host} after {tries} polls"
                        )));
                    }
                    delay = (delay * 2).min(Duration::from_secs(10));
                }
            }
        }

        let mut params = rcgen::CertificateParams::new(vec![host.to_string()])
            .map_err(|e| Error::Crypto(format!("CSR params: {e}")))?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| Error::Crypto(format!("CSR key generation: {e}")))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| Error::Crypto(format!("CSR serialization: {e}")))?;
        order
            .finalize(csr.der())
            .await
            .map_err(|e| Error::Internal(format!("ACME finalize failed: {e}")))?;

        let cert_chain = loop {
            match order
                .certificate()
                .await
                .map_err(|e| Error::Internal(format!("ACME certificate fetch failed: {e}")))?
            {
                Some(pem) => break pem,
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };

        self.storage.store(&cert_path(host), cert_chain.as_bytes())?;
        self.storage
            .store(&key_path(host), key_pair.serialize_pem().as_bytes())?;
        info!("Certificate obtained for {host}");
        server_config_from_pem(cert_chain.as_bytes(), key_pair.serialize_pem().as_bytes())
    }
}
