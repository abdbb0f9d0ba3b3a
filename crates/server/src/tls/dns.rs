//! DNS-01 solver for Google Cloud DNS.
//!
//! Authenticates with the service account named by
//! `GOOGLE_APPLICATION_CREDENTIALS` (RS256-signed JWT exchanged for an OAuth
//! access token) and manages the `_acme-challenge` TXT records.

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use ubergang_common::{Error, Result};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DNS_SCOPE: &str = "https://www.googleapis.com/auth/ndev.clouddns.readwrite";

#[derive(Deserialize)]
struct ServiceAccount {
    project_id: String,
    client_email: String,
    private_key: String,
}

pub struct GoogleCloudDns {
    project_id: String,
    client_email: String,
    encoding_key: EncodingKey,
    http: reqwest::Client,
}

impl GoogleCloudDns {
    /// Load credentials from `GOOGLE_APPLICATION_CREDENTIALS`. Returns `None`
    /// when the variable is unset (HTTP-01 mode).
    pub fn from_env() -> Option<Result<Self>> {
        let path = std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok()?;
        Some(Self::from_file(&path))
    }

    fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let account: ServiceAccount = serde_json::from_slice(&raw)?;
        let encoding_key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(|e| Error::Crypto(format!("bad service account key: {e}")))?;
        Ok(Self {
            project_id: account.project_id,
            client_email: account.client_email,
            encoding_key,
            http: reqwest::Client::new(),
        })
    }

    async fn access_token(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Claims<'a> {
            iss: &'a str,
            scope: &'a str,
            aud: &'a str,
            iat: i64,
            exp: i64,
        }
        let now = chrono::Utc::now().timestamp();
        let assertion = encode(
            &Header::new(Algorithm::RS256),
            &Claims {
                iss: &self.client_email,
                scope: DNS_SCOPE,
                aud: TOKEN_URL,
                iat: now,
                exp: now + 3600,
            },
            &self.encoding_key,
        )
        .map_err(|e| Error::Crypto(format!("JWT signing failed: {e}")))?;

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }
        let response: TokenResponse = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::Internal(format!("token request failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Internal(format!("token request rejected: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Internal(format!("token response: {e}")))?;
        Ok(response.access_token)
    }

    /// Find the managed zone with the longest dnsName suffix-matching `fqdn`.
    async fn find_zone(&self, token: &str, fqdn: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Zone {
            name: String,
            #[serde(rename = "dnsName")]
            dns_name: String,
        }
        #[derive(Deserialize)]
        struct ZoneList {
            #[serde(default, rename = "managedZones")]
            managed_zones: Vec<Zone>,
        }
        let url = format!(
            "https://dns.googleapis.com/dns/v1/projects/{}/managedZones",
            self.project_id
        );
        let zones: ZoneList = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("zone list failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Internal(format!("zone list rejected: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Internal(format!("zone list response: {e}")))?;

        let lookup = format!("{}.", fqdn.trim_end_matches('.'));
        zones
            .managed_zones
            .into_iter()
            .filter(|z| lookup.ends_with(&z.dns_name))
            .max_by_key(|z| z.dns_name.len())
            .map(|z| z.name)
            .ok_or_else(|| Error::not_found("managed zone", fqdn))
    }

    async fn change(
        &self,
        fqdn: &str,
        additions: Vec<serde_json::Value>,
        delete_existing: bool,
    ) -> Result<()> {
        let token = self.access_token().await?;
        let zone = self.find_zone(&token, fqdn).await?;
        let record_name = format!("{}.", fqdn.trim_end_matches('.'));

        // Look up the current TXT rrset so a re-issue replaces it cleanly.
        let mut deletions = Vec::new();
        if delete_existing {
            let url = format!(
                "https://dns.googleapis.com/dns/v1/projects/{}/managedZones/{}/rrsets?name={}&type=TXT",
                self.project_id, zone, record_name
            );
            if let Ok(response) = self.http.get(&url).bearer_auth(&token).send().await {
                if let Ok(body) = response.json::<serde_json::Value>().await {
                    if let Some(sets) = body.get("rrsets").and_then(|v| v.as_array()) {
                        deletions = sets.to_vec();
                    }
                }
            }
        }

        let url = format!(
            "https://dns.googleapis.com/dns/v1/projects/{}/managedZones/{}/changes",
            self.project_id, zone
        );
        self.http
            .post(&url)
            .bearer_auth(&token)
            .json(&serde_json::json!({
                "additions": additions,
                "deletions": deletions,
            }))
            .send()
            .await
            .map_err(|e| Error::Internal(format!("DNS change failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Internal(format!("DNS change rejected: {e}")))?;
        Ok(())
    }

    pub async fn set_txt_record(&self, fqdn: &str, value: &str) -> Result<()> {
        let record_name = format!("{}.", fqdn.trim_end_matches('.'));
        self.change(
            fqdn,
            vec![serde_json::json!({
                "name": record_name,
                "type": "TXT",
                "ttl": 60,
                "rrdatas": [format!("\"{value}\"")],
            })],
            true,
        )
        .await
    }

    pub async fn clear_txt_record(&self, fqdn: &str) -> Result<()> {
        self.change(fqdn, Vec::new(), true).await
    }
}
