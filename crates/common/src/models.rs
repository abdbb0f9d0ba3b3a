//! Persisted entities.
//!
//! Every record lives in the single logical bucket of [`crate::db::Db`],
//! addressed by an ASCII key with a typed prefix. Values are the JSON
//! encoding of these types; the encoding is confined to the store so callers
//! only ever see the typed forms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Singleton server configuration (key `config`). Absent until bootstrap
/// completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub site_fqdn: String,
    #[serde(default)]
    pub admin_fqdn: String,
    #[serde(default)]
    pub test_mode: bool,
}

impl Configuration {
    /// Bootstrap is complete once all three identity fields are present.
    pub fn is_configured(&self) -> bool {
        !self.email.is_empty() && !self.site_fqdn.is_empty() && !self.admin_fqdn.is_empty()
    }
}

/// An in-flight or completed sign-in handshake, embedded in [`User`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigninRequest {
    pub id: String,
    /// Six decimal digits for the cross-device flow; empty for plain tokens.
    #[serde(default)]
    pub pin: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub ip: String,
}

/// User record (key `user:<id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub signin_requests: Vec<SigninRequest>,
}

/// WebAuthn credential (key `cred:<sid>`), where sid is the base64url form
/// of the first 18 bytes of SHA-256(credential-id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by_session_id: String,
    #[serde(default)]
    pub used_by_session_ids: Vec<String>,
    /// Serialized `webauthn_rs` passkey: credential id, COSE public key,
    /// counter and backup flags.
    pub passkey: serde_json::Value,
    #[serde(default)]
    pub transports: Vec<String>,
    /// Authenticator AAGUID in canonical hyphenated form, empty if unknown.
    #[serde(default)]
    pub aaguid: String,
    #[serde(default)]
    pub sign_count: u32,
    #[serde(default)]
    pub clone_warning: bool,
}

/// Browser session (key `sess:<id>`). The cookie value is `<id>:<secret>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub secret: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub remote_addr: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub accessed_at: Option<DateTime<Utc>>,
}

/// Stored SSH public key (key `ssh-key:<id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKey {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Set by WebAuthn confirmation; key validity derives from this plus
    /// [`SshKey::VALIDITY`].
    #[serde(default)]
    pub confirmed_at: Option<DateTime<Utc>>,
    /// argon2id hash of the shared secret presented on the first proposal.
    #[serde(default)]
    pub hashed_secret: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub sha256_fingerprint: Vec<u8>,
}

impl SshKey {
    /// How long a confirmation is honored before the key must be renewed.
    pub fn validity() -> chrono::Duration {
        chrono::Duration::days(90)
    }

    /// The deadline after which the key is treated as expired. Reported on
    /// the wire as `expiresAt`.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.confirmed_at.map(|t| t + Self::validity())
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map(|t| now < t).unwrap_or(false)
    }
}

/// Who may reach a backend through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessLevel {
    Public,
    Normal,
}

impl Default for AccessLevel {
    fn default() -> Self {
        Self::Normal
    }
}

/// A header rewrite rule applied to proxied requests. An empty value deletes
/// the header; values starting with `$` are substituted from the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Reverse-proxy target (key `be:<fqdn>`, fqdn lowercased).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub fqdn: String,
    pub upstream_url: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub access_level: AccessLevel,
    /// Optional request interceptor script, compiled on resolve.
    #[serde(default)]
    pub script: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// MQTT access profile (key `mqtt-profile:<id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttProfile {
    pub id: String,
    #[serde(default)]
    pub allow_publish: Vec<String>,
    #[serde(default)]
    pub allow_subscribe: Vec<String>,
}

/// MQTT client account (key `mqtt-client:<id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttClient {
    pub id: String,
    pub profile_id: String,
    /// Cleartext by design: the proxy compares it byte-for-byte against the
    /// CONNECT password.
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub values: HashMap<String, String>,
}

/// Which confirmation a stored challenge is bound to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthStateKind {
    Enroll { session_id: String },
    SignIn,
    ConfirmSignin {
        signin_request_id: String,
        session_id: String,
    },
    ConfirmSshKey { ssh_key_id: String },
}

/// Short-lived proof-of-intent (key `auth-state:<uuidv7>`), consumed exactly
/// once by the correlated confirmation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationState {
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub kind: AuthStateKind,
    /// Opaque serialized registration state from the WebAuthn engine.
    #[serde(default)]
    pub registration: Option<serde_json::Value>,
    /// Opaque serialized assertion state from the WebAuthn engine.
    #[serde(default)]
    pub authentication: Option<serde_json::Value>,
}
