//! JSON wire types for the admin API.
//!
//! Sign-in flows report domain failures as 200 responses with a typed error
//! envelope so the API does not leak which part failed. WebAuthn challenge
//! and credential payloads use the engine's standard W3C JSON forms.

use chrono::{DateTime, SecondsFormat, Utc};
use data_encoding::BASE64URL_NOPAD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use ubergang_common::{AccessLevel, Backend, Credential, MqttClient, MqttProfile, Session, SshKey};
use webauthn_rs::prelude::{PublicKeyCredential, RegisterPublicKeyCredential};

pub fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ----------------------------------------------------------------------------
// Enrollment
// ----------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StartEnrollResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(rename = "enrollRequest", skip_serializing_if = "Option::is_none")]
    pub enroll_request: Option<EnrollRequest>,
}

#[derive(Serialize)]
pub struct EnrollRequest {
    pub token: String,
    pub options: Value,
}

#[derive(Deserialize)]
pub struct FinishEnrollRequest {
    pub token: String,
    pub credential: RegisterPublicKeyCredential,
}

#[derive(Serialize)]
pub struct FinishEnrollResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<ApiCredential>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FinishEnrollError>,
}

#[derive(Serialize)]
pub struct FinishEnrollError {
    #[serde(rename = "invalidEnrollment")]
    pub invalid_enrollment: bool,
}

// ----------------------------------------------------------------------------
// Sign-in
// ----------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StartSigninResponse {
    pub token: String,
    #[serde(rename = "assertionRequest")]
    pub assertion_request: Value,
}

#[derive(Deserialize)]
pub struct SigninEmailRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub redirect: String,
}

#[derive(Default, Serialize)]
pub struct SigninEmailError {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub wrong_email: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub no_credentials: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub internal_error: bool,
}

#[derive(Serialize)]
pub struct SigninEmailSuccess {
    pub token: String,
    #[serde(rename = "assertionRequest")]
    pub assertion_request: Value,
}

#[derive(Serialize)]
pub struct SigninEmailResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SigninEmailError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<SigninEmailSuccess>,
}

#[derive(Deserialize)]
pub struct SigninWebauthnRequest {
    pub token: String,
    pub credential: PublicKeyCredential,
    #[serde(default)]
    pub redirect: String,
}

#[derive(Default, Serialize)]
pub struct SigninWebauthnError {
    #[serde(rename = "internalError", skip_serializing_if = "std::ops::Not::not")]
    pub internal_error: bool,
    #[serde(rename = "invalidCredential", skip_serializing_if = "std::ops::Not::not")]
    pub invalid_credential: bool,
}

#[derive(Serialize)]
pub struct SigninSuccess {
    pub cookie: String,
    pub redirect: String,
}

#[derive(Serialize)]
pub struct SigninWebauthnResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SigninWebauthnError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<SigninSuccess>,
}

// ----------------------------------------------------------------------------
// PIN flow
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SigninPinRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "userAgent")]
    pub user_agent: String,
}

#[derive(Serialize)]
pub struct SigninPinRequestResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SigninPinRequestError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Serialize)]
pub struct SigninPinRequestError {
    #[serde(rename = "invalidEmail")]
    pub invalid_email: bool,
}

#[derive(Deserialize)]
pub struct SigninPinPollRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub redirect: String,
}

#[derive(Default, Serialize)]
pub struct SigninPinPollError {
    #[serde(rename = "internalError", skip_serializing_if = "std::ops::Not::not")]
    pub internal_error: bool,
    #[serde(rename = "invalidToken", skip_serializing_if = "std::ops::Not::not")]
    pub invalid_token: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub expired: bool,
}

#[derive(Serialize)]
pub struct SigninPinPending {
    pub pin: String,
    pub confirm_url: String,
    pub qr_code_url: String,
}

#[derive(Serialize)]
pub struct SigninPinPollResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SigninPinPollError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<SigninPinPending>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<SigninSuccess>,
}

#[derive(Deserialize)]
pub struct SigninPinQueryRequest {
    #[serde(default)]
    pub pin: String,
}

#[derive(Default, Serialize)]
pub struct SigninPinQueryError {
    #[serde(rename = "invalidPin", skip_serializing_if = "std::ops::Not::not")]
    pub invalid_pin: bool,
    #[serde(rename = "invalidCredentials", skip_serializing_if = "std::ops::Not::not")]
    pub invalid_credentials: bool,
}

#[derive(Default, Serialize)]
pub struct SigninPinQueryResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SigninPinQueryError>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pin: String,
    pub requestor_user_agent: String,
    pub requestor_ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
    pub confirmed: bool,
    #[serde(rename = "assertionRequest", skip_serializing_if = "Option::is_none")]
    pub assertion_request: Option<Value>,
}

#[derive(Deserialize)]
pub struct SigninPinConfirmRequest {
    pub token: String,
    pub credential: PublicKeyCredential,
}

#[derive(Default, Serialize)]
pub struct SigninPinConfirmResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<InvalidEnrollmentError>,
}

#[derive(Serialize)]
pub struct InvalidEnrollmentError {
    #[serde(rename = "invalidEnrollment")]
    pub invalid_enrollment: bool,
}

// ----------------------------------------------------------------------------
// SSH keys
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateSshKeyRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Serialize)]
pub struct CreateSshKeyResponse {
    #[serde(rename = "keyId")]
    pub key_id: String,
}

#[derive(Serialize)]
pub struct ApiSshKey {
    pub id: String,
    pub name: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: String,
    #[serde(rename = "sha256Fingerprint")]
    pub sha256_fingerprint: String,
}

impl From<&SshKey> for ApiSshKey {
    fn from(key: &SshKey) -> Self {
        Self {
            id: key.id.clone(),
            name: key.name.clone(),
            created_at: rfc3339(key.created_at),
            expires_at: key.expires_at().map(rfc3339).unwrap_or_default(),
            sha256_fingerprint: BASE64URL_NOPAD.encode(&key.sha256_fingerprint),
        }
    }
}

#[derive(Deserialize)]
pub struct ProposeSshKeyRequest {
    #[serde(default, rename = "keySecret")]
    pub key_secret: String,
    #[serde(default, rename = "publicKey")]
    pub public_key: String,
}

#[derive(Default, Serialize)]
pub struct ProposeSshKeyResponse {
    #[serde(rename = "confirmUrl", skip_serializing_if = "String::is_empty")]
    pub confirm_url: String,
}

#[derive(Serialize)]
pub struct GetConfirmSshKeyResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GetConfirmSshKeyError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticate: Option<GetConfirmSshKeyAuthenticate>,
}

#[derive(Serialize)]
pub struct GetConfirmSshKeyError {
    #[serde(rename = "invalidKey")]
    pub invalid_key: bool,
}

#[derive(Serialize)]
pub struct GetConfirmSshKeyAuthenticate {
    #[serde(rename = "keyName")]
    pub key_name: String,
    pub token: String,
    #[serde(rename = "assertionRequest")]
    pub assertion_request: Value,
}

#[derive(Deserialize)]
pub struct ConfirmSshKeyRequest {
    pub token: String,
    pub credential: PublicKeyCredential,
}

#[derive(Serialize)]
pub struct ConfirmSshKeyResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ConfirmSshKeyError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ConfirmSshKeyResult>,
}

#[derive(Serialize)]
pub struct ConfirmSshKeyError {
    #[serde(rename = "failedAuthentication")]
    pub failed_authentication: bool,
}

#[derive(Serialize)]
pub struct ConfirmSshKeyResult {
    #[serde(rename = "expiresAt")]
    pub expires_at: String,
}

// ----------------------------------------------------------------------------
// Backends
// ----------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone)]
pub struct ApiBackendHeader {
    pub name: String,
    pub value: String,
}

#[derive(Serialize)]
pub struct ApiBackend {
    pub fqdn: String,
    #[serde(rename = "upstreamUrl")]
    pub upstream_url: String,
    pub headers: Vec<ApiBackendHeader>,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
    #[serde(rename = "accessLevel")]
    pub access_level: String,
    #[serde(rename = "jsScript")]
    pub js_script: String,
}

impl From<&Backend> for ApiBackend {
    fn from(b: &Backend) -> Self {
        Self {
            fqdn: b.fqdn.clone(),
            upstream_url: b.upstream_url.clone(),
            headers: b
                .headers
                .iter()
                .map(|h| ApiBackendHeader {
                    name: h.name.clone(),
                    value: h.value.clone(),
                })
                .collect(),
            created_at: rfc3339(b.created_at),
            updated_at: rfc3339(b.updated_at),
            access_level: match b.access_level {
                AccessLevel::Public => "PUBLIC".to_string(),
                AccessLevel::Normal => "NORMAL".to_string(),
            },
            js_script: b.script.clone(),
        }
    }
}

#[derive(Deserialize)]
pub struct UpdateBackendRequest {
    #[serde(rename = "upstreamUrl")]
    pub upstream_url: Option<String>,
    pub headers: Option<Vec<ApiBackendHeader>>,
    #[serde(rename = "accessLevel")]
    pub access_level: Option<String>,
    #[serde(default, rename = "jsScript")]
    pub js_script: String,
}

#[derive(Serialize)]
pub struct ListBackendsResponse {
    pub backends: Vec<ApiBackend>,
}

// ----------------------------------------------------------------------------
// MQTT administration
// ----------------------------------------------------------------------------

#[derive(Serialize)]
pub struct ApiMqttProfile {
    pub id: String,
    pub allow_publish: Vec<String>,
    pub allow_subscribe: Vec<String>,
}

impl From<&MqttProfile> for ApiMqttProfile {
    fn from(p: &MqttProfile) -> Self {
        Self {
            id: p.id.clone(),
            allow_publish: p.allow_publish.clone(),
            allow_subscribe: p.allow_subscribe.clone(),
        }
    }
}

#[derive(Deserialize)]
pub struct UpdateMqttProfileRequest {
    pub allow_publish: Option<Vec<String>>,
    pub allow_subscribe: Option<Vec<String>>,
}

#[derive(Serialize)]
pub struct ListMqttProfilesResponse {
    pub mqtt_profiles: Vec<ApiMqttProfile>,
}

#[derive(Serialize)]
pub struct ApiMqttConnected {
    #[serde(rename = "remoteAddr")]
    pub remote_addr: String,
    #[serde(rename = "connectedAt")]
    pub connected_at: String,
    #[serde(rename = "connectionType")]
    pub connection_type: String,
}

#[derive(Serialize)]
pub struct ApiMqttDisconnected {
    #[serde(rename = "remoteAddr")]
    pub remote_addr: String,
    #[serde(rename = "disconnectedAt")]
    pub disconnected_at: String,
}

#[derive(Serialize)]
pub struct ApiMqttClient {
    pub id: String,
    pub profile_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    pub values: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<ApiMqttConnected>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected: Option<ApiMqttDisconnected>,
}

impl From<&MqttClient> for ApiMqttClient {
    fn from(c: &MqttClient) -> Self {
        Self {
            id: c.id.clone(),
            profile_id: c.profile_id.clone(),
            password: c.password.clone(),
            values: c.values.clone(),
            connected: None,
            disconnected: None,
        }
    }
}

#[derive(Deserialize)]
pub struct UpdateMqttClientRequest {
    pub id: Option<String>,
    pub profile_id: Option<String>,
    pub password: Option<String>,
    pub values: Option<HashMap<String, String>>,
}

#[derive(Serialize)]
pub struct ListMqttClientsResponse {
    pub mqtt_clients: Vec<ApiMqttClient>,
}

// YAML import/export documents.

#[derive(Serialize, Deserialize)]
pub struct YamlMqttClient {
    pub name: String,
    pub password: String,
    pub profile: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub values: HashMap<String, String>,
}

#[derive(Serialize, Deserialize)]
pub struct YamlMqttProfile {
    pub name: String,
    pub allow_publish: Vec<String>,
    pub allow_subscribe: Vec<String>,
}

#[derive(Serialize, Deserialize)]
pub struct YamlMqttConfig {
    #[serde(default)]
    pub clients: Vec<YamlMqttClient>,
    #[serde(default)]
    pub profiles: Vec<YamlMqttProfile>,
}

// ----------------------------------------------------------------------------
// Credentials, sessions, users
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct UpdateCredentialRequest {
    pub name: Option<String>,
}

#[derive(Serialize)]
pub struct ApiCredential {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub credential_type: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "created_by_session_id")]
    pub created_by: String,
    pub transports: Vec<String>,
    #[serde(rename = "lastUsedAt")]
    pub last_used_at: String,
    #[serde(rename = "used_by_session_ids")]
    pub used_by: Vec<String>,
    pub aaguid: String,
}

impl From<&Credential> for ApiCredential {
    fn from(c: &Credential) -> Self {
        Self {
            id: c.id.clone(),
            name: c.name.clone(),
            credential_type: "webauthn".to_string(),
            created_at: rfc3339(c.created_at),
            created_by: c.created_by_session_id.clone(),
            transports: c.transports.clone(),
            last_used_at: rfc3339(c.last_used_at),
            used_by: c.used_by_session_ids.clone(),
            aaguid: c.aaguid.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct ApiSession {
    pub id: String,
    #[serde(rename = "userAgent")]
    pub user_agent: String,
    #[serde(rename = "remoteAddr")]
    pub remote_addr: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "accessedAt")]
    pub accessed_at: String,
}

impl From<&Session> for ApiSession {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            user_agent: s.user_agent.clone(),
            remote_addr: s.remote_addr.clone(),
            created_at: rfc3339(s.created_at),
            accessed_at: s.accessed_at.map(rfc3339).unwrap_or_default(),
        }
    }
}

#[derive(Serialize)]
pub struct ApiUser {
    pub id: String,
    pub email: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "allowedHosts")]
    pub allowed_hosts: Vec<String>,
    #[serde(rename = "isAdmin")]
    pub is_admin: bool,
    pub credentials: Vec<ApiCredential>,
    pub sessions: Vec<ApiSession>,
    #[serde(rename = "currentSession")]
    pub current_session: Option<ApiSession>,
    #[serde(rename = "sshKeys")]
    pub ssh_keys: Vec<ApiSshKey>,
}

#[derive(Serialize)]
pub struct ListUsersResponse {
    pub users: Vec<ApiUser>,
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    #[serde(default)]
    pub email: String,
}

#[derive(Serialize)]
pub struct CreateUserResponse {
    pub id: String,
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    pub admin: Option<bool>,
    #[serde(rename = "allowedHosts")]
    pub allowed_hosts: Option<Vec<String>>,
}

#[derive(Serialize)]
pub struct UserRecoverResponse {
    #[serde(rename = "recoveryUrl")]
    pub recovery_url: String,
}

// ----------------------------------------------------------------------------
// Bootstrap and testing
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct BootstrapConfigureRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "siteFqdn")]
    pub site_fqdn: String,
}

#[derive(Serialize)]
pub struct BootstrapConfigureResponse {
    pub admin_fqdn: String,
}

#[derive(Serialize)]
pub struct BootstrapStatusResponse {
    #[serde(rename = "isConfigured")]
    pub is_configured: bool,
}

#[derive(Serialize)]
pub struct TestingSetupResponse {
    #[serde(rename = "signinUrl")]
    pub signin_url: String,
}
