//! WebAuthn engine.
//!
//! Wraps `webauthn_rs` with the gateway's persistence model: challenge
//! states are serialized into single-consume `AuthenticationState` records
//! keyed by UUIDv7, passkeys live inside `Credential` records addressed by
//! sid (the first 144 bits of SHA-256 over the raw credential id), and the
//! passwordless flow carries its challenge state in a short-lived HS256 JWT
//! instead of the store.

pub mod aaguid;

use aaguid::AaguidTable;
use chrono::{Duration, Utc};
use data_encoding::BASE64URL_NOPAD;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ubergang_common::{
    AuthStateKind, AuthenticationState, Configuration, Credential, Db, Error, Result, Session,
    User,
};
use webauthn_rs::prelude::*;

pub struct WebauthnEngine {
    webauthn: Webauthn,
    db: Db,
    aaguid: AaguidTable,
    jwt_encoding: EncodingKey,
    jwt_decoding: DecodingKey,
}

/// Claims of the passwordless sign-in JWT: the serialized discoverable
/// authentication state rides along so no server-side record is needed.
#[derive(Serialize, Deserialize)]
struct PasswordlessClaims {
    exp: i64,
    state: serde_json::Value,
}

impl WebauthnEngine {
    pub fn new(config: &Configuration, db: Db) -> Result<Self> {
        // Keep the domain, strip the port.
        let rp_id = config
            .admin_fqdn
            .split(':')
            .next()
            .unwrap_or(&config.admin_fqdn);
        let origin = Url::parse(&format!("https://{}", config.admin_fqdn))
            .map_err(|e| Error::InvalidConfig(format!("bad admin FQDN: {e}")))?;
        let webauthn = WebauthnBuilder::new(rp_id, &origin)
            .map_err(|e| Error::InvalidConfig(format!("WebAuthn builder: {e}")))?
            .rp_name("ubergang")
            .build()
            .map_err(|e| Error::InvalidConfig(format!("WebAuthn build: {e}")))?;

        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);

        Ok(Self {
            webauthn,
            db,
            aaguid: AaguidTable::bundled(),
            jwt_encoding: EncodingKey::from_secret(&secret),
            jwt_decoding: DecodingKey::from_secret(&secret),
        })
    }

    pub fn aaguid_table(&self) -> &AaguidTable {
        &self.aaguid
    }

    /// sid: base64url of the first 18 bytes of SHA-256(credential id).
    pub fn credential_sid(credential_id: &[u8]) -> String {
        BASE64URL_NOPAD.encode(&Sha256::digest(credential_id)[..18])
    }

    /// Stable engine-side user handle derived from the opaque user id.
    fn webauthn_user_id(user_id: &str) -> Uuid {
        let digest = Sha256::digest(user_id.as_bytes());
        Uuid::from_slice(&digest[..16]).expect("digest is long enough")
    }

    fn passkeys(credentials: &[Credential]) -> Vec<Passkey> {
        credentials
            .iter()
            .filter_map(|c| serde_json::from_value(c.passkey.clone()).ok())
            .collect()
    }

    fn fresh_state_id(&self) -> Uuid {
        Uuid::now_v7()
    }

    // ------------------------------------------------------------------------
    // Enrollment
    // ------------------------------------------------------------------------

    /// Build a registration challenge excluding the user's existing
    /// credentials, and persist the matching `Enroll` state.
    pub fn start_enroll(
        &self,
        user: &User,
        session_id: &str,
        credentials: &[Credential],
    ) -> Result<(String, CreationChallengeResponse)> {
        let exclude: Vec<CredentialID> = Self::passkeys(credentials)
            .iter()
            .map(|p| p.cred_id().clone())
            .collect();
        let (ccr, reg_state) = self
            .webauthn
            .start_passkey_registration(
                Self::webauthn_user_id(&user.id),
                &user.email,
                &user.display_name,
                Some(exclude),
            )
            .map_err(|e| Error::Internal(format!("registration start failed: {e}")))?;

        let state_id = self.fresh_state_id();
        self.db.store_authentication_state(
            &state_id,
            &AuthenticationState {
                user_id: user.id.clone(),
                expires_at: Utc::now() + Duration::minutes(5),
                kind: AuthStateKind::Enroll {
                    session_id: session_id.to_string(),
                },
                registration: Some(serde_json::to_value(&reg_state)?),
                authentication: None,
            },
        )?;
        Ok((state_id.to_string(), ccr))
    }

    /// Parse the attestation and build the credential record. The caller
    /// performs the atomic insert.
    pub fn finish_enroll(
        &self,
        user: &User,
        session: &Session,
        state: &AuthenticationState,
        reg: &RegisterPublicKeyCredential,
    ) -> Result<Credential> {
        if state.expires_at < Utc::now() {
            return Err(Error::InvalidToken);
        }
        let reg_state: PasskeyRegistration = serde_json::from_value(
            state
                .registration
                .clone()
                .ok_or(Error::InvalidToken)?,
        )?;
        let passkey = self
            .webauthn
            .finish_passkey_registration(reg, &reg_state)
            .map_err(|e| Error::NotAuthorized(format!("registration failed: {e}")))?;

        let aaguid = aaguid::extract_aaguid(reg.response.attestation_object.as_ref())
            .map(|bytes| aaguid::format_aaguid(&bytes))
            .unwrap_or_default();
        let transports = reg
            .response
            .transports
            .clone()
            .unwrap_or_default()
            .iter()
            .map(|t| format!("{t:?}").to_ascii_lowercase())
            .collect();

        let now = Utc::now();
        Ok(Credential {
            id: Self::credential_sid(passkey.cred_id().as_ref()),
            user_id: user.id.clone(),
            name: self.aaguid.resolve_name(&aaguid),
            created_at: now,
            last_used_at: now,
            created_by_session_id: session.id.clone(),
            used_by_session_ids: vec![session.id.clone()],
            passkey: serde_json::to_value(&passkey)?,
            transports,
            aaguid,
            sign_count: 0,
            clone_warning: false,
        })
    }

    // ------------------------------------------------------------------------
    // Assertions
    // ------------------------------------------------------------------------

    /// Build an assertion challenge restricted to the given credentials and
    /// persist the state with the caller-supplied kind.
    pub fn start_assertion(
        &self,
        user: &User,
        credentials: &[Credential],
        kind: AuthStateKind,
    ) -> Result<(String, RequestChallengeResponse)> {
        let passkeys = Self::passkeys(credentials);
        if passkeys.is_empty() {
            return Err(Error::not_found("credentials", user.id.clone()));
        }
        let (rcr, auth_state) = self
            .webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|e| Error::Internal(format!("auth start failed: {e}")))?;

        let state_id = self.fresh_state_id();
        self.db.store_authentication_state(
            &state_id,
            &AuthenticationState {
                user_id: user.id.clone(),
                expires_at: Utc::now() + Duration::minutes(5),
                kind,
                registration: None,
                authentication: Some(serde_json::to_value(&auth_state)?),
            },
        )?;
        Ok((state_id.to_string(), rcr))
    }

    /// Verify an assertion against a previously stored state.
    pub fn validate_assertion(
        &self,
        state: &AuthenticationState,
        cred: &PublicKeyCredential,
    ) -> Result<AuthenticationResult> {
        if state.expires_at < Utc::now() {
            return Err(Error::InvalidToken);
        }
        let auth_state: PasskeyAuthentication = serde_json::from_value(
            state
                .authentication
                .clone()
                .ok_or(Error::InvalidToken)?,
        )?;
        self.webauthn
            .finish_passkey_authentication(cred, &auth_state)
            .map_err(|e| Error::NotAuthorized(format!("assertion failed: {e}")))
    }

    // ------------------------------------------------------------------------
    // Passwordless (resident key) sign-in
    // ------------------------------------------------------------------------

    /// Challenge for a discoverable-credential sign-in. The state is signed
    /// into the returned JWT; nothing persists server-side.
    pub fn start_passwordless(&self) -> Result<(String, RequestChallengeResponse)> {
        let (rcr, state) = self
            .webauthn
            .start_discoverable_authentication()
            .map_err(|e| Error::Internal(format!("auth start failed: {e}")))?;
        let claims = PasswordlessClaims {
            exp: (Utc::now() + Duration::minutes(5)).timestamp(),
            state: serde_json::to_value(&state)?,
        };
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &claims,
            &self.jwt_encoding,
        )
        .map_err(|e| Error::Crypto(format!("JWT signing failed: {e}")))?;
        Ok((token, rcr))
    }

    /// Complete a discoverable sign-in: the credential id inside the
    /// assertion locates the user via the sid-addressed credential store.
    pub fn finish_passwordless(
        &self,
        token: &str,
        cred: &PublicKeyCredential,
    ) -> Result<(User, Vec<Credential>, AuthenticationResult)> {
        let claims = jsonwebtoken::decode::<PasswordlessClaims>(
            token,
            &self.jwt_decoding,
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|_| Error::InvalidToken)?
        .claims;
        let state: DiscoverableAuthentication = serde_json::from_value(claims.state)?;

        let (_user_handle, cred_id) = self
            .webauthn
            .identify_discoverable_authentication(cred)
            .map_err(|_| Error::InvalidToken)?;
        let sid = Self::credential_sid(cred_id);
        let credential = self.db.get_credential(&sid)?;
        let user = self.db.get_user_by_id(&credential.user_id)?;
        let credentials = self.db.list_credentials(&user.id);

        let keys: Vec<DiscoverableKey> = Self::passkeys(&credentials)
            .iter()
            .map(DiscoverableKey::from)
            .collect();
        let result = self
            .webauthn
            .finish_discoverable_authentication(cred, state, &keys)
            .map_err(|e| Error::NotAuthorized(format!("assertion failed: {e}")))?;
        Ok((user, credentials, result))
    }

    // ------------------------------------------------------------------------
    // Credential bookkeeping
    // ------------------------------------------------------------------------

    /// Record a successful assertion on the matching credential: bump usage
    /// timestamps, sign count, clone warning, and the sessions that used it.
    /// Returns the credential sid.
    pub fn note_credential_used(
        &self,
        result: &AuthenticationResult,
        session_id: &str,
    ) -> Result<String> {
        let sid = Self::credential_sid(result.cred_id().as_ref());
        let counter = result.counter();
        let session_id = session_id.to_string();
        let missing_sid = sid.clone();
        self.db.update_credential(&sid, move |old| {
            let mut cred = old.ok_or_else(|| Error::not_found("credential", missing_sid.clone()))?;
            if let Ok(mut passkey) = serde_json::from_value::<Passkey>(cred.passkey.clone()) {
                passkey.update_credential(result);
                cred.passkey = serde_json::to_value(&passkey)?;
            }
            if counter > 0 && counter <= cred.sign_count {
                cred.clone_warning = true;
            }
            cred.sign_count = counter;
            cred.last_used_at = Utc::now();
            if !cred.used_by_session_ids.contains(&session_id) {
                cred.used_by_session_ids.push(session_id.clone());
            }
            Ok(Some(cred))
        })?;
        Ok(sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_sid_is_144_bits_base64url() {
        let sid = WebauthnEngine::credential_sid(b"some-credential-id");
        // 18 bytes without padding encode to 24 characters.
        assert_eq!(sid.len(), 24);
        assert_eq!(sid, WebauthnEngine::credential_sid(b"some-credential-id"));
        assert_ne!(sid, WebauthnEngine::credential_sid(b"other-credential-id"));
    }

    #[test]
    fn test_webauthn_user_id_is_stable() {
        let a = WebauthnEngine::webauthn_user_id("u1");
        let b = WebauthnEngine::webauthn_user_id("u1");
        let c = WebauthnEngine::webauthn_user_id("u2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
