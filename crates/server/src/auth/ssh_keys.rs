//! SSH key lifecycle: create, propose, confirm.
//!
//! A key is created empty, a (possibly unauthenticated) client proposes a
//! public key guarded by a shared secret, and a WebAuthn-confirmed call sets
//! `confirmed_at` which is what makes the key usable by the SSH server.

use super::Auth;
use chrono::{DateTime, Utc};
use data_encoding::BASE64URL_NOPAD;
use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use ubergang_common::{ids, password, Error, Result, SshKey};

/// Generate a new ed25519 host key, PEM-encoded.
pub fn generate_ssh_server_key() -> Result<Vec<u8>> {
    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| Error::Crypto("ed25519 key generation failed".into()))?;
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem)
        .map_err(|e| Error::Crypto(format!("failed to encode SSH host key: {e}")))?;
    Ok(pem)
}

/// SHA-256 over the wire encoding of an OpenSSH `authorized_keys` line.
pub fn fingerprint_public_key(public_key: &str) -> Result<Vec<u8>> {
    let b64 = public_key
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Error::Crypto("malformed public key".into()))?;
    let parsed = russh_keys::parse_public_key_base64(b64)
        .map_err(|e| Error::Crypto(format!("failed to parse public key: {e}")))?;
    Ok(Sha256::digest(parsed.public_key_bytes()).to_vec())
}

impl Auth {
    pub fn create_ssh_key(&self, user_id: &str, name: &str) -> Result<SshKey> {
        let key = SshKey {
            id: ids::make_random_id(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            confirmed_at: None,
            hashed_secret: String::new(),
            public_key: String::new(),
            sha256_fingerprint: Vec::new(),
        };
        let stored = key.clone();
        self.db().update_ssh_key(&key.id, move |old| {
            if old.is_some() {
                return Err(Error::Conflict("ID collision".into()));
            }
            Ok(stored)
        })
    }

    /// Upload a public key. The first proposal stores a hash of the shared
    /// secret; later proposals must present the same secret, which keeps a
    /// drive-by caller from replacing someone else's key.
    pub fn propose_ssh_key(
        &self,
        key_id: &str,
        key_secret: &str,
        public_key: &str,
    ) -> Result<SshKey> {
        let fingerprint = fingerprint_public_key(public_key)?;
        tracing::info!(
            "Updated key {} with pub key fp {}",
            key_id,
            BASE64URL_NOPAD.encode(&fingerprint)
        );
        let public_key = public_key.to_string();
        let key_secret = key_secret.to_string();
        self.db().update_ssh_key(key_id, move |old| {
            let mut key = old.ok_or_else(|| Error::not_found("ssh key", key_id))?;
            if key.hashed_secret.is_empty() {
                key.hashed_secret = password::hash_password(&key_secret)?;
            } else {
                password::check_password(&key.hashed_secret, &key_secret)?;
            }
            key.public_key = public_key;
            key.sha256_fingerprint = fingerprint;
            key.confirmed_at = None;
            Ok(key)
        })
    }

    pub fn confirm_ssh_key(&self, key_id: &str, now: DateTime<Utc>) -> Result<SshKey> {
        self.db().update_ssh_key(key_id, move |old| {
            let mut key = old.ok_or_else(|| Error::not_found("ssh key", key_id))?;
            key.confirmed_at = Some(now);
            Ok(key)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::PublicKeyBase64;
    use ubergang_common::Db;

    fn test_key_line() -> String {
        let key = KeyPair::generate_ed25519().unwrap();
        format!("ssh-ed25519 {} test@host", key.public_key_base64())
    }

    fn auth() -> Auth {
        Auth::new(Db::open_memory().unwrap())
    }

    #[test]
    fn test_propose_requires_matching_secret() {
        let a = auth();
        let line = test_key_line();
        let key = a.create_ssh_key("u1", "laptop").unwrap();
        a.propose_ssh_key(&key.id, "s3cret", &line).unwrap();
        // Same secret works again.
        a.propose_ssh_key(&key.id, "s3cret", &line).unwrap();
        // A different secret is rejected.
        assert!(a.propose_ssh_key(&key.id, "other", &line).is_err());
    }

    #[test]
    fn test_propose_resets_confirmation() {
        let a = auth();
        let line = test_key_line();
        let key = a.create_ssh_key("u1", "laptop").unwrap();
        a.propose_ssh_key(&key.id, "s3cret", &line).unwrap();
        let confirmed = a.confirm_ssh_key(&key.id, Utc::now()).unwrap();
        assert!(confirmed.is_valid(Utc::now()));
        let proposed = a.propose_ssh_key(&key.id, "s3cret", &line).unwrap();
        assert!(proposed.confirmed_at.is_none());
        assert!(!proposed.is_valid(Utc::now()));
    }

    #[test]
    fn test_fingerprint_matches_wire_encoding() {
        let line = test_key_line();
        let fp1 = fingerprint_public_key(&line).unwrap();
        let fp2 = fingerprint_public_key(&line).unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 32);
        assert!(fingerprint_public_key("garbage").is_err());
    }
}
