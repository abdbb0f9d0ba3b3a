//! Shared-secret hashing for SSH key proposals, using argon2id.

use crate::{Error, Result};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

/// Hash a secret with argon2id and a random salt.
pub fn hash_password(cleartext: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(cleartext.as_bytes(), &salt)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    Ok(hash.to_string())
}

/// Verify a secret against a stored argon2id hash.
pub fn check_password(hashed: &str, cleartext: &str) -> Result<()> {
    if hashed.is_empty() {
        return Err(Error::Crypto("empty hashed password".into()));
    }
    let parsed = PasswordHash::new(hashed).map_err(|e| Error::Crypto(e.to_string()))?;
    Argon2::default()
        .verify_password(cleartext.as_bytes(), &parsed)
        .map_err(|_| Error::NotAuthorized("secret mismatch".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let hashed = hash_password("swordfish").unwrap();
        assert!(check_password(&hashed, "swordfish").is_ok());
        assert!(check_password(&hashed, "sardine").is_err());
    }

    #[test]
    fn test_different_secrets_different_hashes() {
        let h1 = hash_password("secret1").unwrap();
        let h2 = hash_password("secret2").unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_empty_hash_rejected() {
        assert!(check_password("", "anything").is_err());
    }
}
