//! ACME state storage over the `cert:` namespace of the KV store.
//!
//! The namespace has directory-like semantics: a key is a "file" when it
//! exists verbatim and a "directory" when it is a strict prefix of another
//! key. Non-recursive listings return deduplicated direct children. Per-name
//! async locks serialize in-process ACME operations; acquisition is
//! cancellable by the caller (wrap in a timeout).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use ubergang_common::{Db, Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct KeyInfo {
    pub key: String,
    pub size: usize,
    pub is_terminal: bool,
}

pub struct CertStorage {
    db: Db,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CertStorage {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Store a value. Account keys (containing `+`) stay out of the metrics.
    pub fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        if !key.contains('+') {
            metrics::counter!("ubergang_cert_updates_total", "cert" => key.to_string())
                .increment(1);
            metrics::gauge!("ubergang_cert_last_updated", "cert" => key.to_string())
                .set(chrono::Utc::now().timestamp() as f64);
        }
        self.db.update_cert(key, value)
    }

    pub fn load(&self, key: &str) -> Result<Vec<u8>> {
        self.db.get_cert(key)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        if key.ends_with('/') || self.is_prefix(key) {
            return self.db.delete_certs_by_prefix(key);
        }
        self.db.delete_cert(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.db.get_cert(key).is_ok() || self.is_prefix(key)
    }

    fn is_prefix(&self, key: &str) -> bool {
        let Ok(keys) = self.db.list_cert_keys() else {
            return false;
        };
        let dir = format!("{key}/");
        keys.iter().any(|k| k.starts_with(&dir))
    }

    /// List keys under `path`. Non-recursive listings contain direct children
    /// only, with directories reported once.
    pub fn list(&self, path: &str, recursive: bool) -> Result<Vec<String>> {
        let all_keys = self.db.list_cert_keys()?;
        let mut keys = Vec::new();
        let mut seen_dirs: Vec<String> = Vec::new();

        for key in &all_keys {
            let rel = if path.is_empty() {
                key.as_str()
            } else if let Some(rel) = key.strip_prefix(&format!("{path}/")) {
                rel
            } else if key == path {
                continue;
            } else {
                continue;
            };

            if recursive {
                keys.push(key.clone());
            } else {
                match rel.split_once('/') {
                    None => keys.push(key.clone()),
                    Some((first, _)) => {
                        let dir = if path.is_empty() {
                            first.to_string()
                        } else {
                            format!("{path}/{first}")
                        };
                        if !seen_dirs.contains(&dir) {
                            keys.push(dir.clone());
                            seen_dirs.push(dir);
                        }
                    }
                }
            }
        }

        if keys.is_empty() {
            return Err(Error::not_found("cert path", path));
        }
        Ok(keys)
    }

    pub fn stat(&self, key: &str) -> Result<KeyInfo> {
        if let Ok(data) = self.db.get_cert(key) {
            return Ok(KeyInfo {
                key: key.to_string(),
                size: data.len(),
                is_terminal: true,
            });
        }
        if self.is_prefix(key) {
            return Ok(KeyInfo {
                key: key.to_string(),
                size: 0,
                is_terminal: false,
            });
        }
        Err(Error::not_found("cert key", key))
    }

    /// Acquire the per-name lock. Held across a full ACME round-trip; wrap
    /// the call in a timeout to make acquisition cancellable.
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> CertStorage {
        CertStorage::new(Db::open_memory().unwrap())
    }

    #[test]
    fn test_store_load_delete() {
        let s = storage();
        s.store("a/b/c.pem", b"data").unwrap();
        assert_eq!(s.load("a/b/c.pem").unwrap(), b"data");
        s.delete("a/b/c.pem").unwrap();
        assert!(s.load("a/b/c.pem").is_err());
    }

    #[test]
    fn test_list_non_recursive_dedupes_directories() {
        let s = storage();
        s.store("acme/ca/certs/x/x.crt", b"1").unwrap();
        s.store("acme/ca/certs/x/x.key", b"2").unwrap();
        s.store("acme/ca/certs/y/y.crt", b"3").unwrap();
        s.store("acme/ca/account.json", b"4").unwrap();

        let mut direct = s.list("acme/ca", false).unwrap();
        direct.sort();
        assert_eq!(direct, vec!["acme/ca/account.json", "acme/ca/certs"]);

        let children = s.list("acme/ca/certs", false).unwrap();
        assert_eq!(children, vec!["acme/ca/certs/x", "acme/ca/certs/y"]);
    }

    #[test]
    fn test_list_recursive() {
        let s = storage();
        s.store("acme/ca/certs/x/x.crt", b"1").unwrap();
        s.store("acme/ca/certs/x/x.key", b"2").unwrap();
        let all = s.list("acme/ca/certs", true).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_list_empty_is_not_found() {
        let s = storage();
        assert!(s.list("nothing/here", false).is_err());
    }

    #[test]
    fn test_stat_distinguishes_files_and_directories() {
        let s = storage();
        s.store("dir/file.pem", b"data").unwrap();

        let file = s.stat("dir/file.pem").unwrap();
        assert!(file.is_terminal);
        assert_eq!(file.size, 4);

        let dir = s.stat("dir").unwrap();
        assert!(!dir.is_terminal);

        assert!(s.stat("missing").is_err());
    }

    #[test]
    fn test_exists_for_prefix_only_keys() {
        let s = storage();
        s.store("a/b/c", b"x").unwrap();
        assert!(s.exists("a/b/c"));
        assert!(s.exists("a/b"));
        assert!(s.exists("a"));
        assert!(!s.exists("a/b/c/d"));
        assert!(!s.exists("z"));
    }

    #[tokio::test]
    async fn test_lock_serializes_and_is_cancellable() {
        let s = Arc::new(storage());
        let guard = s.lock("example.com").await;

        // A second acquisition must not complete while the first is held.
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            s.lock("example.com"),
        )
        .await;
        assert!(blocked.is_err());

        // Another name is independent.
        let _other = s.lock("other.com").await;

        drop(guard);
        tokio::time::timeout(std::time::Duration::from_millis(50), s.lock("example.com"))
            .await
            .expect("lock should be free after release");
    }
}
