//! Single-bucket key-value store backing all gateway state.
//!
//! Every entity lives in one `kv` table addressed by an ASCII key with a
//! typed prefix (`user:`, `sess:`, `be:`, `cert:`, ...). Mutations go
//! through mutator closures that run inside one write transaction together
//! with secondary-index maintenance, so an index can never diverge from its
//! primary. Readers observe the latest committed state.

use crate::models::*;
use crate::{Error, Result};
use chrono::Utc;
use data_encoding::BASE64URL_NOPAD;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Database handle. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

fn user_key(id: &str) -> String {
    format!("user:{id}")
}

fn session_key(id: &str) -> String {
    format!("sess:{id}")
}

fn backend_key(fqdn: &str) -> String {
    format!("be:{fqdn}")
}

fn credential_key(id: &str) -> String {
    format!("cred:{id}")
}

fn ssh_key_key(id: &str) -> String {
    format!("ssh-key:{id}")
}

fn ssh_fingerprint_key(fingerprint: &[u8]) -> String {
    format!("ssh-fp:{}", BASE64URL_NOPAD.encode(fingerprint))
}

fn email_key(email: &str) -> String {
    format!("email:{email}")
}

fn signin_token_key(token: &str) -> String {
    format!("signin:{token}")
}

fn auth_state_key(id: &Uuid) -> String {
    format!("auth-state:{id}")
}

fn mqtt_profile_key(id: &str) -> String {
    format!("mqtt-profile:{id}")
}

fn mqtt_client_key(id: &str) -> String {
    format!("mqtt-client:{id}")
}

fn cert_key(name: &str) -> String {
    format!("cert:{name}")
}

fn normalize_fqdn(fqdn: &str) -> String {
    fqdn.to_ascii_lowercase()
}

const CONFIG_KEY: &str = "config";
const SSH_SERVER_KEY: &str = "ssh-server-key";
const SELF_SIGNED_CERT_KEY: &str = "self-signed-cert";
const SELF_SIGNED_KEY_KEY: &str = "self-signed-key";

// ----------------------------------------------------------------------------
// Transaction-scoped helpers
// ----------------------------------------------------------------------------

fn tx_get_raw(tx: &Transaction, key: &str) -> Result<Option<Vec<u8>>> {
    let value = tx
        .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value)
}

fn tx_get<T: DeserializeOwned>(tx: &Transaction, key: &str) -> Result<Option<T>> {
    match tx_get_raw(tx, key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn tx_put_raw(tx: &Transaction, key: &str, value: &[u8]) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn tx_put<T: Serialize>(tx: &Transaction, key: &str, value: &T) -> Result<()> {
    tx_put_raw(tx, key, &serde_json::to_vec(value)?)
}

fn tx_delete(tx: &Transaction, key: &str) -> Result<()> {
    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
    Ok(())
}

impl Db {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            "#,
        )?;
        debug!("Database schema initialized");
        Ok(())
    }

    fn with_write_tx<R>(&self, f: impl FnOnce(&Transaction) -> Result<R>) -> Result<R> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn with_read_tx<R>(&self, f: impl FnOnce(&Transaction) -> Result<R>) -> Result<R> {
        // SQLite behind a single connection: a plain transaction doubles as
        // the reader transaction.
        self.with_write_tx(f)
    }

    /// Get the raw value at `key`, if present.
    pub fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_read_tx(|tx| tx_get_raw(tx, key))
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, key-ordered.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key")?;
        // The prefix bound works because keys are ASCII and '~' sorts above
        // every character used in them.
        let upper = format!("{prefix}~");
        let rows = stmt.query_map(params![prefix, upper], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn list_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Vec<T> {
        self.scan_prefix(prefix)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_slice(&v).ok())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    pub fn get_configuration(&self) -> Result<Configuration> {
        self.with_read_tx(|tx| {
            tx_get(tx, CONFIG_KEY)?.ok_or_else(|| Error::not_found("configuration", CONFIG_KEY))
        })
    }

    pub fn update_configuration(
        &self,
        f: impl FnOnce(Option<Configuration>) -> Result<Configuration>,
    ) -> Result<()> {
        self.with_write_tx(|tx| {
            let old = tx_get(tx, CONFIG_KEY)?;
            let new = f(old)?;
            tx_put(tx, CONFIG_KEY, &new)
        })
    }

    // ------------------------------------------------------------------------
    // Fixed keys
    // ------------------------------------------------------------------------

    pub fn get_ssh_server_key(&self) -> Result<Vec<u8>> {
        self.with_read_tx(|tx| {
            tx_get_raw(tx, SSH_SERVER_KEY)?.ok_or_else(|| Error::not_found("key", SSH_SERVER_KEY))
        })
    }

    pub fn update_ssh_server_key(&self, data: &[u8]) -> Result<()> {
        self.with_write_tx(|tx| tx_put_raw(tx, SSH_SERVER_KEY, data))
    }

    pub fn get_self_signed_cert(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.with_read_tx(|tx| {
            let cert = tx_get_raw(tx, SELF_SIGNED_CERT_KEY)?;
            let key = tx_get_raw(tx, SELF_SIGNED_KEY_KEY)?;
            match (cert, key) {
                (Some(cert), Some(key)) => Ok((cert, key)),
                _ => Err(Error::not_found("certificate", SELF_SIGNED_CERT_KEY)),
            }
        })
    }

    pub fn update_self_signed_cert(&self, cert: &[u8], key: &[u8]) -> Result<()> {
        self.with_write_tx(|tx| {
            tx_put_raw(tx, SELF_SIGNED_CERT_KEY, cert)?;
            tx_put_raw(tx, SELF_SIGNED_KEY_KEY, key)
        })
    }

    // ------------------------------------------------------------------------
    // Certificate namespace
    // ------------------------------------------------------------------------

    pub fn get_cert(&self, name: &str) -> Result<Vec<u8>> {
        self.with_read_tx(|tx| {
            tx_get_raw(tx, &cert_key(name))?.ok_or_else(|| Error::not_found("cert", name))
        })
    }

    pub fn update_cert(&self, name: &str, data: &[u8]) -> Result<()> {
        self.with_write_tx(|tx| tx_put_raw(tx, &cert_key(name), data))
    }

    pub fn delete_cert(&self, name: &str) -> Result<()> {
        self.with_write_tx(|tx| tx_delete(tx, &cert_key(name)))
    }

    /// All keys in the certificate namespace, with the `cert:` prefix
    /// stripped.
    pub fn list_cert_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .scan_prefix("cert:")?
            .into_iter()
            .map(|(k, _)| k["cert:".len()..].to_string())
            .collect())
    }

    pub fn delete_certs_by_prefix(&self, prefix: &str) -> Result<()> {
        let full = cert_key(prefix);
        self.with_write_tx(|tx| {
            tx.execute(
                "DELETE FROM kv WHERE key >= ?1 AND key < ?2",
                params![full, format!("{full}~")],
            )?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------------

    pub fn get_user_by_id(&self, user_id: &str) -> Result<User> {
        self.with_read_tx(|tx| {
            tx_get(tx, &user_key(user_id))?.ok_or_else(|| Error::not_found("user", user_id))
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<User> {
        self.with_read_tx(|tx| {
            let user_id = tx_get_raw(tx, &email_key(email))?
                .ok_or_else(|| Error::not_found("email", email))?;
            let user_id = String::from_utf8_lossy(&user_id).into_owned();
            tx_get(tx, &user_key(&user_id))?.ok_or_else(|| Error::not_found("user", user_id))
        })
    }

    pub fn get_user_by_signin_request(&self, token: &str) -> Result<User> {
        self.with_read_tx(|tx| {
            let user_id = tx_get_raw(tx, &signin_token_key(token))?
                .ok_or_else(|| Error::not_found("signin token", token))?;
            let user_id = String::from_utf8_lossy(&user_id).into_owned();
            tx_get(tx, &user_key(&user_id))?.ok_or_else(|| Error::not_found("user", user_id))
        })
    }

    pub fn list_users(&self) -> Vec<User> {
        self.list_prefix("user:")
    }

    /// Mutate a user record. Maintains the `email:` index (enforcing email
    /// uniqueness) and diffs the embedded sign-in requests against the
    /// `signin:` index, all in one transaction.
    pub fn update_user(
        &self,
        user_id: &str,
        f: impl FnOnce(Option<User>) -> Result<User>,
    ) -> Result<()> {
        self.with_write_tx(|tx| {
            let key = user_key(user_id);
            let old: Option<User> = tx_get(tx, &key)?;
            let old_email = old.as_ref().map(|u| u.email.clone()).unwrap_or_default();
            let old_tokens: Vec<String> = old
                .as_ref()
                .map(|u| u.signin_requests.iter().map(|s| s.id.clone()).collect())
                .unwrap_or_default();

            let new = f(old)?;
            let new_tokens: Vec<String> =
                new.signin_requests.iter().map(|s| s.id.clone()).collect();

            if !new.email.is_empty() {
                if let Some(existing) = tx_get_raw(tx, &email_key(&new.email))? {
                    let existing = String::from_utf8_lossy(&existing);
                    if existing != user_id {
                        return Err(Error::Conflict(format!(
                            "e-mail address already mapped to another user: {existing}"
                        )));
                    }
                }
            }
            if old_email != new.email {
                if !old_email.is_empty() {
                    tx_delete(tx, &email_key(&old_email))?;
                }
                if !new.email.is_empty() {
                    tx_put_raw(tx, &email_key(&new.email), user_id.as_bytes())?;
                }
            }
            for token in old_tokens.iter().filter(|t| !new_tokens.contains(t)) {
                tx_delete(tx, &signin_token_key(token))?;
            }
            for token in new_tokens.iter().filter(|t| !old_tokens.contains(t)) {
                tx_put_raw(tx, &signin_token_key(token), user_id.as_bytes())?;
            }
            tx_put(tx, &key, &new)
        })
    }

    /// Hard-delete a user and, best-effort, everything it owns.
    pub fn delete_user(&self, user_id: &str) -> Result<()> {
        self.with_write_tx(|tx| {
            let key = user_key(user_id);
            let user: User =
                tx_get(tx, &key)?.ok_or_else(|| Error::not_found("user", user_id))?;
            if !user.email.is_empty() {
                tx_delete(tx, &email_key(&user.email))?;
            }
            for req in &user.signin_requests {
                tx_delete(tx, &signin_token_key(&req.id))?;
            }
            tx_delete(tx, &key)
        })?;

        // Owned entities go through their own mutators so their indexes stay
        // consistent. Failures here leave orphans, not corruption.
        for cred in self.list_credentials(user_id) {
            let _ = self.update_credential(&cred.id, |_| Ok(None));
        }
        for sess in self.list_sessions(user_id) {
            let _ = self.delete_session(&sess.id);
        }
        for ssh_key in self.list_ssh_keys(user_id) {
            let _ = self.delete_ssh_key(&ssh_key.id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Resolve a session id to the session and its owning user.
    pub fn get_session(&self, id: &str) -> Result<(User, Session)> {
        self.with_read_tx(|tx| {
            let session: Session =
                tx_get(tx, &session_key(id))?.ok_or_else(|| Error::not_found("session", id))?;
            let user: User = tx_get(tx, &user_key(&session.user_id))?
                .ok_or_else(|| Error::not_found("user", session.user_id.clone()))?;
            Ok((user, session))
        })
    }

    pub fn list_sessions(&self, user_id: &str) -> Vec<Session> {
        let prefix = format!("user-sess:{user_id}:");
        let ids: Vec<String> = self
            .scan_prefix(&prefix)
            .unwrap_or_default()
            .into_iter()
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.get_session(&id).ok().map(|(_, s)| s))
            .collect()
    }

    pub fn update_session(
        &self,
        session_id: &str,
        f: impl FnOnce(Option<Session>) -> Result<Session>,
    ) -> Result<()> {
        self.with_write_tx(|tx| {
            let key = session_key(session_id);
            let old = tx_get(tx, &key)?;
            let new = f(old)?;
            tx_put_raw(
                tx,
                &format!("user-sess:{}:{}", new.user_id, new.id),
                &[],
            )?;
            tx_put(tx, &key, &new)
        })
    }

    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        self.with_write_tx(|tx| {
            let key = session_key(session_id);
            if let Some(session) = tx_get::<Session>(tx, &key)? {
                tx_delete(tx, &format!("user-sess:{}:{}", session.user_id, session_id))?;
                tx_delete(tx, &key)?;
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------------

    pub fn get_credential(&self, id: &str) -> Result<Credential> {
        self.with_read_tx(|tx| {
            tx_get(tx, &credential_key(id))?.ok_or_else(|| Error::not_found("credential", id))
        })
    }

    pub fn list_credentials(&self, user_id: &str) -> Vec<Credential> {
        let prefix = format!("user-cred:{user_id}:");
        let ids: Vec<String> = self
            .scan_prefix(&prefix)
            .unwrap_or_default()
            .into_iter()
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.get_credential(&id).ok())
            .collect()
    }

    /// Mutate a credential; returning `None` deletes it along with its
    /// `user-cred:` index entry.
    pub fn update_credential(
        &self,
        credential_id: &str,
        f: impl FnOnce(Option<Credential>) -> Result<Option<Credential>>,
    ) -> Result<()> {
        self.with_write_tx(|tx| {
            let key = credential_key(credential_id);
            let old: Option<Credential> = tx_get(tx, &key)?;
            let old_user = old.as_ref().map(|c| c.user_id.clone());
            match f(old)? {
                None => {
                    if let Some(user_id) = old_user {
                        tx_delete(tx, &format!("user-cred:{user_id}:{credential_id}"))?;
                        tx_delete(tx, &key)?;
                    }
                    Ok(())
                }
                Some(new) => {
                    tx_put_raw(tx, &format!("user-cred:{}:{}", new.user_id, new.id), &[])?;
                    tx_put(tx, &key, &new)
                }
            }
        })
    }

    // ------------------------------------------------------------------------
    // Backends
    // ------------------------------------------------------------------------

    pub fn get_backend(&self, fqdn: &str) -> Result<Backend> {
        let fqdn = normalize_fqdn(fqdn);
        self.with_read_tx(|tx| {
            tx_get(tx, &backend_key(&fqdn))?.ok_or_else(|| Error::not_found("backend", fqdn))
        })
    }

    pub fn list_backends(&self) -> Vec<Backend> {
        self.list_prefix("be:")
    }

    /// Mutate a backend; returning `None` deletes it. The FQDN may not change
    /// on update.
    pub fn update_backend(
        &self,
        fqdn: &str,
        f: impl FnOnce(Option<Backend>) -> Result<Option<Backend>>,
    ) -> Result<()> {
        let fqdn = normalize_fqdn(fqdn);
        self.with_write_tx(|tx| {
            let key = backend_key(&fqdn);
            let old: Option<Backend> = tx_get(tx, &key)?;
            let had_old = old.is_some();
            let old_fqdn = old.as_ref().map(|b| b.fqdn.clone());
            match f(old)? {
                None => {
                    if had_old {
                        tx_delete(tx, &key)?;
                    }
                    Ok(())
                }
                Some(new) => {
                    if let Some(old_fqdn) = old_fqdn {
                        if old_fqdn != new.fqdn {
                            return Err(Error::Conflict(
                                "changing FQDN is currently not supported".into(),
                            ));
                        }
                    }
                    tx_put(tx, &key, &new)
                }
            }
        })
    }

    pub fn delete_backend(&self, fqdn: &str) -> Result<()> {
        self.update_backend(fqdn, |_| Ok(None))
    }

    // ------------------------------------------------------------------------
    // SSH keys
    // ------------------------------------------------------------------------

    pub fn get_ssh_key(&self, id: &str) -> Result<SshKey> {
        self.with_read_tx(|tx| {
            tx_get(tx, &ssh_key_key(id))?.ok_or_else(|| Error::not_found("ssh key", id))
        })
    }

    pub fn get_ssh_key_by_fingerprint(&self, fingerprint: &[u8]) -> Result<SshKey> {
        self.with_read_tx(|tx| {
            let key_id = tx_get_raw(tx, &ssh_fingerprint_key(fingerprint))?
                .ok_or_else(|| Error::not_found("ssh fingerprint", hex_preview(fingerprint)))?;
            let key_id = String::from_utf8_lossy(&key_id).into_owned();
            tx_get(tx, &ssh_key_key(&key_id))?.ok_or_else(|| Error::not_found("ssh key", key_id))
        })
    }

    pub fn list_ssh_keys(&self, user_id: &str) -> Vec<SshKey> {
        let prefix = format!("user-ssh-key:{user_id}:");
        let ids: Vec<String> = self
            .scan_prefix(&prefix)
            .unwrap_or_default()
            .into_iter()
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.get_ssh_key(&id).ok())
            .collect()
    }

    /// Mutate an SSH key, rewriting the fingerprint index atomically when the
    /// public key changes. Returns the updated record.
    pub fn update_ssh_key(
        &self,
        ssh_key_id: &str,
        f: impl FnOnce(Option<SshKey>) -> Result<SshKey>,
    ) -> Result<SshKey> {
        self.with_write_tx(|tx| {
            let key = ssh_key_key(ssh_key_id);
            let old: Option<SshKey> = tx_get(tx, &key)?;
            let was_new = old.is_none();
            let old_fingerprint = old
                .as_ref()
                .map(|k| k.sha256_fingerprint.clone())
                .unwrap_or_default();
            let new = f(old)?;
            if old_fingerprint != new.sha256_fingerprint {
                if !old_fingerprint.is_empty() {
                    tx_delete(tx, &ssh_fingerprint_key(&old_fingerprint))?;
                }
                if !new.sha256_fingerprint.is_empty() {
                    if let Some(existing) =
                        tx_get_raw(tx, &ssh_fingerprint_key(&new.sha256_fingerprint))?
                    {
                        if String::from_utf8_lossy(&existing) != ssh_key_id {
                            return Err(Error::Conflict(
                                "fingerprint already registered to another key".into(),
                            ));
                        }
                    }
                    tx_put_raw(
                        tx,
                        &ssh_fingerprint_key(&new.sha256_fingerprint),
                        ssh_key_id.as_bytes(),
                    )?;
                }
            }
            if was_new {
                tx_put_raw(
                    tx,
                    &format!("user-ssh-key:{}:{}", new.user_id, new.id),
                    &[],
                )?;
            }
            tx_put(tx, &key, &new)?;
            Ok(new)
        })
    }

    pub fn delete_ssh_key(&self, ssh_key_id: &str) -> Result<()> {
        self.with_write_tx(|tx| {
            let key = ssh_key_key(ssh_key_id);
            if let Some(old) = tx_get::<SshKey>(tx, &key)? {
                if !old.sha256_fingerprint.is_empty() {
                    tx_delete(tx, &ssh_fingerprint_key(&old.sha256_fingerprint))?;
                }
                tx_delete(tx, &format!("user-ssh-key:{}:{}", old.user_id, old.id))?;
                tx_delete(tx, &key)?;
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Authentication states
    // ------------------------------------------------------------------------

    pub fn store_authentication_state(
        &self,
        state_id: &Uuid,
        state: &AuthenticationState,
    ) -> Result<()> {
        self.with_write_tx(|tx| {
            let key = auth_state_key(state_id);
            if tx_get_raw(tx, &key)?.is_some() {
                return Err(Error::Conflict("ID collision".into()));
            }
            tx_put(tx, &key, state)
        })
    }

    /// Read and delete an authentication state in one transaction. The token
    /// must parse as a version-7 UUID before any lookup happens.
    pub fn consume_authentication_state(&self, token: &str) -> Result<AuthenticationState> {
        let state_id = Uuid::parse_str(token).map_err(|_| Error::InvalidToken)?;
        if state_id.get_version_num() != 7 {
            return Err(Error::InvalidToken);
        }
        self.with_write_tx(|tx| {
            let key = auth_state_key(&state_id);
            let state: AuthenticationState = tx_get(tx, &key)?
                .ok_or_else(|| Error::not_found("authentication state", token))?;
            tx_delete(tx, &key)?;
            Ok(state)
        })
    }

    // ------------------------------------------------------------------------
    // MQTT profiles and clients
    // ------------------------------------------------------------------------

    pub fn get_mqtt_profile(&self, id: &str) -> Result<MqttProfile> {
        self.with_read_tx(|tx| {
            tx_get(tx, &mqtt_profile_key(id))?.ok_or_else(|| Error::not_found("mqtt profile", id))
        })
    }

    pub fn list_mqtt_profiles(&self) -> Vec<MqttProfile> {
        self.list_prefix("mqtt-profile:")
    }

    /// Mutate an MQTT profile; deletion fails while any client references it.
    pub fn update_mqtt_profile(
        &self,
        id: &str,
        f: impl FnOnce(Option<MqttProfile>) -> Result<Option<MqttProfile>>,
    ) -> Result<()> {
        self.with_write_tx(|tx| {
            let key = mqtt_profile_key(id);
            let old = tx_get(tx, &key)?;
            match f(old)? {
                None => {
                    let mut stmt = tx.prepare(
                        "SELECT value FROM kv WHERE key >= 'mqtt-client:' AND key < 'mqtt-client:~'",
                    )?;
                    let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
                    for row in rows {
                        if let Ok(client) = serde_json::from_slice::<MqttClient>(&row?) {
                            if client.profile_id == id {
                                return Err(Error::Conflict(format!(
                                    "cannot delete MQTT profile {id}, it is in use by client {}",
                                    client.id
                                )));
                            }
                        }
                    }
                    drop(stmt);
                    tx_delete(tx, &key)
                }
                Some(new) => tx_put(tx, &key, &new),
            }
        })
    }

    pub fn get_mqtt_client(&self, id: &str) -> Result<MqttClient> {
        self.with_read_tx(|tx| {
            tx_get(tx, &mqtt_client_key(id))?.ok_or_else(|| Error::not_found("mqtt client", id))
        })
    }

    pub fn list_mqtt_clients(&self) -> Vec<MqttClient> {
        self.list_prefix("mqtt-client:")
    }

    /// Mutate an MQTT client. The referenced profile must exist at write
    /// time; renames delete the old key.
    pub fn update_mqtt_client(
        &self,
        id: &str,
        f: impl FnOnce(Option<MqttClient>) -> Result<Option<MqttClient>>,
    ) -> Result<()> {
        self.with_write_tx(|tx| {
            let key = mqtt_client_key(id);
            let old = tx_get(tx, &key)?;
            match f(old)? {
                None => tx_delete(tx, &key),
                Some(new) => {
                    if tx_get_raw(tx, &mqtt_profile_key(&new.profile_id))?.is_none() {
                        return Err(Error::not_found("mqtt profile", new.profile_id.clone()));
                    }
                    if new.id != id {
                        tx_delete(tx, &key)?;
                    }
                    tx_put(tx, &mqtt_client_key(&new.id), &new)
                }
            }
        })
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Delete everything except certificates, the configuration, and the SSH
    /// host key. Certificates are expensive to reissue; the rest resets.
    pub fn clear_database(&self) -> Result<()> {
        self.with_write_tx(|tx| {
            tx.execute(
                "DELETE FROM kv WHERE key NOT LIKE 'cert:%' AND key NOT IN (?1, ?2)",
                params![CONFIG_KEY, SSH_SERVER_KEY],
            )?;
            Ok(())
        })
    }

    /// A consistent raw snapshot of the database file.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let path = std::env::temp_dir().join(format!(
            "ubergang-snapshot-{}-{}.db",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        {
            let conn = self.conn.lock();
            let mut dst = Connection::open(&path)?;
            let backup = rusqlite::backup::Backup::new(&conn, &mut dst)?;
            backup.run_to_completion(256, std::time::Duration::from_millis(5), None)?;
        }
        let bytes = std::fs::read(&path)?;
        let _ = std::fs::remove_file(&path);
        Ok(bytes)
    }

    /// Gzip-compressed snapshot, with the uncompressed size for logging.
    pub fn snapshot_gz(&self) -> Result<(usize, Vec<u8>)> {
        let raw = self.snapshot()?;
        let original = raw.len();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        Ok((original, encoder.finish()?))
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;

    fn test_user(id: &str, email: &str) -> User {
        User {
            id: id.into(),
            email: email.into(),
            display_name: email.into(),
            is_admin: false,
            allowed_hosts: vec![],
            signin_requests: vec![],
        }
    }

    #[test]
    fn test_email_uniqueness() {
        let db = Db::open_memory().unwrap();
        db.update_user("u1", |_| Ok(test_user("u1", "a@x"))).unwrap();
        let err = db
            .update_user("u2", |_| Ok(test_user("u2", "a@x")))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // The failed transaction must not leave a user behind.
        assert!(db.get_user_by_id("u2").is_err());
        assert_eq!(db.get_user_by_email("a@x").unwrap().id, "u1");
    }

    #[test]
    fn test_email_index_moves_with_update() {
        let db = Db::open_memory().unwrap();
        db.update_user("u1", |_| Ok(test_user("u1", "a@x"))).unwrap();
        db.update_user("u1", |old| {
            let mut u = old.unwrap();
            u.email = "b@x".into();
            Ok(u)
        })
        .unwrap();
        assert!(db.get_user_by_email("a@x").is_err());
        assert_eq!(db.get_user_by_email("b@x").unwrap().id, "u1");
    }

    #[test]
    fn test_signin_token_index_follows_requests() {
        let db = Db::open_memory().unwrap();
        let mut user = test_user("u1", "a@x");
        user.signin_requests.push(SigninRequest {
            id: "tok1".into(),
            pin: String::new(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            confirmed: false,
            user_agent: String::new(),
            ip: String::new(),
        });
        db.update_user("u1", |_| Ok(user.clone())).unwrap();
        assert_eq!(db.get_user_by_signin_request("tok1").unwrap().id, "u1");

        db.update_user("u1", |old| {
            let mut u = old.unwrap();
            u.signin_requests.clear();
            Ok(u)
        })
        .unwrap();
        assert!(db.get_user_by_signin_request("tok1").is_err());
    }

    #[test]
    fn test_fingerprint_index_rewritten_atomically() {
        let db = Db::open_memory().unwrap();
        let now = Utc::now();
        db.update_ssh_key("k1", |_| {
            Ok(SshKey {
                id: "k1".into(),
                user_id: "u1".into(),
                name: "laptop".into(),
                created_at: now,
                confirmed_at: None,
                hashed_secret: String::new(),
                public_key: String::new(),
                sha256_fingerprint: vec![1, 2, 3],
            })
        })
        .unwrap();
        assert_eq!(db.get_ssh_key_by_fingerprint(&[1, 2, 3]).unwrap().id, "k1");

        db.update_ssh_key("k1", |old| {
            let mut k = old.unwrap();
            k.sha256_fingerprint = vec![4, 5, 6];
            Ok(k)
        })
        .unwrap();
        assert!(db.get_ssh_key_by_fingerprint(&[1, 2, 3]).is_err());
        assert_eq!(db.get_ssh_key_by_fingerprint(&[4, 5, 6]).unwrap().id, "k1");
    }

    #[test]
    fn test_auth_state_single_consume() {
        let db = Db::open_memory().unwrap();
        let id = Uuid::now_v7();
        let state = AuthenticationState {
            user_id: "u1".into(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
            kind: AuthStateKind::SignIn,
            registration: None,
            authentication: None,
        };
        db.store_authentication_state(&id, &state).unwrap();
        let token = id.to_string();
        assert!(db.consume_authentication_state(&token).is_ok());
        assert!(db.consume_authentication_state(&token).is_err());
    }

    #[test]
    fn test_auth_state_rejects_non_v7() {
        let db = Db::open_memory().unwrap();
        let v4 = Uuid::new_v4().to_string();
        assert!(matches!(
            db.consume_authentication_state(&v4),
            Err(Error::InvalidToken)
        ));
        assert!(matches!(
            db.consume_authentication_state("not-a-uuid"),
            Err(Error::InvalidToken)
        ));
    }

    #[test]
    fn test_clear_database_preserves_expensive_state() {
        let db = Db::open_memory().unwrap();
        db.update_cert("acme/some/cert.pem", b"cert-data").unwrap();
        db.update_ssh_server_key(b"host-key").unwrap();
        db.update_configuration(|_| {
            Ok(Configuration {
                email: "a@x".into(),
                site_fqdn: "x".into(),
                admin_fqdn: "account.x".into(),
                test_mode: false,
            })
        })
        .unwrap();
        db.update_user("u1", |_| Ok(test_user("u1", "a@x"))).unwrap();

        db.clear_database().unwrap();

        assert_eq!(db.get_cert("acme/some/cert.pem").unwrap(), b"cert-data");
        assert_eq!(db.get_ssh_server_key().unwrap(), b"host-key");
        assert!(db.get_configuration().unwrap().is_configured());
        assert!(db.get_user_by_id("u1").is_err());
        assert!(db.get_user_by_email("a@x").is_err());
    }

    #[test]
    fn test_mqtt_profile_delete_blocked_while_in_use() {
        let db = Db::open_memory().unwrap();
        db.update_mqtt_profile("p1", |_| {
            Ok(Some(MqttProfile {
                id: "p1".into(),
                allow_publish: vec!["$ID/out".into()],
                allow_subscribe: vec![],
            }))
        })
        .unwrap();
        db.update_mqtt_client("c1", |_| {
            Ok(Some(MqttClient {
                id: "c1".into(),
                profile_id: "p1".into(),
                password: "pw".into(),
                values: Default::default(),
            }))
        })
        .unwrap();

        assert!(db.update_mqtt_profile("p1", |_| Ok(None)).is_err());

        db.update_mqtt_client("c1", |_| Ok(None)).unwrap();
        db.update_mqtt_profile("p1", |_| Ok(None)).unwrap();
        assert!(db.get_mqtt_profile("p1").is_err());
    }

    #[test]
    fn test_mqtt_client_requires_profile() {
        let db = Db::open_memory().unwrap();
        let err = db
            .update_mqtt_client("c1", |_| {
                Ok(Some(MqttClient {
                    id: "c1".into(),
                    profile_id: "missing".into(),
                    password: String::new(),
                    values: Default::default(),
                }))
            })
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_credential_cascade_on_delete() {
        let db = Db::open_memory().unwrap();
        let now = Utc::now();
        db.update_credential("sid1", |_| {
            Ok(Some(Credential {
                id: "sid1".into(),
                user_id: "u1".into(),
                name: "Passkey".into(),
                created_at: now,
                last_used_at: now,
                created_by_session_id: "s1".into(),
                used_by_session_ids: vec!["s1".into()],
                passkey: serde_json::json!({}),
                transports: vec![],
                aaguid: String::new(),
                sign_count: 0,
                clone_warning: false,
            }))
        })
        .unwrap();
        assert_eq!(db.list_credentials("u1").len(), 1);

        db.update_credential("sid1", |_| Ok(None)).unwrap();
        assert!(db.get_credential("sid1").is_err());
        assert!(db.list_credentials("u1").is_empty());
    }

    #[test]
    fn test_backend_fqdn_immutable() {
        let db = Db::open_memory().unwrap();
        let now = Utc::now();
        db.update_backend("Web.Example.COM", |_| {
            Ok(Some(Backend {
                fqdn: "web.example.com".into(),
                upstream_url: "http://127.0.0.1:8080".into(),
                headers: vec![],
                access_level: AccessLevel::Normal,
                script: String::new(),
                created_at: now,
                updated_at: now,
            }))
        })
        .unwrap();
        // Lookup is case-insensitive.
        assert!(db.get_backend("WEB.example.com").is_ok());

        let err = db
            .update_backend("web.example.com", |old| {
                let mut b = old.unwrap();
                b.fqdn = "other.example.com".into();
                Ok(Some(b))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_update_aborts_cleanly_on_mutator_error() {
        let db = Db::open_memory().unwrap();
        db.update_user("u1", |_| Ok(test_user("u1", "a@x"))).unwrap();
        let err = db
            .update_user("u1", |_| -> Result<User> {
                Err(Error::Internal("mutator refused".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(db.get_user_by_id("u1").unwrap().email, "a@x");
    }

    #[test]
    fn test_session_tokens_random() {
        assert_ne!(ids::make_random_id(), ids::make_random_id());
    }
}
