//! Session cookie store.
//!
//! The cookie value is `<session-id>:<secret>`. Strict reads validate the
//! secret; reuse-mode reads resolve the id only, so a re-authentication can
//! rebind to an existing session instead of spawning a new one.

use axum::http::{header, HeaderMap};
use chrono::{Duration, Utc};
use ubergang_common::{Db, Error, Result, Session, User};

pub const SESSION_COOKIE: &str = "__ug_sess";

#[derive(Clone)]
pub struct SessionStore {
    db: Db,
}

impl SessionStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Strict read of the request's session cookie.
    pub fn get(&self, headers: &HeaderMap) -> Result<(User, Session)> {
        let value = cookie_value(headers)
            .ok_or_else(|| Error::NotAuthorized("missing session cookie".into()))?;
        self.decode_session_cookie(&value, true)
    }

    /// Resolve the cookie without validating the secret. Only the sign-in
    /// completion path uses this.
    pub fn reuse_session(&self, headers: &HeaderMap) -> Result<(User, Session)> {
        let value = cookie_value(headers)
            .ok_or_else(|| Error::NotAuthorized("missing session cookie".into()))?;
        self.decode_session_cookie(&value, false)
    }

    pub fn decode_session_cookie(
        &self,
        value: &str,
        validate_secret: bool,
    ) -> Result<(User, Session)> {
        let (id, secret) = value
            .split_once(':')
            .ok_or_else(|| Error::NotAuthorized("invalid cookie structure".into()))?;
        let (user, session) = self.db.get_session(id)?;
        if validate_secret && session.secret != secret {
            return Err(Error::NotAuthorized("invalid session secret".into()));
        }
        Ok((user, session))
    }

    pub fn encode_session_cookie(&self, session: &Session) -> String {
        format!("{}:{}", session.id, session.secret)
    }

    /// Full `Set-Cookie` header value: secure, path `/`, expires 10 years out.
    pub fn create_session_cookie(&self, session: &Session) -> String {
        let expires = Utc::now() + Duration::days(10 * 365);
        format!(
            "{}={}; Path=/; Expires={}; Secure",
            SESSION_COOKIE,
            self.encode_session_cookie(session),
            expires.format("%a, %d %b %Y %H:%M:%S GMT")
        )
    }
}

/// The raw value of our session cookie, if the request carries one.
pub fn cookie_value(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let pair = pair.trim();
        if let Some((name, value)) = pair.split_once('=') {
            if name == SESSION_COOKIE {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ubergang_common::models::User as UserModel;

    fn seeded() -> (SessionStore, Session) {
        let db = Db::open_memory().unwrap();
        db.update_user("u1", |_| {
            Ok(UserModel {
                id: "u1".into(),
                email: "a@x".into(),
                display_name: "a".into(),
                is_admin: false,
                allowed_hosts: vec![],
                signin_requests: vec![],
            })
        })
        .unwrap();
        let session = Session {
            id: "sess1".into(),
            user_id: "u1".into(),
            secret: "topsecret".into(),
            user_agent: String::new(),
            remote_addr: String::new(),
            created_at: Utc::now(),
            accessed_at: None,
        };
        db.update_session("sess1", |_| Ok(session.clone())).unwrap();
        (SessionStore::new(db), session)
    }

    #[test]
    fn test_cookie_round_trip() {
        let (store, session) = seeded();
        let value = store.encode_session_cookie(&session);
        let (user, decoded) = store.decode_session_cookie(&value, true).unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(decoded.id, session.id);
    }

    #[test]
    fn test_tampered_secret_fails_strict_but_not_reuse() {
        let (store, session) = seeded();
        let tampered = format!("{}:wrong", session.id);
        assert!(store.decode_session_cookie(&tampered, true).is_err());
        let (user, decoded) = store.decode_session_cookie(&tampered, false).unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(decoded.id, session.id);
    }

    #[test]
    fn test_cookie_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "other=1; __ug_sess=abc:def; trailing=2".parse().unwrap(),
        );
        assert_eq!(cookie_value(&headers).as_deref(), Some("abc:def"));
    }
}
