//! Account and session issuance.

pub mod ssh_keys;

use chrono::{Duration, Utc};
use ubergang_common::{ids, Db, Error, Result, Session, SigninRequest, User};

#[derive(Clone)]
pub struct Auth {
    db: Db,
}

impl Auth {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    /// Create a user with a pre-confirmed one-week sign-in token, so the new
    /// user can enroll a passkey from the returned link.
    pub fn create_user(
        &self,
        email: &str,
        display_name: &str,
        admin: bool,
        allowed_hosts: Vec<String>,
    ) -> Result<(User, String)> {
        let poll_id = ids::make_signin_request_token();
        let user = User {
            id: ids::make_random_id(),
            email: email.to_string(),
            display_name: display_name.to_string(),
            is_admin: admin,
            allowed_hosts,
            signin_requests: vec![SigninRequest {
                id: poll_id.clone(),
                pin: String::new(),
                expires_at: Utc::now() + Duration::days(7),
                confirmed: true,
                user_agent: String::new(),
                ip: String::new(),
            }],
        };

        let stored = user.clone();
        self.db.update_user(&user.id, move |old| {
            if old.is_some() {
                return Err(Error::Conflict("user already exists".into()));
            }
            Ok(stored)
        })?;
        tracing::info!("Created user {} with signin token {}", user.email, poll_id);
        Ok((user, poll_id))
    }

    pub fn create_session(
        &self,
        user_id: &str,
        user_agent: &str,
        remote_addr: &str,
    ) -> Result<Session> {
        let user = self.db.get_user_by_id(user_id)?;

        // Strip the port if the address came straight off the socket.
        let ip = remote_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(remote_addr);

        let session = Session {
            id: ids::make_random_id(),
            user_id: user.id.clone(),
            secret: ids::make_random_id(),
            user_agent: user_agent.to_string(),
            remote_addr: ip.to_string(),
            created_at: Utc::now(),
            accessed_at: None,
        };

        let stored = session.clone();
        self.db.update_session(&session.id, move |old| {
            if old.is_some() {
                return Err(Error::Conflict("session ID collision".into()));
            }
            Ok(stored)
        })?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_user_seeds_confirmed_token() {
        let db = Db::open_memory().unwrap();
        let auth = Auth::new(db.clone());
        let (user, token) = auth
            .create_user("a@x", "A", true, vec![])
            .unwrap();
        assert!(user.is_admin);
        let found = db.get_user_by_signin_request(&token).unwrap();
        assert_eq!(found.id, user.id);
        assert!(found.signin_requests[0].confirmed);
    }

    #[test]
    fn test_duplicate_email_rejected() {
        let db = Db::open_memory().unwrap();
        let auth = Auth::new(db);
        auth.create_user("a@x", "A", false, vec![]).unwrap();
        assert!(auth.create_user("a@x", "A2", false, vec![]).is_err());
    }

    #[test]
    fn test_create_session_strips_port() {
        let db = Db::open_memory().unwrap();
        let auth = Auth::new(db.clone());
        let (user, _) = auth.create_user("a@x", "A", false, vec![]).unwrap();
        let session = auth
            .create_session(&user.id, "agent", "192.0.2.7:51234")
            .unwrap();
        assert_eq!(session.remote_addr, "192.0.2.7");
        assert_eq!(db.list_sessions(&user.id).len(), 1);
    }
}
