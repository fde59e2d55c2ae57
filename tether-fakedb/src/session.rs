//! Per-connection session state.

use crate::error::FakeDbError;
use crate::store::Scope;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

/// A client session. Owned by the connection's read loop.
#[derive(Debug)]
pub struct Session {
    /// Connection id, unique per server.
    pub id: u64,
    pub namespace: Option<String>,
    pub database: Option<String>,
    /// Signed-in user.
    pub user: Option<String>,
    pub token: Option<String>,
    /// Variables defined with `let` or `LET`.
    pub vars: BTreeMap<String, Value>,
    /// Live queries started on this connection.
    pub live_ids: HashSet<String>,
    request_count: u64,
    created_at: Instant,
}

impl Session {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            namespace: None,
            database: None,
            user: None,
            token: None,
            vars: BTreeMap::new(),
            live_ids: HashSet::new(),
            request_count: 0,
            created_at: Instant::now(),
        }
    }

    /// The selected namespace and database.
    pub fn scope(&self) -> Result<Scope, FakeDbError> {
        match (&self.namespace, &self.database) {
            (Some(ns), Some(db)) => Ok(Scope::new(ns.clone(), db.clone())),
            _ => Err(FakeDbError::NoDatabase),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn sign_in(&mut self, user: String, token: String) {
        self.user = Some(user);
        self.token = Some(token);
    }

    /// Clears the signed-in user. Returns the token that was in use.
    pub fn sign_out(&mut self) -> Option<String> {
        self.user = None;
        self.token.take()
    }

    pub fn record_request(&mut self) -> u64 {
        self.request_count += 1;
        self.request_count
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn uptime_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_requires_both() {
        let mut session = Session::new(1);
        assert!(matches!(session.scope(), Err(FakeDbError::NoDatabase)));

        session.namespace = Some("test".into());
        assert!(session.scope().is_err());

        session.database = Some("app".into());
        assert_eq!(session.scope().unwrap(), Scope::new("test", "app"));
    }

    #[test]
    fn test_sign_in_out() {
        let mut session = Session::new(7);
        assert!(!session.is_authenticated());

        session.sign_in("root".into(), "tok".into());
        assert!(session.is_authenticated());
        assert_eq!(session.sign_out().as_deref(), Some("tok"));
        assert!(!session.is_authenticated());
        assert!(session.sign_out().is_none());
    }

    #[test]
    fn test_request_counter() {
        let mut session = Session::new(1);
        session.vars.insert("a".into(), json!(1));
        assert_eq!(session.record_request(), 1);
        assert_eq!(session.record_request(), 2);
        assert_eq!(session.request_count(), 2);
        assert_eq!(session.uptime_secs(), 0);
    }
}
