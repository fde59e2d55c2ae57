//! Users and bearer tokens.
//!
//! Passwords are stored as SHA-256 hashes. Tokens are random and live until
//! invalidated or the server stops.

use crate::config::UserConfig;
use crate::error::FakeDbError;
use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Validates credentials and issues tokens.
#[derive(Debug, Default)]
pub struct Authenticator {
    /// user name -> password hash (SHA-256 hex).
    users: RwLock<HashMap<String, String>>,
    /// token -> user name.
    tokens: DashMap<String, String>,
}

impl Authenticator {
    pub fn new(users: impl IntoIterator<Item = UserConfig>) -> Self {
        Self {
            users: RwLock::new(
                users
                    .into_iter()
                    .map(|user| (user.name, user.password_hash.to_lowercase()))
                    .collect(),
            ),
            tokens: DashMap::new(),
        }
    }

    /// Hashes a password using SHA-256, returning a lowercase hex string.
    pub fn hash_password(password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    /// Registers a new user. Existing names are rejected.
    pub fn add_user(&self, name: &str, password: &str) -> Result<(), FakeDbError> {
        let mut users = self.users.write();
        if users.contains_key(name) {
            return Err(FakeDbError::AuthFailed);
        }
        users.insert(name.to_string(), Self::hash_password(password));
        Ok(())
    }

    pub fn verify(&self, name: &str, password: &str) -> bool {
        self.users
            .read()
            .get(name)
            .is_some_and(|hash| *hash == Self::hash_password(password))
    }

    /// Checks the credentials and issues a token.
    pub fn signin(&self, name: &str, password: &str) -> Result<String, FakeDbError> {
        if !self.verify(name, password) {
            return Err(FakeDbError::AuthFailed);
        }
        Ok(self.issue(name))
    }

    pub fn issue(&self, name: &str) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.tokens.insert(token.clone(), name.to_string());
        token
    }

    /// Returns the user a token was issued to.
    pub fn validate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|user| user.clone())
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }
}
