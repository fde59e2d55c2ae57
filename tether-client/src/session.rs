//! Server-side session state mirrored on the client, replayed after reconnect.

use serde_json::Value;
use std::collections::BTreeMap;
use tether_protocol::Method;

/// What a fresh connection must be told to behave like the old one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub namespace: Option<String>,
    pub database: Option<String>,
    pub token: Option<String>,
    /// Variables set with `let`.
    pub vars: BTreeMap<String, Value>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.namespace.is_none()
            && self.database.is_none()
            && self.token.is_none()
            && self.vars.is_empty()
    }

    /// Records the effect of a successful call. Methods that do not touch the
    /// session are ignored.
    pub fn observe(&mut self, method: Method, params: &[Value], result: &Value) {
        match method {
            Method::Use => {
                if let Some(Value::String(ns)) = params.first() {
                    self.namespace = Some(ns.clone());
                }
                if let Some(Value::String(db)) = params.get(1) {
                    self.database = Some(db.clone());
                }
            }
            Method::Signin | Method::Signup => {
                if let Value::String(token) = result {
                    self.token = Some(token.clone());
                }
            }
            Method::Authenticate => {
                if let Some(Value::String(token)) = params.first() {
                    self.token = Some(token.clone());
                }
            }
            Method::Invalidate => {
                self.token = None;
            }
            Method::Let => {
                if let Some(Value::String(name)) = params.first() {
                    let value = params.get(1).cloned().unwrap_or(Value::Null);
                    self.vars.insert(name.clone(), value);
                }
            }
            Method::Unset => {
                if let Some(Value::String(name)) = params.first() {
                    self.vars.remove(name);
                }
            }
            _ => {}
        }
    }

    /// Requests that restore this session on a new connection, in order:
    /// `use`, then `authenticate`, then one `let` per variable.
    pub fn replay_plan(&self) -> Vec<(Method, Vec<Value>)> {
        let mut plan = Vec::with_capacity(2 + self.vars.len());

        if self.namespace.is_some() || self.database.is_some() {
            plan.push((
                Method::Use,
                vec![optional(&self.namespace), optional(&self.database)],
            ));
        }
        if let Some(token) = &self.token {
            plan.push((Method::Authenticate, vec![Value::String(token.clone())]));
        }
        for (name, value) in &self.vars {
            plan.push((Method::Let, vec![Value::String(name.clone()), value.clone()]));
        }

        plan
    }
}

fn optional(value: &Option<String>) -> Value {
    value
        .as_ref()
        .map(|v| Value::String(v.clone()))
        .unwrap_or(Value::Null)
}
