//! Envelope types exchanged over a tether connection.
//!
//! Replies and notifications are told apart structurally: a reply carries the
//! id of an outstanding request, a notification carries a live query id and an
//! action. The decoded [`Envelope`] keeps every field optional so the caller,
//! which knows the outstanding ids, can make that decision.

use crate::error::{ErrorCode, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Message reported by the server for statements skipped by a failed transaction.
pub const NOT_EXECUTED_MESSAGE: &str = "The query was not executed due to a failed transaction";

/// RPC methods understood by a tether-compatible server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    // Session
    Use,
    Info,
    Version,
    Ping,
    Signup,
    Signin,
    Authenticate,
    Invalidate,
    Let,
    Unset,

    // Live queries
    Live,
    Kill,

    // Statements
    Query,

    // Records
    Select,
    Create,
    Insert,
    Update,
    Upsert,
    Relate,
    Merge,
    Patch,
    Delete,
}

impl Method {
    pub const ALL: [Method; 22] = [
        Method::Use,
        Method::Info,
        Method::Version,
        Method::Ping,
        Method::Signup,
        Method::Signin,
        Method::Authenticate,
        Method::Invalidate,
        Method::Let,
        Method::Unset,
        Method::Live,
        Method::Kill,
        Method::Query,
        Method::Select,
        Method::Create,
        Method::Insert,
        Method::Update,
        Method::Upsert,
        Method::Relate,
        Method::Merge,
        Method::Patch,
        Method::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Use => "use",
            Method::Info => "info",
            Method::Version => "version",
            Method::Ping => "ping",
            Method::Signup => "signup",
            Method::Signin => "signin",
            Method::Authenticate => "authenticate",
            Method::Invalidate => "invalidate",
            Method::Let => "let",
            Method::Unset => "unset",
            Method::Live => "live",
            Method::Kill => "kill",
            Method::Query => "query",
            Method::Select => "select",
            Method::Create => "create",
            Method::Insert => "insert",
            Method::Update => "update",
            Method::Upsert => "upsert",
            Method::Relate => "relate",
            Method::Merge => "merge",
            Method::Patch => "patch",
            Method::Delete => "delete",
        }
    }

    /// Whether a successful call changes the server-side session state.
    pub fn affects_session(&self) -> bool {
        matches!(
            self,
            Method::Use
                | Method::Signup
                | Method::Signin
                | Method::Authenticate
                | Method::Invalidate
                | Method::Let
                | Method::Unset
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Method::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == lower)
            .ok_or_else(|| ProtocolError::InvalidField {
                field: "method",
                reason: format!("unknown method '{}'", s),
            })
    }
}

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Client-generated correlation id.
    pub id: String,
    pub method: Method,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Request {
    pub fn new(id: impl Into<String>, method: Method) -> Self {
        Self {
            id: id.into(),
            method,
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }
}

/// Error payload of a failed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyError {
    pub code: ErrorCode,
    pub message: String,
}

impl ReplyError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code.as_i64())
    }
}

/// Reply envelope, correlated to a request by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl Reply {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ReplyError) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Splits the reply into its result or its error. An absent result is `null`.
    pub fn into_result(self) -> Result<Value, ReplyError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Kind of change reported by a live query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        }
    }

    fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "CREATE" => Ok(Action::Create),
            "UPDATE" => Ok(Action::Update),
            "DELETE" => Ok(Action::Delete),
            other => Err(ProtocolError::InvalidField {
                field: "action",
                reason: format!("unknown action '{}'", other),
            }),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change pushed by the server for a live query.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Live query id. On the wire this is the `id` field.
    pub subscription_id: String,
    pub action: Action,
    /// The changed record, or a list of diff operations for diff-mode live queries.
    pub result: Value,
}

impl Notification {
    pub fn new(subscription_id: impl Into<String>, action: Action, result: Value) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            action,
            result,
        }
    }

    /// Builds a notification from its `{id, action, result}` object.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::InvalidField {
                field: "result",
                reason: "notification must be an object".to_string(),
            });
        };

        let subscription_id = match fields.remove("id") {
            Some(Value::String(id)) => id,
            Some(other) => {
                return Err(ProtocolError::InvalidField {
                    field: "id",
                    reason: format!("expected string, got {}", other),
                })
            }
            None => return Err(ProtocolError::MissingField("id")),
        };

        let action = match fields.remove("action") {
            Some(Value::String(action)) => Action::parse(&action)?,
            Some(other) => {
                return Err(ProtocolError::InvalidField {
                    field: "action",
                    reason: format!("expected string, got {}", other),
                })
            }
            None => return Err(ProtocolError::MissingField("action")),
        };

        let result = fields.remove("result").unwrap_or(Value::Null);

        Ok(Self {
            subscription_id,
            action,
            result,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut fields = Map::with_capacity(3);
        fields.insert("id".to_string(), Value::String(self.subscription_id.clone()));
        fields.insert("action".to_string(), Value::String(self.action.to_string()));
        fields.insert("result".to_string(), self.result.clone());
        Value::Object(fields)
    }
}

/// Structural decode of any inbound frame.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ReplyError>,
    #[serde(default)]
    pub action: Option<Value>,
}

impl Envelope {
    /// True for both notification shapes: a flat `{id, action, result}`
    /// frame, or a frame without id whose `result` is such an object.
    pub fn is_notification(&self) -> bool {
        if self.action.is_some() {
            return true;
        }
        self.id.is_none()
            && self
                .result
                .as_ref()
                .is_some_and(|result| result.get("action").is_some() && result.get("id").is_some())
    }

    pub fn into_reply(self) -> Result<Reply, ProtocolError> {
        let id = self.id.ok_or(ProtocolError::MissingField("id"))?;
        Ok(Reply {
            id,
            result: self.result,
            error: self.error,
        })
    }

    pub fn into_notification(self) -> Result<Notification, ProtocolError> {
        match self.action {
            Some(action) => {
                let mut fields = Map::with_capacity(3);
                if let Some(id) = self.id {
                    fields.insert("id".to_string(), Value::String(id));
                }
                fields.insert("action".to_string(), action);
                fields.insert("result".to_string(), self.result.unwrap_or(Value::Null));
                Notification::from_value(Value::Object(fields))
            }
            None => Notification::from_value(
                self.result.ok_or(ProtocolError::MissingField("result"))?,
            ),
        }
    }
}

/// JSON patch operation, as accepted by the `patch` method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PatchOp {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: "add".to_string(),
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: "replace".to_string(),
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: "remove".to_string(),
            path: path.into(),
            value: None,
        }
    }
}

/// Outcome status of one statement in a `query` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERR")]
    Err,
}

/// One statement's raw outcome inside a `query` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawQueryResult {
    pub status: QueryStatus,
    /// Execution time as reported by the server, e.g. `"29.375µs"`.
    #[serde(default)]
    pub time: String,
    /// Statement result, or the error message when `status` is `ERR`.
    #[serde(default)]
    pub result: Value,
}

impl RawQueryResult {
    pub fn ok(time: impl Into<String>, result: Value) -> Self {
        Self {
            status: QueryStatus::Ok,
            time: time.into(),
            result,
        }
    }

    pub fn err(time: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: QueryStatus::Err,
            time: time.into(),
            result: Value::String(message.into()),
        }
    }
}
