//! Fake server error types.

use tether_protocol::{ErrorCode, ReplyError};
use thiserror::Error;

/// Fake server errors.
#[derive(Debug, Error)]
pub enum FakeDbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tether_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Specify a namespace and database to use")]
    NoDatabase,

    #[error("You don't have permission to perform this query")]
    NotAllowed,

    #[error("There was a problem with authentication")]
    AuthFailed,

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("Method not found")]
    MethodNotFound,

    #[error("Database record `{0}` already exists")]
    RecordExists(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{message}")]
    Injected { code: ErrorCode, message: String },

    #[error("server shutting down")]
    ShuttingDown,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl FakeDbError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            FakeDbError::Protocol(_) | FakeDbError::Json(_) => ErrorCode::ParseError,
            FakeDbError::NoDatabase | FakeDbError::RecordExists(_) | FakeDbError::Parse(_) => {
                ErrorCode::QueryFailed
            }
            FakeDbError::NotAllowed | FakeDbError::AuthFailed => ErrorCode::NotAllowed,
            FakeDbError::InvalidParams(_) => ErrorCode::InvalidParams,
            FakeDbError::MethodNotFound => ErrorCode::MethodNotFound,
            FakeDbError::Injected { code, .. } => *code,
            FakeDbError::Io(_)
            | FakeDbError::ShuttingDown
            | FakeDbError::TlsConfig(_)
            | FakeDbError::TlsHandshake(_) => ErrorCode::InternalError,
        }
    }

    /// The error payload sent back to the client.
    pub fn to_reply_error(&self) -> ReplyError {
        ReplyError::new(self.error_code(), self.to_string())
    }

    pub(crate) fn params(reason: impl Into<String>) -> Self {
        FakeDbError::InvalidParams(reason.into())
    }
}
