//! Client error types and retry classification.

use crate::query::QueryErrors;
use std::time::Duration;
use tether_protocol::{ErrorCode, Method, ProtocolError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("framing error: {0}")]
    Framing(ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("client closed")]
    Closed,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("server error on {method}: {message} ({code})")]
    Server {
        method: Method,
        code: ErrorCode,
        message: String,
    },

    #[error("{0}")]
    Query(QueryErrors),

    #[error("no row found for {0}")]
    NoRow(String),

    #[error("encode error: {0}")]
    Encode(ProtocolError),

    #[error("decode error: {0}")]
    Decode(ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request id already in use: {0}")]
    IdCollision(String),

    #[error("live query already registered: {0}")]
    SubscriptionExists(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

/// Who is responsible for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The connection failed or was unavailable.
    Connection,
    /// The caller's deadline elapsed.
    Timeout,
    /// The server rejected the request.
    Server,
    /// One or more statements of a batch failed on the server.
    Statement,
    /// A client-side bug, bad input or incompatible data.
    Local,
}

impl ClientError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ClientError::Io(_)
            | ClientError::WebSocket(_)
            | ClientError::Framing(_)
            | ClientError::NotConnected
            | ClientError::ConnectionClosed { .. }
            | ClientError::Closed
            | ClientError::IdCollision(_)
            | ClientError::TlsHandshake(_) => ErrorClass::Connection,
            ClientError::Timeout(_) | ClientError::ConnectTimeout(_) => ErrorClass::Timeout,
            ClientError::Server { .. } | ClientError::NoRow(_) => ErrorClass::Server,
            ClientError::Query(_) => ErrorClass::Statement,
            ClientError::Encode(_)
            | ClientError::Decode(_)
            | ClientError::Json(_)
            | ClientError::SubscriptionExists(_)
            | ClientError::InvalidEndpoint(_)
            | ClientError::TlsConfig(_) => ErrorClass::Local,
        }
    }

    /// Returns whether resubmitting the same request is safe.
    ///
    /// Transport failures, timeouts and id collisions are retriable. A server
    /// error is retriable only for `query`, where it signals a transient
    /// failure of the whole batch; for record methods it is a rejection.
    /// Statement errors and local encode/decode errors never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Closed => false,
            ClientError::Server { method, .. } => *method == Method::Query,
            _ => matches!(self.class(), ErrorClass::Connection | ErrorClass::Timeout),
        }
    }

    /// True when the connection carrying the request is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionClosed { .. }
                | ClientError::Io(_)
                | ClientError::WebSocket(_)
                | ClientError::Framing(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::StatementError;

    fn server(method: Method) -> ClientError {
        ClientError::Server {
            method,
            code: ErrorCode::QueryFailed,
            message: "There was a problem with the database".to_string(),
        }
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        let io = ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(io.is_retryable());
        assert!(ClientError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ClientError::ConnectionClosed {
            reason: "eof".into()
        }
        .is_retryable());
        assert!(ClientError::NotConnected.is_retryable());
        assert!(ClientError::IdCollision("abc".into()).is_retryable());
    }

    #[test]
    fn test_server_error_retryable_only_for_query() {
        assert!(server(Method::Query).is_retryable());
        assert!(!server(Method::Create).is_retryable());
        assert!(!server(Method::Select).is_retryable());
        assert_eq!(server(Method::Create).class(), ErrorClass::Server);
    }

    #[test]
    fn test_statement_and_local_errors_not_retryable() {
        let statement = ClientError::Query(QueryErrors::new(vec![StatementError::Failed {
            index: 0,
            message: "bad".into(),
        }]));
        assert!(!statement.is_retryable());
        assert_eq!(statement.class(), ErrorClass::Statement);

        let decode = ClientError::Decode(ProtocolError::MissingField("id"));
        assert!(!decode.is_retryable());
        assert_eq!(decode.class(), ErrorClass::Local);

        let json = serde_json::from_str::<u32>("x").unwrap_err();
        assert!(!ClientError::Json(json).is_retryable());
    }

    #[test]
    fn test_closed_client_not_retryable() {
        assert!(!ClientError::Closed.is_retryable());
        assert_eq!(ClientError::Closed.class(), ErrorClass::Connection);
    }

    #[test]
    fn test_display() {
        let err = server(Method::Query);
        assert_eq!(
            err.to_string(),
            "server error on query: There was a problem with the database (QUERY_FAILED)"
        );
        assert_eq!(
            ClientError::NoRow("person:x".into()).to_string(),
            "no row found for person:x"
        );
    }
}
