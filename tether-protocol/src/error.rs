//! Protocol error types and server error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while framing, encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'TTHR', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Error codes carried in the `error.code` field of a reply.
///
/// Integers on the wire. Codes the client does not know are preserved as
/// [`ErrorCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    /// The server could not execute the request against the database.
    QueryFailed,
    /// The session is not allowed to perform the request.
    NotAllowed,
    Other(i64),
}

impl ErrorCode {
    pub fn as_i64(&self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::QueryFailed => -32000,
            ErrorCode::NotAllowed => -32002,
            ErrorCode::Other(code) => *code,
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            -32000 => ErrorCode::QueryFailed,
            -32002 => ErrorCode::NotAllowed,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for i64 {
    fn from(code: ErrorCode) -> Self {
        code.as_i64()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::ParseError => write!(f, "PARSE_ERROR"),
            ErrorCode::InvalidRequest => write!(f, "INVALID_REQUEST"),
            ErrorCode::MethodNotFound => write!(f, "METHOD_NOT_FOUND"),
            ErrorCode::InvalidParams => write!(f, "INVALID_PARAMS"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
            ErrorCode::QueryFailed => write!(f, "QUERY_FAILED"),
            ErrorCode::NotAllowed => write!(f, "NOT_ALLOWED"),
            ErrorCode::Other(code) => write!(f, "CODE_{}", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_integer_mapping() {
        assert_eq!(ErrorCode::from(-32700), ErrorCode::ParseError);
        assert_eq!(ErrorCode::from(-32000), ErrorCode::QueryFailed);
        assert_eq!(ErrorCode::from(-1), ErrorCode::Other(-1));
        assert_eq!(ErrorCode::NotAllowed.as_i64(), -32002);
        assert_eq!(ErrorCode::Other(42).as_i64(), 42);
    }

    #[test]
    fn test_error_code_serializes_as_integer() {
        let json = serde_json::to_string(&ErrorCode::MethodNotFound).unwrap();
        assert_eq!(json, "-32601");

        let code: ErrorCode = serde_json::from_str("-32602").unwrap();
        assert_eq!(code, ErrorCode::InvalidParams);

        let unknown: ErrorCode = serde_json::from_str("7").unwrap();
        assert_eq!(unknown, ErrorCode::Other(7));
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::ParseError.to_string(), "PARSE_ERROR");
        assert_eq!(ErrorCode::InternalError.to_string(), "INTERNAL_ERROR");
        assert_eq!(ErrorCode::Other(-5).to_string(), "CODE_-5");
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidMagic(*b"XXXX");
        assert!(err.to_string().contains("invalid magic"));

        let err = ProtocolError::FrameTooLarge {
            size: 20_000_000,
            max: 16_777_216,
        };
        assert!(err.to_string().contains("20000000"));

        let err = ProtocolError::InvalidField {
            field: "action",
            reason: "unknown action 'MOVE'".to_string(),
        };
        assert_eq!(err.to_string(), "invalid field 'action': unknown action 'MOVE'");
    }
}
