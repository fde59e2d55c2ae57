//! # tether-protocol
//!
//! Wire protocol for tether, an RPC client for document databases.
//!
//! This crate provides:
//! - Request, reply and live-query notification envelopes
//! - The method catalogue and server error codes
//! - The pluggable [`Codec`] contract with a JSON implementation
//! - Binary framing with length prefix and CRC32C validation for byte-stream transports

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Codec, FrameDecoder, JsonCodec};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{
    Action, Envelope, Method, Notification, PatchOp, QueryStatus, RawQueryResult, Reply,
    ReplyError, Request, NOT_EXECUTED_MESSAGE,
};

/// Protocol version carried in every frame header.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port of a tether-compatible server.
pub const DEFAULT_PORT: u16 = 8000;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
