//! # tether-client
//!
//! Client library for tether-compatible document databases.
//!
//! This crate provides:
//! - One multiplexed connection shared by any number of concurrent callers
//! - Live query subscriptions delivered as async streams
//! - Automatic reconnection that replays `use` and `authenticate`
//! - Per-statement resolution of batch `query` replies
//! - WebSocket, framed TCP/TLS and in-memory transports

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod id;
pub mod pending;
pub mod query;
pub mod reconnect;
pub mod router;
pub mod session;
pub mod tls;
pub mod transport;

pub use client::Client;
pub use config::{ConnectionConfig, Endpoint, ReconnectConfig, Scheme, TlsClientConfig};
pub use connection::{CloseCause, Connection, ConnectionOptions, ConnectionStats};
pub use error::{ClientError, ErrorClass};
pub use id::{IdGenerator, RandomIdGenerator, SequentialIdGenerator};
pub use query::{QueryErrors, QueryResolver, QueryResponse, QueryResult, StatementError};
pub use reconnect::{ConnectionState, Reconnector, RequestOptions};
pub use router::{CloseReason, LiveStream, NotificationRouter};
pub use session::SessionState;
pub use transport::{Dialer, FrameReader, FrameWriter, MemoryTransport, Transport};

pub use tether_protocol::{Action, Method, Notification, PatchOp};
