//! # tether-fakedb
//!
//! An in-process fake database server for testing tether clients.
//!
//! This crate provides:
//! - Connection handling over any client transport (in-memory pairs or framed TCP/TLS)
//! - An in-memory record store partitioned by namespace and database
//! - Users with hashed passwords and bearer tokens
//! - Live queries with change notifications
//! - A tiny statement interpreter for `query`, including transactions
//! - Failure injection: delays, dropped connections, invalid replies, forced errors

pub mod auth;
pub mod config;
pub mod error;
pub mod failure;
pub mod handler;
pub mod live;
pub mod server;
pub mod session;
pub mod statement;
pub mod store;
pub mod tls;

pub use auth::Authenticator;
pub use config::{AuthConfig, ConfigError, FakeDbConfig, NetworkConfig, TlsConfig, UserConfig};
pub use error::FakeDbError;
pub use failure::{Failure, FailurePlan, FailureRule};
pub use handler::CommandHandler;
pub use live::LiveRegistry;
pub use server::{FakeServer, ServerStats};
pub use session::Session;
pub use store::{Scope, Store, Target};
