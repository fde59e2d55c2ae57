//! Transport abstraction: a duplex connection that moves opaque frames.
//!
//! A [`Transport`] is split once into its reading and writing halves. The
//! reading half is owned by the connection's read loop, the writing half by
//! its write loop. A [`Dialer`] opens new transports and is what
//! the reconnector calls after a failure.

mod memory;
mod stream;
mod ws;

pub use memory::{MemoryFrameReader, MemoryFrameWriter, MemoryTransport};
pub use stream::{ClientStream, StreamDialer, StreamTransport};
pub use ws::{WsDialer, WsTransport};

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Receiving half of a transport.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Reads the next frame. `Ok(None)` means the peer closed the connection.
    async fn read_frame(&mut self) -> Result<Option<Bytes>, ClientError>;
}

/// Sending half of a transport.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    /// Writes one complete frame.
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), ClientError>;

    /// Closes the sending direction.
    async fn shutdown(&mut self) -> Result<(), ClientError>;
}

/// An open duplex connection.
pub trait Transport: Send + 'static {
    /// Short name used in logs, e.g. `"ws"` or `"tcp"`.
    fn kind(&self) -> &'static str;

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>);
}

/// Opens transports to one endpoint.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> Result<Box<dyn Transport>, ClientError>;

    /// Human readable target, for logs.
    fn target(&self) -> String;
}

/// Picks the dialer matching the endpoint scheme.
pub fn dialer_for(config: &ConnectionConfig, subprotocol: &str) -> Arc<dyn Dialer> {
    if config.endpoint.scheme.is_websocket() {
        Arc::new(WsDialer::new(config, subprotocol))
    } else {
        Arc::new(StreamDialer::new(config))
    }
}
