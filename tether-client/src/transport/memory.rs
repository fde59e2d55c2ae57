//! In-process transport: two ends joined by unbounded channels.

use super::{FrameReader, FrameWriter, Transport};
use crate::error::ClientError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// One end of an in-memory duplex pipe.
///
/// Dropping (or shutting down) one end is end-of-stream for the other.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryTransport {
    /// Creates two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }

    pub fn into_halves(self) -> (MemoryFrameReader, MemoryFrameWriter) {
        (
            MemoryFrameReader { rx: self.rx },
            MemoryFrameWriter { tx: Some(self.tx) },
        )
    }
}

impl Transport for MemoryTransport {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (reader, writer) = self.into_halves();
        (Box::new(reader), Box::new(writer))
    }
}

pub struct MemoryFrameReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryFrameReader {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

#[async_trait]
impl FrameReader for MemoryFrameReader {
    async fn read_frame(&mut self) -> Result<Option<Bytes>, ClientError> {
        Ok(self.rx.recv().await)
    }
}

pub struct MemoryFrameWriter {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl MemoryFrameWriter {
    pub fn send(&self, frame: Bytes) -> Result<(), ClientError> {
        let tx = self.tx.as_ref().ok_or_else(|| ClientError::ConnectionClosed {
            reason: "memory transport shut down".to_string(),
        })?;
        tx.send(frame).map_err(|_| ClientError::ConnectionClosed {
            reason: "memory peer dropped".to_string(),
        })
    }
}

#[async_trait]
impl FrameWriter for MemoryFrameWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), ClientError> {
        self.send(frame)
    }

    async fn shutdown(&mut self) -> Result<(), ClientError> {
        self.tx.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = MemoryTransport::pair();
        let (_a_reader, mut a_writer) = Box::new(a).split();
        let (mut b_reader, _b_writer) = Box::new(b).split();

        a_writer.write_frame(Bytes::from_static(b"one")).await.unwrap();
        a_writer.write_frame(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(b_reader.read_frame().await.unwrap().unwrap(), "one");
        assert_eq!(b_reader.read_frame().await.unwrap().unwrap(), "two");
    }

    #[tokio::test]
    async fn test_shutdown_is_end_of_stream() {
        let (a, b) = MemoryTransport::pair();
        let (_a_reader, mut a_writer) = Box::new(a).split();
        let (mut b_reader, _b_writer) = Box::new(b).split();

        a_writer.shutdown().await.unwrap();
        assert!(b_reader.read_frame().await.unwrap().is_none());
        assert!(a_writer.write_frame(Bytes::from_static(b"late")).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_peer_fails_writes() {
        let (a, b) = MemoryTransport::pair();
        drop(b);
        let (_reader, mut writer) = Box::new(a).split();
        let err = writer.write_frame(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed { .. }));
    }
}
