//! Framed transport over a byte stream (plain TCP or TLS).

use super::{Dialer, FrameReader, FrameWriter, Transport};
use crate::config::{ConnectionConfig, Endpoint, TlsClientConfig};
use crate::error::ClientError;
use crate::tls;
use async_trait::async_trait;
use bytes::Bytes;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tether_protocol::{Frame, FrameDecoder};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;

pin_project! {
    /// A client stream that can be either plain TCP or TLS.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: ClientTlsStream<TcpStream> },
    }
}

impl ClientStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_flush(cx),
            ClientStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

/// Frames envelopes over any async byte stream.
pub struct StreamTransport<S> {
    stream: S,
    kind: &'static str,
    read_buffer_size: usize,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, kind: &'static str, read_buffer_size: usize) -> Self {
        Self {
            stream,
            kind,
            read_buffer_size,
        }
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (reader, writer) = tokio::io::split(self.stream);
        (
            Box::new(StreamFrameReader {
                reader,
                decoder: FrameDecoder::new(),
                buf: vec![0u8; self.read_buffer_size],
            }),
            Box::new(StreamFrameWriter { writer }),
        )
    }
}

struct StreamFrameReader<S> {
    reader: ReadHalf<S>,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

#[async_trait]
impl<S> FrameReader for StreamFrameReader<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read_frame(&mut self) -> Result<Option<Bytes>, ClientError> {
        loop {
            if let Some(frame) = self.decoder.decode_frame().map_err(ClientError::Framing)? {
                return Ok(Some(frame.payload));
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    return Err(ClientError::ConnectionClosed {
                        reason: format!(
                            "peer closed mid-frame with {} bytes buffered",
                            self.decoder.buffered()
                        ),
                    });
                }
                return Ok(None);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }
}

struct StreamFrameWriter<S> {
    writer: WriteHalf<S>,
}

#[async_trait]
impl<S> FrameWriter for StreamFrameWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), ClientError> {
        let encoded = Frame::new(frame).encode().map_err(ClientError::Encode)?;
        self.writer.write_all(&encoded).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Dials `tcp://` and `tls://` endpoints.
pub struct StreamDialer {
    endpoint: Endpoint,
    tls: Option<TlsClientConfig>,
    connect_timeout: Duration,
    read_buffer_size: usize,
}

impl StreamDialer {
    pub fn new(config: &ConnectionConfig) -> Self {
        let tls = match (&config.tls, config.endpoint.scheme.is_secure()) {
            (Some(tls), _) => Some(tls.clone()),
            (None, true) => Some(TlsClientConfig::default()),
            (None, false) => None,
        };
        Self {
            endpoint: config.endpoint.clone(),
            tls,
            connect_timeout: config.connect_timeout,
            read_buffer_size: config.read_buffer_size,
        }
    }
}

#[async_trait]
impl Dialer for StreamDialer {
    async fn dial(&self) -> Result<Box<dyn Transport>, ClientError> {
        let addr = self.endpoint.authority();
        tracing::debug!("Connecting to {}...", addr);

        let tcp_stream =
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr.as_str()))
                .await
                .map_err(|_| ClientError::ConnectTimeout(self.connect_timeout))??;

        tcp_stream.set_nodelay(true).ok();

        let stream = match self.tls {
            Some(ref tls_config) => {
                let connector = TlsConnector::from(tls::client_config(tls_config)?);
                let server_name = tls::server_name(tls_config, &self.endpoint.host)?;

                tracing::debug!("Performing TLS handshake...");
                let tls_stream = connector
                    .connect(server_name, tcp_stream)
                    .await
                    .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
                ClientStream::Tls { stream: tls_stream }
            }
            None => ClientStream::Plain { stream: tcp_stream },
        };

        let kind = if stream.is_tls() { "tls" } else { "tcp" };
        tracing::debug!("Connected to {} over {}", addr, kind);
        Ok(Box::new(StreamTransport::new(
            stream,
            kind,
            self.read_buffer_size,
        )))
    }

    fn target(&self) -> String {
        self.endpoint.url()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_survive_stream_chunking() {
        let (client, server) = tokio::io::duplex(64);
        let transport = Box::new(StreamTransport::new(client, "duplex", 16));
        let (mut reader, mut writer) = transport.split();

        let peer = Box::new(StreamTransport::new(server, "duplex", 16));
        let (mut peer_reader, mut peer_writer) = peer.split();

        let payload = Bytes::from(vec![b'x'; 300]);
        writer.write_frame(payload.clone()).await.unwrap();
        writer.write_frame(Bytes::from_static(b"{}")).await.unwrap();

        assert_eq!(peer_reader.read_frame().await.unwrap().unwrap(), payload);
        assert_eq!(peer_reader.read_frame().await.unwrap().unwrap(), "{}");

        peer_writer.write_frame(Bytes::from_static(b"reply")).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), "reply");
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let (client, server) = tokio::io::duplex(64);
        let (mut reader, _writer) = Box::new(StreamTransport::new(client, "duplex", 1024)).split();
        drop(server);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_error() {
        let (client, mut server) = tokio::io::duplex(64);
        let (mut reader, _writer) = Box::new(StreamTransport::new(client, "duplex", 1024)).split();

        let encoded = Frame::new(Bytes::from_static(b"{\"id\":\"1\"}"))
            .encode()
            .unwrap();
        server.write_all(&encoded[..20]).await.unwrap();
        drop(server);

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_garbage_is_framing_error() {
        let (client, mut server) = tokio::io::duplex(64);
        let (mut reader, _writer) = Box::new(StreamTransport::new(client, "duplex", 1024)).split();

        server.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, ClientError::Framing(_)));
    }

    #[test]
    fn test_secure_scheme_implies_tls() {
        let config = ConnectionConfig::parse("tls://db.example.com:8000").unwrap();
        assert!(StreamDialer::new(&config).tls.is_some());

        let config = ConnectionConfig::parse("tcp://db.example.com:8000").unwrap();
        let dialer = StreamDialer::new(&config);
        assert!(dialer.tls.is_none());
        assert_eq!(dialer.target(), "tcp://db.example.com:8000");
    }
}
