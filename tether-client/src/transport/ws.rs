//! WebSocket transport: one envelope per message.

use super::{Dialer, FrameReader, FrameWriter, Transport};
use crate::config::{ConnectionConfig, Endpoint, TlsClientConfig};
use crate::error::ClientError;
use crate::tls;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> ClientError {
    ClientError::WebSocket(e.to_string())
}

pub struct WsTransport {
    stream: WsStream,
}

impl WsTransport {
    pub fn new(stream: WsStream) -> Self {
        Self { stream }
    }
}

impl Transport for WsTransport {
    fn kind(&self) -> &'static str {
        "ws"
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (sink, stream) = self.stream.split();
        (
            Box::new(WsFrameReader { stream }),
            Box::new(WsFrameWriter { sink }),
        )
    }
}

struct WsFrameReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for WsFrameReader {
    async fn read_frame(&mut self) -> Result<Option<Bytes>, ClientError> {
        loop {
            let message = match self.stream.next().await {
                Some(message) => message.map_err(ws_error)?,
                None => return Ok(None),
            };
            match message {
                Message::Binary(data) => return Ok(Some(Bytes::from(data))),
                Message::Text(text) => return Ok(Some(Bytes::from(text.into_bytes()))),
                Message::Close(frame) => {
                    tracing::debug!("WebSocket closed by peer: {:?}", frame);
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}

struct WsFrameWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for WsFrameWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), ClientError> {
        self.sink
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(ws_error)
    }

    async fn shutdown(&mut self) -> Result<(), ClientError> {
        self.sink.close().await.map_err(ws_error)
    }
}

/// Dials `ws://` and `wss://` endpoints.
pub struct WsDialer {
    endpoint: Endpoint,
    tls: Option<TlsClientConfig>,
    connect_timeout: Duration,
    subprotocol: String,
}

impl WsDialer {
    pub fn new(config: &ConnectionConfig, subprotocol: &str) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            tls: config.tls.clone(),
            connect_timeout: config.connect_timeout,
            subprotocol: subprotocol.to_string(),
        }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> Result<Box<dyn Transport>, ClientError> {
        let url = self.endpoint.url();
        tracing::debug!("Opening WebSocket to {}...", url);

        let mut request = url.as_str().into_client_request().map_err(ws_error)?;
        let protocol = HeaderValue::from_str(&self.subprotocol)
            .map_err(|e| ClientError::InvalidEndpoint(e.to_string()))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);

        // Without explicit TLS settings tungstenite falls back to the webpki roots.
        let connector = match (&self.tls, self.endpoint.scheme.is_secure()) {
            (Some(tls_config), true) => Some(Connector::Rustls(tls::client_config(tls_config)?)),
            _ => None,
        };

        let (stream, response) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async_tls_with_config(request, None, true, connector),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout(self.connect_timeout))?
        .map_err(ws_error)?;

        tracing::debug!("WebSocket open ({})", response.status());
        Ok(Box::new(WsTransport::new(stream)))
    }

    fn target(&self) -> String {
        self.endpoint.url()
    }
}
