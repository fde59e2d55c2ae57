//! Fake server: connection handling, failure injection and the TCP listener.

use crate::auth::Authenticator;
use crate::config::FakeDbConfig;
use crate::error::FakeDbError;
use crate::failure::{Failure, FailurePlan};
use crate::handler::CommandHandler;
use crate::live::LiveRegistry;
use crate::session::Session;
use crate::store::Store;
use crate::tls;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tether_client::config::DEFAULT_READ_BUFFER_SIZE;
use tether_client::transport::{FrameReader, FrameWriter, StreamTransport};
use tether_client::{ClientError, Dialer, MemoryTransport, Transport};
use tether_protocol::{Codec, ErrorCode, JsonCodec, Method, Reply, ReplyError};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_rustls::TlsAcceptor;

/// Bytes sent for [`Failure::InvalidResponse`].
const INVALID_RESPONSE: &[u8] = b"\x00\x01 this is not an envelope";

/// Work for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(Bytes),
    Close,
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub failures_injected: AtomicU64,
    pub malformed_total: AtomicU64,
}

struct Inner {
    config: FakeDbConfig,
    codec: Arc<dyn Codec>,
    handler: CommandHandler,
    store: Arc<Store>,
    auth: Arc<Authenticator>,
    live: Arc<LiveRegistry>,
    failures: FailurePlan,
    next_conn_id: AtomicU64,
    /// Per-connection kill switches.
    connections: DashMap<u64, watch::Sender<bool>>,
    request_log: Mutex<Vec<(u64, Method)>>,
    accepting: AtomicBool,
    running: AtomicBool,
    shutdown: broadcast::Sender<()>,
    stats: ServerStats,
}

/// An in-process server speaking the tether protocol.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct FakeServer {
    inner: Arc<Inner>,
}

impl FakeServer {
    pub fn new(config: FakeDbConfig) -> Self {
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
        let store = Arc::new(Store::new());
        let auth = Arc::new(Authenticator::new(config.auth.users.clone()));
        let live = Arc::new(LiveRegistry::new(codec.clone()));
        let handler = CommandHandler::new(
            auth.clone(),
            store.clone(),
            live.clone(),
            config.auth.required,
            config.version.clone(),
        );
        let failures = FailurePlan::new(config.failures.clone());
        let (shutdown, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(Inner {
                config,
                codec,
                handler,
                store,
                auth,
                live,
                failures,
                next_conn_id: AtomicU64::new(1),
                connections: DashMap::new(),
                request_log: Mutex::new(Vec::new()),
                accepting: AtomicBool::new(true),
                running: AtomicBool::new(false),
                shutdown,
                stats: ServerStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &FakeDbConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    pub fn auth(&self) -> &Arc<Authenticator> {
        &self.inner.auth
    }

    pub fn live(&self) -> &Arc<LiveRegistry> {
        &self.inner.live
    }

    /// Armed failures. Rules can be added while clients are connected.
    pub fn failures(&self) -> &FailurePlan {
        &self.inner.failures
    }

    pub fn stats(&self) -> &ServerStats {
        &self.inner.stats
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// `(connection id, method)` of every decoded request, in arrival order.
    pub fn request_log(&self) -> Vec<(u64, Method)> {
        self.inner.request_log.lock().clone()
    }

    pub fn clear_request_log(&self) {
        self.inner.request_log.lock().clear();
    }

    /// When `false`, the in-memory dialer refuses new connections.
    pub fn set_accepting(&self, accepting: bool) {
        self.inner.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Severs every open connection. Returns how many were closed.
    pub fn drop_connections(&self) -> usize {
        let mut dropped = 0;
        for entry in self.inner.connections.iter() {
            if entry.value().send(true).is_ok() {
                dropped += 1;
            }
        }
        tracing::info!(dropped, "dropping all connections");
        dropped
    }

    /// A dialer that opens in-memory connections to this server.
    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(MemoryDialer {
            server: self.clone(),
        })
    }

    /// Serves one client transport until either side closes it. Returns the
    /// connection id.
    pub fn attach(&self, transport: Box<dyn Transport>) -> u64 {
        let inner = &self.inner;
        let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let kind = transport.kind();
        let (reader, mut writer) = transport.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let (kill_tx, kill_rx) = watch::channel(false);

        inner.connections.insert(conn_id, kill_tx);
        inner.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        inner.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        tracing::info!(conn = conn_id, kind, "client connected");

        tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Frame(frame) => {
                        if let Err(e) = writer.write_frame(frame).await {
                            tracing::debug!(conn = conn_id, "write failed: {}", e);
                            break;
                        }
                    }
                    Outbound::Close => break,
                }
            }
            let _ = writer.shutdown().await;
        });

        let server = self.clone();
        tokio::spawn(async move {
            server
                .read_loop(conn_id, reader, outbound_tx.clone(), kill_rx)
                .await;

            let inner = &server.inner;
            let removed = inner.live.remove_connection(conn_id);
            inner.connections.remove(&conn_id);
            inner.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            let _ = outbound_tx.send(Outbound::Close);
            tracing::info!(conn = conn_id, live_queries = removed, "client disconnected");
        });

        conn_id
    }

    async fn read_loop(
        &self,
        conn_id: u64,
        mut reader: Box<dyn FrameReader>,
        outbound: mpsc::UnboundedSender<Outbound>,
        mut kill: watch::Receiver<bool>,
    ) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut session = Session::new(conn_id);

        loop {
            tokio::select! {
                _ = kill.changed() => {
                    tracing::debug!(conn = conn_id, "connection killed");
                    break;
                }
                _ = shutdown.recv() => {
                    tracing::debug!(conn = conn_id, "shutdown signal received");
                    break;
                }
                frame = reader.read_frame() => match frame {
                    Ok(Some(frame)) => {
                        if !self.on_frame(&mut session, &outbound, &frame) {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(conn = conn_id, "connection closed by client");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(conn = conn_id, "read error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    /// Handles one inbound frame. Returns `false` when the connection must close.
    fn on_frame(
        &self,
        session: &mut Session,
        outbound: &mpsc::UnboundedSender<Outbound>,
        frame: &[u8],
    ) -> bool {
        let inner = &self.inner;
        let request = match inner.codec.decode_request(frame) {
            Ok(request) => request,
            Err(e) => {
                inner.stats.malformed_total.fetch_add(1, Ordering::Relaxed);
                if let Some(reply) = reject_malformed(frame, &e.to_string()) {
                    self.send_reply(session.id, outbound, &reply);
                } else {
                    tracing::warn!(conn = session.id, "dropping undecodable frame: {}", e);
                }
                return true;
            }
        };

        inner.stats.requests_total.fetch_add(1, Ordering::Relaxed);
        inner.request_log.lock().push((session.id, request.method));
        tracing::debug!(conn = session.id, id = %request.id, method = %request.method, "request");

        let failure = inner.failures.next(request.method);
        if failure.is_some() {
            inner.stats.failures_injected.fetch_add(1, Ordering::Relaxed);
        }

        match failure {
            Some(Failure::DropConnection) => {
                tracing::debug!(conn = session.id, "injected: drop connection");
                false
            }
            Some(Failure::InvalidResponse) => {
                let _ = outbound.send(Outbound::Frame(Bytes::from_static(INVALID_RESPONSE)));
                true
            }
            Some(Failure::ServerError { code, message }) => {
                let reply = Reply::error(request.id, ReplyError::new(ErrorCode::from(code), message));
                self.send_reply(session.id, outbound, &reply);
                true
            }
            Some(failure) => {
                // The request is applied now so session state keeps arrival
                // order; only the reply is late.
                let reply = inner.handler.handle(session, outbound, request);
                let delay = failure.delay().unwrap_or_default();
                let server = self.clone();
                let outbound = outbound.clone();
                let conn_id = session.id;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    server.send_reply(conn_id, &outbound, &reply);
                });
                true
            }
            None => {
                let reply = inner.handler.handle(session, outbound, request);
                self.send_reply(session.id, outbound, &reply);
                true
            }
        }
    }

    fn send_reply(&self, conn_id: u64, outbound: &mpsc::UnboundedSender<Outbound>, reply: &Reply) {
        match self.inner.codec.encode_reply(reply) {
            Ok(bytes) => {
                if outbound.send(Outbound::Frame(bytes)).is_err() {
                    tracing::debug!(conn = conn_id, id = %reply.id, "connection gone, reply dropped");
                }
            }
            Err(e) => tracing::error!(conn = conn_id, id = %reply.id, "failed to encode reply: {}", e),
        }
    }

    /// Binds the configured address and serves until [`FakeServer::shutdown`].
    pub async fn run(&self) -> Result<(), FakeDbError> {
        let listener = TcpListener::bind(self.inner.config.network.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accepts framed TCP (or TLS, when configured) connections from `listener`.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), FakeDbError> {
        let config = &self.inner.config;
        let acceptor = if config.tls.enabled {
            Some(tls::build_acceptor(&config.tls)?)
        } else {
            None
        };
        let local_addr = listener.local_addr()?;
        tracing::info!(
            "fake server listening on {} ({})",
            local_addr,
            if acceptor.is_some() { "tls" } else { "tcp" }
        );

        self.inner.running.store(true, Ordering::SeqCst);
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if self.connection_count() >= config.network.max_connections {
                            tracing::warn!("connection limit reached, rejecting {}", addr);
                            continue;
                        }
                        let server = self.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.accept_stream(stream, addr, acceptor).await {
                                tracing::warn!("[{}] {}", addr, e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("accept error: {}", e),
                },
                _ = shutdown.recv() => {
                    tracing::info!("fake server shutting down");
                    break;
                }
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn accept_stream(
        &self,
        stream: tokio::net::TcpStream,
        addr: SocketAddr,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<u64, FakeDbError> {
        stream.set_nodelay(true)?;
        let conn_id = match acceptor {
            Some(acceptor) => {
                let stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| FakeDbError::TlsHandshake(e.to_string()))?;
                self.attach(Box::new(StreamTransport::new(
                    stream,
                    "tls",
                    DEFAULT_READ_BUFFER_SIZE,
                )))
            }
            None => self.attach(Box::new(StreamTransport::new(
                stream,
                "tcp",
                DEFAULT_READ_BUFFER_SIZE,
            ))),
        };
        tracing::debug!(conn = conn_id, "accepted {}", addr);
        Ok(conn_id)
    }

    /// Stops the listener and closes every connection.
    pub fn shutdown(&self) {
        self.set_accepting(false);
        let _ = self.inner.shutdown.send(());
        self.drop_connections();
    }

    /// Whether [`FakeServer::serve`] is accepting connections.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

/// Builds the reply for a frame that is not a valid request, when it still
/// carries an id to reply to.
fn reject_malformed(frame: &[u8], reason: &str) -> Option<Reply> {
    let value: Value = serde_json::from_slice(frame).ok()?;
    let id = match value.get("id")? {
        Value::String(id) => id.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let error = match value.get("method").and_then(Value::as_str) {
        Some(method) if method.parse::<Method>().is_err() => {
            ReplyError::new(ErrorCode::MethodNotFound, format!("Method not found: {}", method))
        }
        _ => ReplyError::new(ErrorCode::InvalidRequest, reason),
    };
    Some(Reply::error(id, error))
}

struct MemoryDialer {
    server: FakeServer,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> Result<Box<dyn Transport>, ClientError> {
        if !self.server.inner.accepting.load(Ordering::SeqCst) {
            return Err(ClientError::ConnectionClosed {
                reason: "fake server is not accepting connections".to_string(),
            });
        }
        let (client, server) = MemoryTransport::pair();
        self.server.attach(Box::new(server));
        Ok(Box::new(client))
    }

    fn target(&self) -> String {
        "memory://fakedb".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FailureRule;
    use serde_json::json;
    use std::time::Duration;
    use tether_client::transport::{MemoryFrameReader, MemoryFrameWriter};
    use tether_protocol::{Envelope, Request};

    struct Peer {
        reader: MemoryFrameReader,
        writer: MemoryFrameWriter,
    }

    impl Peer {
        fn connect(server: &FakeServer) -> (u64, Self) {
            let (client, end) = MemoryTransport::pair();
            let conn_id = server.attach(Box::new(end));
            let (reader, writer) = client.into_halves();
            (conn_id, Self { reader, writer })
        }

        fn send(&self, id: &str, method: Method, params: Vec<Value>) {
            let request = Request::new(id, method).with_params(params);
            self.writer
                .send(JsonCodec.encode_request(&request).unwrap())
                .unwrap();
        }

        async fn recv(&mut self) -> Option<Envelope> {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.reader.recv())
                .await
                .expect("timed out waiting for a frame")?;
            Some(JsonCodec.decode_envelope(&frame).unwrap())
        }

        async fn call(&mut self, id: &str, method: Method, params: Vec<Value>) -> Reply {
            self.send(id, method, params);
            self.recv().await.unwrap().into_reply().unwrap()
        }
    }

    #[tokio::test]
    async fn test_round_trip_and_request_log() {
        let server = FakeServer::new(FakeDbConfig::default());
        let (conn_id, mut peer) = Peer::connect(&server);

        let reply = peer.call("a", Method::Ping, vec![]).await;
        assert_eq!(reply.id, "a");
        assert!(!reply.is_error());

        let reply = peer
            .call("b", Method::Use, vec![json!("test"), json!("app")])
            .await;
        assert!(!reply.is_error());

        assert_eq!(
            server.request_log(),
            vec![(conn_id, Method::Ping), (conn_id, Method::Use)]
        );
        assert_eq!(server.connection_count(), 1);
        assert_eq!(server.stats().requests_total.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_unknown_method_and_garbage() {
        let server = FakeServer::new(FakeDbConfig::default());
        let (_, mut peer) = Peer::connect(&server);

        peer.writer
            .send(Bytes::from_static(br#"{"id":"x","method":"explode","params":[]}"#))
            .unwrap();
        let reply = peer.recv().await.unwrap().into_reply().unwrap();
        assert_eq!(reply.id, "x");
        assert_eq!(reply.error.unwrap().code, ErrorCode::MethodNotFound);

        // No id to reply to: dropped, the connection stays usable.
        peer.writer.send(Bytes::from_static(b"garbage")).unwrap();
        let reply = peer.call("y", Method::Ping, vec![]).await;
        assert_eq!(reply.id, "y");
        assert_eq!(server.stats().malformed_total.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_delayed_replies_arrive_out_of_order() {
        let server = FakeServer::new(FakeDbConfig::default());
        server.failures().add(
            FailureRule::on(Method::Version, Failure::Delay { ms: 100 }).times(1),
        );
        let (_, mut peer) = Peer::connect(&server);

        peer.send("slow", Method::Version, vec![]);
        peer.send("fast", Method::Ping, vec![]);

        let first = peer.recv().await.unwrap().into_reply().unwrap();
        let second = peer.recv().await.unwrap().into_reply().unwrap();
        assert_eq!(first.id, "fast");
        assert_eq!(second.id, "slow");
        assert!(second.result.unwrap().as_str().unwrap().starts_with("tether-fakedb-"));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let server = FakeServer::new(FakeDbConfig::default());
        server.failures().add(
            FailureRule::on(
                Method::Select,
                Failure::server_error(ErrorCode::QueryFailed, "injected"),
            )
            .times(1),
        );
        server
            .failures()
            .add(FailureRule::on(Method::Info, Failure::InvalidResponse).times(1));
        let (_, mut peer) = Peer::connect(&server);

        let reply = peer.call("1", Method::Select, vec![json!("person")]).await;
        let error = reply.error.unwrap();
        assert_eq!(error.code, ErrorCode::QueryFailed);
        assert_eq!(error.message, "injected");

        peer.send("2", Method::Info, vec![]);
        let frame = peer.reader.recv().await.unwrap();
        assert_eq!(&frame[..], INVALID_RESPONSE);
        assert_eq!(server.stats().failures_injected.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_injected_drop_connection() {
        let server = FakeServer::new(FakeDbConfig::default());
        server
            .failures()
            .add(FailureRule::on(Method::Ping, Failure::DropConnection).times(1));
        let (_, mut peer) = Peer::connect(&server);

        peer.send("1", Method::Ping, vec![]);
        assert!(peer.recv().await.is_none());
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_drop_connections_cleans_up() {
        let server = FakeServer::new(FakeDbConfig::default());
        let (_, mut peer) = Peer::connect(&server);
        peer.call("1", Method::Use, vec![json!("test"), json!("app")])
            .await;
        peer.call("2", Method::Live, vec![json!("person")]).await;
        assert_eq!(server.live().len(), 1);

        assert_eq!(server.drop_connections(), 1);
        assert!(peer.recv().await.is_none());

        tokio::time::timeout(Duration::from_secs(2), async {
            while server.connection_count() > 0 || !server.live().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_memory_dialer() {
        let server = FakeServer::new(FakeDbConfig::default());
        let dialer = server.dialer();
        assert_eq!(dialer.target(), "memory://fakedb");

        let transport = tokio_test::assert_ok!(dialer.dial().await);
        assert_eq!(transport.kind(), "memory");
        assert_eq!(server.connection_count(), 1);

        server.set_accepting(false);
        assert!(dialer.dial().await.is_err());
    }

    #[tokio::test]
    async fn test_serve_tcp() {
        use tether_client::transport::StreamDialer;
        use tether_client::ConnectionConfig;

        let server = FakeServer::new(FakeDbConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = server.clone();
        let task = tokio::spawn(async move { serving.serve(listener).await });

        let config = ConnectionConfig::parse(&format!("tcp://{}", addr)).unwrap();
        let transport = tokio_test::assert_ok!(StreamDialer::new(&config).dial().await);
        let (mut reader, mut writer) = transport.split();

        let request = Request::new("t1", Method::Ping);
        writer
            .write_frame(JsonCodec.encode_request(&request).unwrap())
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), reader.read_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let reply = JsonCodec.decode_envelope(&frame).unwrap().into_reply().unwrap();
        assert_eq!(reply.id, "t1");

        server.shutdown();
        task.await.unwrap().unwrap();
        assert!(!server.is_running());
    }
}
