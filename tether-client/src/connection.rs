//! RPC multiplexer: many concurrent callers over one transport.
//!
//! A [`Connection`] spawns a write loop that owns the writing half of a
//! transport and a read loop that owns the reading half. Callers register a
//! slot in the [`PendingTable`], queue their encoded request for the write
//! loop and wait on the slot. Only the write loop touches the transport, so a
//! caller that gives up never leaves half a frame behind. The read loop hands
//! each reply to the slot with the matching id and routes everything else
//! shaped like a notification to the [`NotificationRouter`].
//!
//! Per-frame decode failures are logged and counted; the loop keeps going.
//! A read failure or end-of-stream closes the connection: every waiting
//! caller gets [`ClientError::ConnectionClosed`] and every live stream ends
//! with [`CloseReason::ConnectionLost`].

use crate::error::ClientError;
use crate::id::{IdGenerator, RandomIdGenerator};
use crate::pending::{Delivered, PendingTable, SlotGuard};
use crate::router::{CloseReason, Dispatch, LiveStream, NotificationRouter};
use crate::transport::{FrameReader, FrameWriter, Transport};
use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::{Codec, JsonCodec, Method, Request};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Encoded requests waiting for the write loop.
const OUTBOUND_QUEUE: usize = 1024;

/// Bound on closing the writing half once the connection is closed.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Closed by this client.
    Local,
    /// The peer closed the transport or reading from it failed.
    ReadFailed(String),
    /// Writing a request failed.
    WriteFailed(String),
}

impl CloseCause {
    pub fn is_local(&self) -> bool {
        matches!(self, CloseCause::Local)
    }

    fn to_error(&self) -> ClientError {
        ClientError::ConnectionClosed {
            reason: self.to_string(),
        }
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCause::Local => write!(f, "closed by client"),
            CloseCause::ReadFailed(reason) => write!(f, "read failed: {}", reason),
            CloseCause::WriteFailed(reason) => write!(f, "write failed: {}", reason),
        }
    }
}

/// Collaborators injected into every connection.
#[derive(Clone)]
pub struct ConnectionOptions {
    pub codec: Arc<dyn Codec>,
    pub ids: Arc<dyn IdGenerator>,
    /// Deadline applied by [`Connection::send`].
    pub request_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            codec: Arc::new(JsonCodec),
            ids: Arc::new(RandomIdGenerator::new()),
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ConnectionOptions {
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Frame and anomaly counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub replies_delivered: u64,
    pub notifications_routed: u64,
    /// Frames the codec could not decode.
    pub decode_errors: u64,
    /// Replies for ids with no waiting caller, e.g. after a timeout.
    pub unmatched_replies: u64,
    /// Notifications for unknown live queries, or frames of no known shape.
    pub dropped_notifications: u64,
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    replies_delivered: AtomicU64,
    notifications_routed: AtomicU64,
    decode_errors: AtomicU64,
    unmatched_replies: AtomicU64,
    dropped_notifications: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            replies_delivered: self.replies_delivered.load(Ordering::Relaxed),
            notifications_routed: self.notifications_routed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            unmatched_replies: self.unmatched_replies.load(Ordering::Relaxed),
            dropped_notifications: self.dropped_notifications.load(Ordering::Relaxed),
        }
    }
}

/// State shared between callers and the read loop.
struct Shared {
    codec: Arc<dyn Codec>,
    pending: PendingTable,
    router: NotificationRouter,
    counters: Counters,
    closed: watch::Sender<Option<CloseCause>>,
}

impl Shared {
    fn close_cause(&self) -> Option<CloseCause> {
        self.closed.borrow().clone()
    }

    /// Marks the connection closed. Only the first call has any effect.
    fn shutdown(&self, cause: CloseCause) -> bool {
        let mut first = false;
        self.closed.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(cause.clone());
                first = true;
            }
            first
        });
        if !first {
            return false;
        }

        let failed = self.pending.fail_all(&cause.to_string());
        let reason = if cause.is_local() {
            CloseReason::ClientClosed
        } else {
            CloseReason::ConnectionLost
        };
        let streams = self.router.close_all(reason);

        if cause.is_local() {
            tracing::debug!(
                "Connection closed ({} pending failed, {} live streams ended)",
                failed,
                streams
            );
        } else {
            tracing::warn!(
                "Connection lost: {} ({} pending failed, {} live streams ended)",
                cause,
                failed,
                streams
            );
        }
        true
    }

    /// Demultiplexes one inbound frame.
    fn dispatch(&self, frame: &[u8]) {
        Counters::bump(&self.counters.frames_received);

        let envelope = match self.codec.decode_envelope(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                Counters::bump(&self.counters.decode_errors);
                tracing::warn!("read_loop: dropping undecodable frame: {}", e);
                return;
            }
        };

        // A reply is recognised by an id that matches an outstanding request.
        if let Some(id) = envelope.id.as_deref() {
            if let Some((method, tx)) = self.pending.take(id) {
                let id = id.to_string();
                let reply = match envelope.into_reply() {
                    Ok(reply) => reply,
                    Err(e) => {
                        let _ = tx.send(Err(ClientError::Decode(e)));
                        return;
                    }
                };

                let live = match (method, reply.error.is_none(), &reply.result) {
                    (Method::Live, true, Some(Value::String(live_id))) => {
                        Some(self.router.register(live_id))
                    }
                    (Method::Live, true, _) => Some(Err(ClientError::Decode(
                        tether_protocol::ProtocolError::InvalidField {
                            field: "result",
                            reason: "live reply must be a live query id".to_string(),
                        },
                    ))),
                    _ => None,
                };

                tracing::debug!("read_loop: dispatching reply id={}", id);
                Counters::bump(&self.counters.replies_delivered);
                if let Err(Ok(delivered)) = tx.send(Ok(Delivered { reply, live })) {
                    // The caller gave up between take() and send().
                    if let Some(Ok(stream)) = delivered.live {
                        self.router.unregister(stream.id());
                    }
                }
                return;
            }
        }

        if envelope.is_notification() {
            match envelope.into_notification() {
                Ok(notification) => {
                    let id = notification.subscription_id.clone();
                    match self.router.dispatch(notification) {
                        Dispatch::Delivered => {
                            Counters::bump(&self.counters.notifications_routed);
                        }
                        Dispatch::Unrouted | Dispatch::ConsumerGone => {
                            Counters::bump(&self.counters.dropped_notifications);
                            tracing::debug!("read_loop: no live query {}, dropping", id);
                        }
                    }
                }
                Err(e) => {
                    Counters::bump(&self.counters.decode_errors);
                    tracing::warn!("read_loop: malformed notification: {}", e);
                }
            }
            return;
        }

        match envelope.id {
            Some(id) => {
                Counters::bump(&self.counters.unmatched_replies);
                tracing::debug!("read_loop: no pending request for id={}", id);
            }
            None => {
                Counters::bump(&self.counters.dropped_notifications);
                tracing::warn!("read_loop: dropping frame with neither request id nor action");
            }
        }
    }
}

/// A multiplexed connection.
pub struct Connection {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Bytes>,
    ids: Arc<dyn IdGenerator>,
    request_timeout: Option<Duration>,
    kind: &'static str,
    read_task: JoinHandle<()>,
    write_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Takes ownership of `transport` and starts its read loop.
    pub fn open(transport: Box<dyn Transport>, options: ConnectionOptions) -> Arc<Self> {
        let kind = transport.kind();
        let (reader, writer) = transport.split();
        let (closed, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            codec: options.codec,
            pending: PendingTable::new(),
            router: NotificationRouter::new(),
            counters: Counters::default(),
            closed,
        });

        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        let read_task = tokio::spawn(read_loop(shared.clone(), reader));
        let write_task = tokio::spawn(write_loop(shared.clone(), writer, queue));
        tracing::debug!("Opened {} connection", kind);

        Arc::new(Self {
            shared,
            outbound,
            ids: options.ids,
            request_timeout: options.request_timeout,
            kind,
            read_task,
            write_task: parking_lot::Mutex::new(Some(write_task)),
        })
    }

    /// Sends a request and waits for its result, bounded by the default timeout.
    pub async fn send(&self, method: Method, params: Vec<Value>) -> Result<Value, ClientError> {
        self.send_with_timeout(method, params, self.request_timeout)
            .await
    }

    /// Sends a request and waits for its result. `None` waits until the
    /// connection closes.
    pub async fn send_with_timeout(
        &self,
        method: Method,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let delivered = self.call(method, params, timeout).await?;
        reply_value(method, delivered)
    }

    /// Starts a live query: sends `live` and returns the stream registered for
    /// the id in the reply.
    pub async fn live(
        &self,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<LiveStream, ClientError> {
        let delivered = self.call(Method::Live, params, timeout).await?;
        live_stream(delivered)
    }

    /// Sends one request and waits for its reply. `timeout` bounds the whole
    /// exchange: queueing, writing and waiting.
    pub(crate) async fn call(
        &self,
        method: Method,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Delivered, ClientError> {
        let started = Instant::now();
        if let Some(cause) = self.shared.close_cause() {
            return Err(cause.to_error());
        }

        let id = self.ids.next_id();
        let registration = self.shared.pending.register(&id, method)?;
        let mut guard = SlotGuard::new(&self.shared.pending, &id, registration.generation);

        // Checked after registering so a concurrent shutdown either sees this
        // slot in fail_all or is seen here.
        if let Some(cause) = self.shared.close_cause() {
            return Err(cause.to_error());
        }

        let request = Request::new(id.as_str(), method).with_params(params);
        let frame = self
            .shared
            .codec
            .encode_request(&request)
            .map_err(ClientError::Encode)?;

        tracing::debug!("Sending request id={} method={}", id, method);
        let exchange = async {
            self.outbound
                .send(frame)
                .await
                .map_err(|_| self.closed_error())?;
            registration.rx.await.map_err(|_| ClientError::ConnectionClosed {
                reason: "reply slot dropped".to_string(),
            })
        };

        let delivery = match timeout {
            Some(duration) => tokio::time::timeout_at(started + duration, exchange)
                .await
                .map_err(|_| {
                    tracing::debug!("Request id={} timed out after {:?}", id, duration);
                    ClientError::Timeout(duration)
                })??,
            None => exchange.await?,
        };
        guard.disarm();
        delivery
    }

    fn closed_error(&self) -> ClientError {
        self.shared
            .close_cause()
            .map(|cause| cause.to_error())
            .unwrap_or(ClientError::NotConnected)
    }

    /// Resolves once the connection has closed, with the cause.
    pub async fn closed(&self) -> CloseCause {
        let mut rx = self.shared.closed.subscribe();
        let cause = match rx.wait_for(|state| state.is_some()).await {
            Ok(state) => (*state).clone().unwrap_or(CloseCause::Local),
            Err(_) => CloseCause::Local,
        };
        cause
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.borrow().is_some()
    }

    pub fn close_cause(&self) -> Option<CloseCause> {
        self.shared.close_cause()
    }

    /// Closes the connection. Waiting callers fail with `ConnectionClosed`.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing {} connection...", self.kind);
        self.shared.shutdown(CloseCause::Local);

        let write_task = self.write_task.lock().take();
        if let Some(write_task) = write_task {
            if let Err(e) = write_task.await {
                tracing::debug!("write_loop ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    /// Registers a stream for a live query started by other means, e.g. a
    /// `LIVE SELECT` statement sent through `query`.
    pub fn subscribe(&self, live_id: &str) -> Result<LiveStream, ClientError> {
        if let Some(cause) = self.shared.close_cause() {
            return Err(cause.to_error());
        }
        self.shared.router.register(live_id)
    }

    /// Closes the stream of `live_id` locally. Unknown ids are a no-op.
    pub fn unsubscribe(&self, live_id: &str) -> bool {
        self.shared.router.unregister(live_id)
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Returns the number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn live_count(&self) -> usize {
        self.shared.router.len()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.counters.snapshot()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.read_task.abort();
        self.shared.shutdown(CloseCause::Local);
    }
}

pub(crate) fn reply_value(method: Method, delivered: Delivered) -> Result<Value, ClientError> {
    delivered
        .reply
        .into_result()
        .map_err(|error| ClientError::Server {
            method,
            code: error.code,
            message: error.message,
        })
}

pub(crate) fn live_stream(delivered: Delivered) -> Result<LiveStream, ClientError> {
    if let Some(error) = delivered.reply.error {
        return Err(ClientError::Server {
            method: Method::Live,
            code: error.code,
            message: error.message,
        });
    }
    delivered.live.unwrap_or_else(|| {
        Err(ClientError::Decode(tether_protocol::ProtocolError::MissingField("result")))
    })
}

/// Writes queued frames one at a time until the connection closes.
///
/// A write still in progress when the connection closes is abandoned; the
/// transport is discarded with it.
async fn write_loop(
    shared: Arc<Shared>,
    mut writer: Box<dyn FrameWriter>,
    mut queue: mpsc::Receiver<Bytes>,
) {
    tracing::debug!("write_loop started");
    let mut closed = shared.closed.subscribe();

    loop {
        let frame = tokio::select! {
            _ = closed.wait_for(|state| state.is_some()) => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = closed.wait_for(|state| state.is_some()) => break,
            written = writer.write_frame(frame) => written,
        };

        match written {
            Ok(()) => Counters::bump(&shared.counters.frames_sent),
            Err(e) => {
                shared.shutdown(CloseCause::WriteFailed(e.to_string()));
                return;
            }
        }
    }

    match tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => tracing::debug!("write_loop stopped"),
        Ok(Err(e)) => tracing::debug!("Writer shutdown failed: {}", e),
        Err(_) => tracing::debug!("Writer shutdown timed out"),
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: Box<dyn FrameReader>) {
    tracing::debug!("read_loop started");
    let mut closed = shared.closed.subscribe();

    loop {
        let frame = tokio::select! {
            _ = closed.wait_for(|state| state.is_some()) => {
                tracing::debug!("read_loop: connection closed, stopping");
                return;
            }
            frame = reader.read_frame() => frame,
        };

        match frame {
            Ok(Some(frame)) => shared.dispatch(&frame),
            Ok(None) => {
                shared.shutdown(CloseCause::ReadFailed("connection closed by peer".to_string()));
                return;
            }
            Err(e) => {
                shared.shutdown(CloseCause::ReadFailed(e.to_string()));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SequentialIdGenerator;
    use crate::transport::{MemoryFrameReader, MemoryFrameWriter, MemoryTransport, StreamTransport};
    use async_trait::async_trait;
    use serde_json::json;
    use tether_protocol::{Action, ErrorCode, Notification, Reply, ReplyError};

    /// The server side of a memory transport, driven by hand.
    struct Peer {
        reader: MemoryFrameReader,
        writer: MemoryFrameWriter,
    }

    impl Peer {
        async fn recv(&mut self) -> Request {
            let frame = self.reader.recv().await.expect("client hung up");
            JsonCodec.decode_request(&frame).unwrap()
        }

        fn reply(&self, reply: Reply) {
            self.writer
                .send(JsonCodec.encode_reply(&reply).unwrap())
                .unwrap();
        }

        fn notify(&self, notification: Notification) {
            self.writer
                .send(JsonCodec.encode_notification(&notification).unwrap())
                .unwrap();
        }

        fn raw(&self, bytes: &'static [u8]) {
            self.writer.send(Bytes::from_static(bytes)).unwrap();
        }
    }

    fn open(options: ConnectionOptions) -> (Arc<Connection>, Peer) {
        let (client, server) = MemoryTransport::pair();
        let (reader, writer) = server.into_halves();
        (
            Connection::open(Box::new(client), options),
            Peer { reader, writer },
        )
    }

    fn options() -> ConnectionOptions {
        ConnectionOptions::default().with_request_timeout(Some(Duration::from_secs(5)))
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_send_receives_result() {
        let (conn, mut peer) = open(options());

        let server = tokio::spawn(async move {
            let request = peer.recv().await;
            assert_eq!(request.method, Method::Select);
            assert_eq!(request.params, vec![json!("person:1")]);
            peer.reply(Reply::ok(request.id, json!({"id": "person:1"})));
            peer
        });

        let result = conn
            .send(Method::Select, vec![json!("person:1")])
            .await
            .unwrap();
        assert_eq!(result["id"], "person:1");
        assert_eq!(conn.pending_count(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_reply() {
        let (conn, mut peer) = open(options());

        tokio::spawn(async move {
            let request = peer.recv().await;
            peer.reply(Reply::error(
                request.id,
                ReplyError::new(ErrorCode::MethodNotFound, "Method not found"),
            ));
            peer
        });

        let err = conn.send(Method::Info, vec![]).await.unwrap_err();
        match err {
            ClientError::Server {
                method,
                code,
                message,
            } => {
                assert_eq!(method, Method::Info);
                assert_eq!(code, ErrorCode::MethodNotFound);
                assert_eq!(message, "Method not found");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_replies_reach_their_callers() {
        let (conn, mut peer) = open(options());
        const N: usize = 50;

        // Answer in reverse arrival order.
        let server = tokio::spawn(async move {
            let mut requests = Vec::with_capacity(N);
            for _ in 0..N {
                requests.push(peer.recv().await);
            }
            for request in requests.into_iter().rev() {
                let echo = request.params[0].clone();
                peer.reply(Reply::ok(request.id, echo));
            }
            peer
        });

        let mut callers = Vec::new();
        for n in 0..N {
            let conn = conn.clone();
            callers.push(tokio::spawn(async move {
                let result = conn.send(Method::Select, vec![json!(n)]).await.unwrap();
                (n, result)
            }));
        }

        for caller in callers {
            let (n, result) = caller.await.unwrap();
            assert_eq!(result, json!(n));
        }
        assert_eq!(conn.pending_count(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_removes_slot_and_late_reply_is_dropped() {
        let (conn, mut peer) = open(options());

        let err = {
            let send = conn.send_with_timeout(
                Method::Ping,
                vec![],
                Some(Duration::from_millis(20)),
            );
            send.await.unwrap_err()
        };
        assert!(matches!(err, ClientError::Timeout(_)));
        assert!(err.is_retryable());
        assert_eq!(conn.pending_count(), 0);

        let late = peer.recv().await;
        peer.reply(Reply::ok(late.id, json!("pong")));
        wait_until(|| conn.stats().unmatched_replies == 1).await;

        // The connection is still usable.
        let next = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Method::Ping, vec![]).await }
        });
        let request = peer.recv().await;
        peer.reply(Reply::ok(request.id, Value::Null));
        assert_eq!(next.await.unwrap().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_cancelled_wait_removes_slot() {
        let (conn, mut peer) = open(options());

        let caller = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Method::Select, vec![json!("t:1")]).await }
        });
        let request = peer.recv().await;
        assert_eq!(conn.pending_count(), 1);

        caller.abort();
        let _ = caller.await;
        assert_eq!(conn.pending_count(), 0);

        peer.reply(Reply::ok(request.id, json!({})));
        wait_until(|| conn.stats().unmatched_replies == 1).await;
    }

    #[tokio::test]
    async fn test_id_collision_is_retryable_error() {
        struct FixedIds;
        impl IdGenerator for FixedIds {
            fn next_id(&self) -> String {
                "same".to_string()
            }
        }

        let (conn, mut peer) = open(options().with_ids(Arc::new(FixedIds)));
        let first = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Method::Ping, vec![]).await }
        });
        let request = peer.recv().await;

        let err = conn.send(Method::Ping, vec![]).await.unwrap_err();
        assert!(matches!(err, ClientError::IdCollision(_)));
        assert!(err.is_retryable());

        // The first caller's slot is untouched by the failed attempt.
        peer.reply(Reply::ok(request.id, json!("pong")));
        assert_eq!(first.await.unwrap().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_decode_error_does_not_kill_loop() {
        let (conn, mut peer) = open(options().with_ids(Arc::new(SequentialIdGenerator::new("r"))));

        let caller = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Method::Version, vec![]).await }
        });
        let request = peer.recv().await;

        peer.raw(b"this is not json");
        peer.raw(br#"{"id": 12}"#);
        peer.reply(Reply::ok(request.id, json!("1.0.0")));

        assert_eq!(caller.await.unwrap().unwrap(), json!("1.0.0"));
        let stats = conn.stats();
        assert_eq!(stats.decode_errors, 2);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_and_ends_streams() {
        let (conn, mut peer) = open(options());

        let caller = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Method::Select, vec![json!("t")]).await }
        });
        peer.recv().await;
        let mut stream = conn.subscribe("lq").unwrap();

        drop(peer);

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed { .. }));
        assert!(err.is_retryable());
        assert!(stream.next().await.is_none());
        assert_eq!(stream.close_reason(), Some(CloseReason::ConnectionLost));

        assert!(matches!(conn.closed().await, CloseCause::ReadFailed(_)));
        assert!(matches!(
            conn.send(Method::Ping, vec![]).await,
            Err(ClientError::ConnectionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_timeout_still_released_on_close() {
        let (conn, mut peer) = open(options());

        let caller = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_with_timeout(Method::Ping, vec![], None).await }
        });
        peer.recv().await;
        conn.close().await.unwrap();

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed { .. }));
        assert_eq!(conn.closed().await, CloseCause::Local);
    }

    #[tokio::test]
    async fn test_live_reply_registers_before_next_frame() {
        let (conn, mut peer) = open(options());

        let server = tokio::spawn(async move {
            let request = peer.recv().await;
            assert_eq!(request.method, Method::Live);
            // Reply and first notification back to back.
            peer.reply(Reply::ok(request.id, json!("lq-1")));
            peer.notify(Notification::new("lq-1", Action::Create, json!({"id": "t:1"})));
            peer
        });

        let mut stream = conn.live(vec![json!("t")], None).await.unwrap();
        assert_eq!(stream.id(), "lq-1");
        let first = stream.next().await.unwrap();
        assert_eq!(first.action, Action::Create);
        assert_eq!(first.result["id"], "t:1");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_notifications_isolated_per_live_query() {
        let (conn, peer) = open(options());
        let mut a = conn.subscribe("a").unwrap();
        let mut b = conn.subscribe("b").unwrap();

        for n in 0..5 {
            peer.notify(Notification::new("a", Action::Update, json!(n)));
            peer.notify(Notification::new("b", Action::Update, json!(n * 10)));
        }
        peer.notify(Notification::new("zombie", Action::Delete, json!(null)));

        for n in 0..5 {
            assert_eq!(a.next().await.unwrap().result, json!(n));
            assert_eq!(b.next().await.unwrap().result, json!(n * 10));
        }

        assert!(conn.unsubscribe("a"));
        assert!(a.next().await.is_none());

        peer.notify(Notification::new("b", Action::Update, json!(99)));
        assert_eq!(b.next().await.unwrap().result, json!(99));
        wait_until(|| conn.stats().dropped_notifications == 1).await;
    }

    #[tokio::test]
    async fn test_flat_notification_shape() {
        let (conn, peer) = open(options());
        let mut stream = conn.subscribe("q").unwrap();
        peer.raw(br#"{"id":"q","action":"DELETE","result":{"id":"t:9"}}"#);

        let n = stream.next().await.unwrap();
        assert_eq!(n.action, Action::Delete);
    }

    #[tokio::test]
    async fn test_write_failure_closes_connection() {
        let (client, server) = MemoryTransport::pair();
        let conn = Connection::open(Box::new(client), options());
        drop(server);

        let err = conn.send(Method::Ping, vec![]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(conn.is_closed());
    }

    /// Connection over a small in-memory byte pipe with frame encoding, so
    /// large writes block until the peer reads.
    fn open_duplex(
        options: ConnectionOptions,
    ) -> (Arc<Connection>, Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (client, server) = tokio::io::duplex(64);
        let conn = Connection::open(
            Box::new(StreamTransport::new(client, "duplex", 1024)),
            options,
        );
        let (reader, writer) = Box::new(StreamTransport::new(server, "duplex", 1024)).split();
        (conn, reader, writer)
    }

    #[tokio::test]
    async fn test_abandoned_send_leaves_whole_frames_on_stream() {
        let (conn, mut peer_reader, mut peer_writer) = open_duplex(options());
        let big = "x".repeat(10 * 1024);

        // The caller is dropped while its frame is still being written.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            conn.send(Method::Query, vec![json!(big)]),
        )
        .await;
        assert!(abandoned.is_err());

        let ping = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Method::Ping, vec![]).await }
        });

        let first = peer_reader.read_frame().await.unwrap().unwrap();
        let first = JsonCodec.decode_request(&first).unwrap();
        assert_eq!(first.method, Method::Query);
        assert_eq!(first.params, vec![json!(big)]);

        let second = peer_reader.read_frame().await.unwrap().unwrap();
        let second = JsonCodec.decode_request(&second).unwrap();
        assert_eq!(second.method, Method::Ping);

        let reply = JsonCodec
            .encode_reply(&Reply::ok(second.id, json!("pong")))
            .unwrap();
        peer_writer.write_frame(reply).await.unwrap();

        assert_eq!(ping.await.unwrap().unwrap(), json!("pong"));
        assert_eq!(conn.pending_count(), 0);
        assert!(!conn.is_closed());
    }

    struct StalledWriter;

    #[async_trait]
    impl FrameWriter for StalledWriter {
        async fn write_frame(&mut self, _frame: Bytes) -> Result<(), ClientError> {
            std::future::pending().await
        }

        async fn shutdown(&mut self) -> Result<(), ClientError> {
            Ok(())
        }
    }

    /// Reads normally, never finishes a write.
    struct StalledTransport {
        reader: MemoryFrameReader,
    }

    impl Transport for StalledTransport {
        fn kind(&self) -> &'static str {
            "stalled"
        }

        fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
            (Box::new(self.reader), Box::new(StalledWriter))
        }
    }

    #[tokio::test]
    async fn test_timeout_covers_stalled_write() {
        let (client, _server) = MemoryTransport::pair();
        let (reader, _writer) = client.into_halves();
        let conn = Connection::open(Box::new(StalledTransport { reader }), options());

        let deadline = Some(Duration::from_millis(50));
        let outcome = tokio::time::timeout(Duration::from_secs(1), async {
            tokio::join!(
                conn.send_with_timeout(Method::Ping, vec![], deadline),
                conn.send_with_timeout(Method::Version, vec![], deadline),
            )
        })
        .await;
        let (first, second) = outcome.expect("send outlived its timeout");

        assert!(matches!(first, Err(ClientError::Timeout(_))));
        assert!(matches!(second, Err(ClientError::Timeout(_))));
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(conn.stats().frames_sent, 0);

        // Closing abandons the stuck write.
        tokio::time::timeout(Duration::from_secs(1), conn.close())
            .await
            .expect("close hung on the stalled writer")
            .unwrap();
        assert_eq!(conn.close_cause(), Some(CloseCause::Local));
    }
}
