//! Connection lifecycle: dialing, session replay and automatic reconnection.
//!
//! The [`Reconnector`] owns the current [`Connection`] and a supervisor task
//! that watches it. When the connection dies the supervisor dials a new one
//! with exponential backoff, replays the [`SessionState`] on it, and only then
//! moves back to [`ConnectionState::Connected`]. Callers that arrive while it
//! is reconnecting wait (or fail fast), and never see a connection whose
//! session has not been restored.

use crate::config::ReconnectConfig;
use crate::connection::{live_stream, reply_value, Connection, ConnectionOptions};
use crate::error::ClientError;
use crate::pending::Delivered;
use crate::router::LiveStream;
use crate::session::SessionState;
use crate::transport::Dialer;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::Method;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Lifecycle of a [`Reconnector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Disconnected, Closing)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Closing)
                | (Connected, Connecting)
                | (Connected, Disconnected)
                | (Connected, Closing)
                | (Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-request overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Overrides the default request timeout. Covers waiting for a
    /// reconnect as well as waiting for the reply.
    pub timeout: Option<Duration>,
    /// Fail with `NotConnected` instead of waiting while reconnecting.
    pub fail_fast: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }
}

/// Exponential backoff schedule with random jitter.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    policy: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(policy: &ReconnectConfig) -> Self {
        Self {
            policy: policy.clone(),
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let factor = self.policy.multiplier.powi(self.attempt.min(32) as i32);
        let mut delay = (self.policy.initial_backoff.as_secs_f64() * factor)
            .min(self.policy.max_backoff.as_secs_f64());
        if self.policy.jitter > 0.0 {
            let spread = self.policy.jitter.min(1.0);
            delay *= 1.0 + rand::rng().random_range(-spread..=spread);
        }
        self.attempt += 1;
        Some(Duration::from_secs_f64(delay.max(0.0)))
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempt
    }
}

struct Inner {
    dialer: Arc<dyn Dialer>,
    options: ConnectionOptions,
    policy: ReconnectConfig,
    session: Mutex<SessionState>,
    current: RwLock<Option<Arc<Connection>>>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                tracing::info!("Connection state {} -> {}", state, next);
                *state = next;
                applied = true;
            } else if *state != next {
                tracing::debug!("Ignoring state transition {} -> {}", state, next);
            }
            applied
        });
        applied
    }

    /// Dials, opens a connection and replays the session on it.
    async fn establish(&self) -> Result<Arc<Connection>, ClientError> {
        tracing::debug!("Dialing {}...", self.dialer.target());
        let transport = self.dialer.dial().await?;
        let conn = Connection::open(transport, self.options.clone());

        let plan = self.session.lock().replay_plan();
        for (method, params) in plan {
            tracing::debug!("Replaying {} on new connection", method);
            if let Err(e) = conn.send(method, params).await {
                tracing::warn!("Session replay failed on {}: {}", method, e);
                let _ = conn.close().await;
                return Err(e);
            }
        }

        Ok(conn)
    }

    fn install(&self, conn: Arc<Connection>) -> bool {
        *self.current.write() = Some(conn.clone());
        if self.set_state(ConnectionState::Connected) {
            true
        } else {
            self.current.write().take();
            false
        }
    }
}

/// Shared, reconnecting handle to one server.
#[derive(Clone)]
pub struct Reconnector {
    inner: Arc<Inner>,
}

impl Reconnector {
    pub fn new(dialer: Arc<dyn Dialer>, options: ConnectionOptions, policy: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                dialer,
                options,
                policy,
                session: Mutex::new(SessionState::new()),
                current: RwLock::new(None),
                state,
                shutdown,
                supervisor: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Seeds the session replayed on every connection, including the first.
    pub fn with_session(self, session: SessionState) -> Self {
        *self.inner.session.lock() = session;
        self
    }

    /// Opens the first connection. Failures surface to the caller; automatic
    /// reconnection only starts once a connection has been established.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let guard = self.inner.connect_lock.lock().await;

        match self.inner.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Connecting => {
                drop(guard);
                return self
                    .current_connection(false, None, None)
                    .await
                    .map(|_| ());
            }
            ConnectionState::Closing | ConnectionState::Closed => return Err(ClientError::Closed),
            ConnectionState::Disconnected => {}
        }

        self.inner.set_state(ConnectionState::Connecting);
        let conn = match self.inner.establish().await {
            Ok(conn) => conn,
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        if !self.inner.install(conn.clone()) {
            let _ = conn.close().await;
            return Err(ClientError::Closed);
        }
        tracing::info!("Connected to {}", self.inner.dialer.target());

        let supervisor = tokio::spawn(supervise(self.inner.clone(), conn));
        if let Some(previous) = self.inner.supervisor.lock().replace(supervisor) {
            previous.abort();
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Waits for the next state change and returns the new state.
    pub async fn state_changed(&self) -> ConnectionState {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.changed().await;
        let state = *rx.borrow();
        state
    }

    pub fn session(&self) -> SessionState {
        self.inner.session.lock().clone()
    }

    /// The live connection, if connected.
    pub fn current(&self) -> Option<Arc<Connection>> {
        self.inner.current.read().clone()
    }

    pub async fn send(&self, method: Method, params: Vec<Value>) -> Result<Value, ClientError> {
        self.send_with(method, params, RequestOptions::default())
            .await
    }

    pub async fn send_with(
        &self,
        method: Method,
        params: Vec<Value>,
        options: RequestOptions,
    ) -> Result<Value, ClientError> {
        let delivered = self.call(method, params, options).await?;
        reply_value(method, delivered)
    }

    /// Starts a live query on the current connection.
    pub async fn live(
        &self,
        params: Vec<Value>,
        options: RequestOptions,
    ) -> Result<LiveStream, ClientError> {
        let delivered = self.call(Method::Live, params, options).await?;
        live_stream(delivered)
    }

    /// Registers a stream for a live query id obtained by other means.
    pub async fn subscribe(&self, live_id: &str) -> Result<LiveStream, ClientError> {
        let timeout = self.inner.options.request_timeout;
        let deadline = timeout.map(|t| Instant::now() + t);
        let conn = self.current_connection(false, timeout, deadline).await?;
        conn.subscribe(live_id)
    }

    /// Closes the local stream of `live_id`, if any.
    pub fn unsubscribe(&self, live_id: &str) -> bool {
        self.current()
            .map(|conn| conn.unsubscribe(live_id))
            .unwrap_or(false)
    }

    pub(crate) async fn call(
        &self,
        method: Method,
        params: Vec<Value>,
        options: RequestOptions,
    ) -> Result<Delivered, ClientError> {
        let timeout = options.timeout.or(self.inner.options.request_timeout);
        let deadline = timeout.map(|t| Instant::now() + t);
        let conn = self
            .current_connection(options.fail_fast, timeout, deadline)
            .await?;

        let remaining = remaining_budget(deadline, timeout)?;
        let observed = method.affects_session().then(|| params.clone());

        let delivered = conn.call(method, params, remaining).await?;

        if let Some(params) = observed {
            if delivered.reply.error.is_none() {
                let result = delivered.reply.result.clone().unwrap_or(Value::Null);
                self.inner.session.lock().observe(method, &params, &result);
            }
        }
        Ok(delivered)
    }

    /// Returns a usable connection, waiting out a reconnect unless `fail_fast`.
    async fn current_connection(
        &self,
        fail_fast: bool,
        timeout: Option<Duration>,
        deadline: Option<Instant>,
    ) -> Result<Arc<Connection>, ClientError> {
        let mut state_rx = self.inner.state.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                ConnectionState::Connected => {
                    if let Some(conn) = self.current() {
                        if !conn.is_closed() {
                            return Ok(conn);
                        }
                    }
                    // Dead but not yet noticed by the supervisor.
                }
                ConnectionState::Connecting => {}
                ConnectionState::Disconnected => return Err(ClientError::NotConnected),
                ConnectionState::Closing | ConnectionState::Closed => {
                    return Err(ClientError::Closed)
                }
            }

            if fail_fast {
                return Err(ClientError::NotConnected);
            }

            let changed = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, state_rx.changed())
                    .await
                    .map_err(|_| ClientError::Timeout(timeout.unwrap_or_default()))?,
                None => state_rx.changed().await,
            };
            if changed.is_err() {
                return Err(ClientError::Closed);
            }
        }
    }

    /// Closes the current connection and stops reconnecting. Further calls
    /// fail with [`ClientError::Closed`].
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.inner.state().is_terminal() {
            return Ok(());
        }
        self.inner.set_state(ConnectionState::Closing);
        self.inner.shutdown.send_replace(true);

        let supervisor = self.inner.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        let conn = self.inner.current.write().take();
        if let Some(conn) = conn {
            conn.close().await?;
        }

        self.inner.set_state(ConnectionState::Closed);
        tracing::info!("Closed connection to {}", self.inner.dialer.target());
        Ok(())
    }
}

/// Time left before `deadline`. A spent budget fails before anything is sent.
fn remaining_budget(
    deadline: Option<Instant>,
    timeout: Option<Duration>,
) -> Result<Option<Duration>, ClientError> {
    let Some(deadline) = deadline else {
        return Ok(None);
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(ClientError::Timeout(timeout.unwrap_or_default()));
    }
    Ok(Some(remaining))
}

async fn supervise(inner: Arc<Inner>, mut conn: Arc<Connection>) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        let cause = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return,
            cause = conn.closed() => cause,
        };
        if cause.is_local() {
            return;
        }

        if !inner.policy.enabled {
            inner.current.write().take();
            inner.set_state(ConnectionState::Disconnected);
            tracing::warn!("Connection lost ({}), reconnect disabled", cause);
            return;
        }

        if !inner.set_state(ConnectionState::Connecting) {
            return;
        }
        inner.current.write().take();
        tracing::warn!("Connection lost ({}), reconnecting...", cause);

        match reconnect(&inner, &mut shutdown).await {
            Some(next) => {
                if !inner.install(next.clone()) {
                    let _ = next.close().await;
                    return;
                }
                tracing::info!("Reconnected to {}", inner.dialer.target());
                conn = next;
            }
            None => {
                inner.set_state(ConnectionState::Disconnected);
                return;
            }
        }
    }
}

async fn reconnect(
    inner: &Inner,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Arc<Connection>> {
    let mut backoff = Backoff::new(&inner.policy);

    loop {
        let Some(delay) = backoff.next_delay() else {
            tracing::error!(
                "Giving up on {} after {} reconnect attempts",
                inner.dialer.target(),
                backoff.attempts()
            );
            return None;
        };

        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        let attempt = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return None,
            attempt = inner.establish() => attempt,
        };

        match attempt {
            Ok(conn) => return Some(conn),
            Err(e) => tracing::warn!(
                "Reconnect attempt {} to {} failed: {}",
                backoff.attempts(),
                inner.dialer.target(),
                e
            ),
        }
    }
}
