//! Client configuration: endpoint, timeouts, TLS and reconnect policy.

use crate::error::ClientError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tether_protocol::DEFAULT_PORT;
use url::{Host, Url};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Path appended to WebSocket endpoints that do not name one.
pub const DEFAULT_RPC_PATH: &str = "/rpc";

/// Transport selected by the endpoint URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Framed JSON over plain TCP.
    Tcp,
    /// Framed JSON over TLS.
    Tls,
    Ws,
    Wss,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Tls => "tls",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Scheme::Ws | Scheme::Wss)
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Tls | Scheme::Wss)
    }
}

/// Parsed server endpoint, e.g. `ws://localhost:8000/rpc` or `tcp://10.0.0.5:8000`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Request path, only meaningful for WebSocket schemes.
    pub path: String,
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self, ClientError> {
        let invalid = |reason: &str| ClientError::InvalidEndpoint(format!("'{}': {}", s, reason));

        let url = Url::parse(s).map_err(|e| invalid(&e.to_string()))?;
        let scheme = match url.scheme() {
            "tcp" => Scheme::Tcp,
            "tls" => Scheme::Tls,
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            _ => return Err(invalid("unsupported scheme")),
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(invalid("missing host")),
        };

        let path = match url.path() {
            "" | "/" if scheme.is_websocket() => DEFAULT_RPC_PATH.to_string(),
            path if scheme.is_websocket() => path.to_string(),
            _ => String::new(),
        };

        Ok(Self {
            scheme,
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            path,
        })
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme.as_str(), self.authority(), self.path)
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// TLS configuration for `tls://` and `wss://` endpoints.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the webpki roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
    /// Server name for SNI (defaults to the endpoint host).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Reconnect policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Rebuild the connection after a transport failure.
    pub enabled: bool,
    /// Delay before the first reconnect attempt.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Give up after this many failed attempts. `None` retries until closed.
    pub max_attempts: Option<u32>,
    /// Each delay is scaled by a random factor in `1 ± jitter`, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: None,
            jitter: 0.3,
        }
    }
}

impl ReconnectConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    /// Default deadline for each request. `None` waits until the connection closes.
    pub request_timeout: Option<Duration>,
    /// Read buffer size for stream transports.
    pub read_buffer_size: usize,
    pub tls: Option<TlsClientConfig>,
    pub reconnect: ReconnectConfig,
    /// Namespace selected on every (re)connect.
    pub namespace: Option<String>,
    /// Database selected on every (re)connect.
    pub database: Option<String>,
    /// Token authenticated on every (re)connect.
    pub token: Option<String>,
}

impl ConnectionConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(30)),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            tls: None,
            reconnect: ReconnectConfig::default(),
            namespace: None,
            database: None,
            token: None,
        }
    }

    /// Parses `url` into an endpoint and applies defaults.
    pub fn parse(url: &str) -> Result<Self, ClientError> {
        Ok(Self::new(Endpoint::parse(url)?))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Applies `TETHER_*` environment variables on top of this configuration.
    pub fn apply_env_overrides(&mut self) -> Result<(), ClientError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ClientError> {
        if let Some(endpoint) = lookup("TETHER_ENDPOINT") {
            self.endpoint = Endpoint::parse(&endpoint)?;
        }

        if let Some(ns) = lookup("TETHER_NS") {
            self.namespace = Some(ns);
        }

        if let Some(db) = lookup("TETHER_DB") {
            self.database = Some(db);
        }

        if let Some(token) = lookup("TETHER_TOKEN") {
            if !token.is_empty() {
                self.token = Some(token);
            }
        }

        if let Some(timeout) = lookup("TETHER_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.request_timeout = (ms > 0).then(|| Duration::from_millis(ms));
            }
        }

        if let Some(enabled) = lookup("TETHER_RECONNECT") {
            self.reconnect.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }

        if let Some(interval) = lookup("TETHER_RECONNECT_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.reconnect.initial_backoff = Duration::from_millis(ms);
            }
        }

        Ok(())
    }
}
