//! Fake server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TETHER_FAKEDB_CONFIG)
//! 3. Environment variables

use crate::auth::Authenticator;
use crate::failure::FailureRule;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Environment variable naming the YAML config file.
pub const CONFIG_ENV: &str = "TETHER_FAKEDB_CONFIG";

const DEFAULT_BIND: SocketAddr =
    SocketAddr::V4(std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 8000));

/// Fake server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeDbConfig {
    pub network: NetworkConfig,
    pub auth: AuthConfig,
    pub tls: TlsConfig,
    /// Failures armed when the server starts.
    pub failures: Vec<FailureRule>,
    /// Reported by the `version` method.
    pub version: String,
}

impl Default for FakeDbConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            auth: AuthConfig::default(),
            tls: TlsConfig::default(),
            failures: Vec::new(),
            version: format!("tether-fakedb-{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl FakeDbConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Applies overrides from `lookup`, which maps variable names to values.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.network.apply_env_overrides(&lookup);
        self.auth.apply_env_overrides(&lookup);
        self.tls.apply_env_overrides(&lookup);
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.network.bind_addr = addr;
        self
    }

    /// Adds a user that can sign in with `password`.
    pub fn with_user(mut self, name: &str, password: &str) -> Self {
        self.auth.users.push(UserConfig {
            name: name.to_string(),
            password_hash: Authenticator::hash_password(password),
        });
        self
    }

    pub fn with_auth_required(mut self, required: bool) -> Self {
        self.auth.required = required;
        self
    }

    pub fn with_failure(mut self, rule: FailureRule) -> Self {
        self.failures.push(rule);
        self
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND,
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("TETHER_FAKEDB_BIND").and_then(|a| a.parse().ok()) {
            self.bind_addr = addr;
        }
        if let Some(max) = lookup("TETHER_FAKEDB_MAX_CONNECTIONS").and_then(|m| m.parse().ok()) {
            self.max_connections = max;
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether data methods require a signed-in session.
    pub required: bool,
    pub users: Vec<UserConfig>,
}

impl AuthConfig {
    fn apply_env_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(required) = lookup("TETHER_FAKEDB_AUTH_REQUIRED") {
            self.required = required == "1" || required.eq_ignore_ascii_case("true");
        }
        // name:password
        if let Some(user) = lookup("TETHER_FAKEDB_USER") {
            if let Some((name, password)) = user.split_once(':') {
                self.users.push(UserConfig {
                    name: name.to_string(),
                    password_hash: Authenticator::hash_password(password),
                });
            }
        }
    }
}

/// A user that can sign in. Generate hashes with `tether-cli hash-password`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub password_hash: String,
}

/// TLS configuration for [`crate::FakeServer::serve`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub require_client_cert: bool,
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("TETHER_FAKEDB_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
            self.enabled = true;
        }
        if let Some(path) = lookup("TETHER_FAKEDB_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    ParseError(PathBuf, String),
}

mod socket_addr_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::Failure;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tether_protocol::Method;

    #[test]
    fn test_defaults() {
        let config = FakeDbConfig::default();
        assert_eq!(config.network.bind_addr.port(), 8000);
        assert!(!config.auth.required);
        assert!(config.auth.users.is_empty());
        assert!(!config.tls.enabled);
        assert!(config.version.starts_with("tether-fakedb-"));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
network:
  bind_addr: "0.0.0.0:9000"
auth:
  required: true
  users:
    - name: root
      password_hash: "{}"
failures:
  - method: select
    failure:
      kind: delay
      ms: 50
    count: 2
version: "surreal-2.0.0"
"#,
            Authenticator::hash_password("root")
        )
        .unwrap();

        let config = FakeDbConfig::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 9000);
        assert_eq!(config.network.max_connections, 1000);
        assert!(config.auth.required);
        assert_eq!(config.auth.users[0].name, "root");
        assert_eq!(config.failures.len(), 1);
        assert_eq!(config.failures[0].method, Some(Method::Select));
        assert_eq!(config.failures[0].failure, Failure::Delay { ms: 50 });
        assert_eq!(config.failures[0].count, Some(2));
        assert_eq!(config.version, "surreal-2.0.0");
    }

    #[test]
    fn test_from_file_errors() {
        let err = FakeDbConfig::from_file("/nonexistent/fakedb.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "network: [not, a, map]").unwrap();
        let err = FakeDbConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(..)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TETHER_FAKEDB_BIND", "127.0.0.1:9999"),
            ("TETHER_FAKEDB_AUTH_REQUIRED", "true"),
            ("TETHER_FAKEDB_USER", "admin:hunter2"),
            ("TETHER_FAKEDB_MAX_CONNECTIONS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = FakeDbConfig::default();
        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.network.bind_addr.port(), 9999);
        assert_eq!(config.network.max_connections, 1000);
        assert!(config.auth.required);
        assert_eq!(config.auth.users.len(), 1);
        assert_eq!(config.auth.users[0].name, "admin");
        assert_eq!(
            config.auth.users[0].password_hash,
            Authenticator::hash_password("hunter2")
        );
    }

    #[test]
    fn test_builders() {
        let config = FakeDbConfig::default()
            .with_user("root", "root")
            .with_auth_required(true)
            .with_failure(FailureRule::always(Failure::DropConnection));
        assert!(config.auth.required);
        assert_eq!(config.auth.users.len(), 1);
        assert_eq!(config.failures.len(), 1);
    }
}
