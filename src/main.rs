//! tether-fakedb - a fake tether server for local development.
//!
//! Serves the framed TCP protocol (`tcp://` or `tls://` endpoints) with an
//! in-memory store.

use tether_fakedb::config::CONFIG_ENV;
use tether_fakedb::{FakeDbConfig, FakeServer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match FakeDbConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        tracing::info!("Loaded config from {}", path);
    }

    tracing::info!("Starting tether-fakedb");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Version: {}", config.version);
    if config.auth.required {
        if config.auth.users.is_empty() {
            tracing::error!("auth.required=true but no users configured!");
            return Err("Authentication required but no users configured".into());
        }
        tracing::info!(
            "  Authentication: enabled ({} user(s))",
            config.auth.users.len()
        );
    } else {
        tracing::info!("  Authentication: disabled");
    }
    if config.tls.enabled {
        tracing::info!("  TLS: enabled");
        if config.tls.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
    }
    if !config.failures.is_empty() {
        tracing::warn!("  Failure injection: {} rule(s) armed", config.failures.len());
    }

    let server = FakeServer::new(config);

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            signal_server.shutdown();
        }
    });

    server.run().await?;
    tracing::info!("Server stopped");
    Ok(())
}
