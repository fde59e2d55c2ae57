//! tether-cli - Command-line interface for tether
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;
use tether_client::{Client, ClientError, ConnectionConfig, ReconnectConfig, TlsClientConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tether-cli")]
#[command(about = "Command-line interface for tether document databases")]
#[command(version)]
struct Cli {
    /// Server endpoint (ws://, wss://, tcp:// or tls://)
    #[arg(short, long, env = "TETHER_ENDPOINT", default_value = "ws://127.0.0.1:8000")]
    endpoint: String,

    /// Namespace to use
    #[arg(long, env = "TETHER_NS")]
    ns: Option<String>,

    /// Database to use
    #[arg(long, env = "TETHER_DB")]
    db: Option<String>,

    /// Authentication token
    #[arg(short = 't', long, env = "TETHER_TOKEN", conflicts_with = "user")]
    token: Option<String>,

    /// User to sign in as
    #[arg(short, long, env = "TETHER_USER", requires = "pass")]
    user: Option<String>,

    /// Password for --user
    #[arg(short, long, env = "TETHER_PASS", hide_env_values = true)]
    pass: Option<String>,

    /// Reconnect and restore the session when the connection drops
    #[arg(long, env = "TETHER_RECONNECT")]
    reconnect: bool,

    // ===== TLS Options =====
    /// Path to CA certificate for server verification
    #[arg(long, env = "TETHER_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "TETHER_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "TETHER_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to the endpoint host)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start interactive REPL
    Repl,

    /// Ping the server
    Ping,

    /// Show the signed-in user
    Info,

    /// Show the server version
    Version,

    /// Run statements
    Query {
        /// Statements (or @file.sql to read from file)
        sql: String,

        /// Bound variables as a JSON object (or @file.json)
        #[arg(long)]
        vars: Option<String>,
    },

    /// Select a table or a record
    Select {
        /// Table or record id, e.g. person or person:tobie
        what: String,
    },

    /// Create a record
    Create {
        /// Table or record id
        thing: String,

        /// Content JSON (or @file.json)
        data: Option<String>,
    },

    /// Delete a table's records or one record
    Delete {
        /// Table or record id
        thing: String,
    },

    /// Stream changes of a table until Ctrl+C
    Live {
        /// Table to watch
        table: String,

        /// Receive JSON patches instead of whole records
        #[arg(long)]
        diff: bool,
    },

    /// Stop a live query
    Kill {
        /// Live query id
        id: String,
    },

    /// Generate the SHA-256 hash of a password for fake server config files
    HashPassword {
        /// The password to hash
        password: String,
    },
}

impl Cli {
    fn tls_config(&self) -> Result<Option<TlsClientConfig>, String> {
        let wanted = self.ca_cert.is_some()
            || self.client_cert.is_some()
            || self.client_key.is_some()
            || self.insecure
            || self.server_name.is_some();
        if !wanted {
            return Ok(None);
        }

        let mut tls = TlsClientConfig::new();
        if let Some(path) = &self.ca_cert {
            tls = tls.with_ca_cert(path);
        }
        match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => tls = tls.with_client_cert(cert, key),
            (None, None) => {}
            _ => return Err("--client-cert and --client-key must be used together".into()),
        }
        if self.insecure {
            tls = tls.with_insecure();
        }
        if let Some(name) = &self.server_name {
            tls = tls.with_server_name(name);
        }
        Ok(Some(tls))
    }

    fn connection_config(&self) -> Result<ConnectionConfig, Box<dyn std::error::Error>> {
        let mut config = ConnectionConfig::parse(&self.endpoint)?.with_reconnect(
            if self.reconnect {
                ReconnectConfig::default()
            } else {
                ReconnectConfig::disabled()
            },
        );
        if let Some(ns) = &self.ns {
            config = config.with_namespace(ns);
        }
        if let Some(db) = &self.db {
            config = config.with_database(db);
        }
        if let Some(token) = &self.token {
            config = config.with_token(token);
        }
        if let Some(tls) = self.tls_config()? {
            config = config.with_tls(tls);
        }
        Ok(config)
    }
}

/// Connects and signs in with `--user`/`--pass` when given.
async fn connect(client: &Client, cli: &Cli) -> Result<(), ClientError> {
    client.connect().await?;
    if let (Some(user), Some(pass)) = (&cli.user, &cli.pass) {
        client.signin(json!({ "user": user, "pass": pass })).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Needs no server.
    if let Some(Commands::HashPassword { password }) = &cli.command {
        println!("{}", commands::hash_password(password));
        return Ok(());
    }

    let config = match cli.connection_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };
    let endpoint = config.endpoint.clone();
    let client = Client::new(config);

    if let Err(e) = connect(&client, &cli).await {
        eprintln!("{} to {}: {}", "Connection failed".red(), endpoint, e);
        std::process::exit(1);
    }

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(&client, &endpoint.to_string()).await?;
        }
        Some(Commands::Live { table, diff }) => {
            if let Err(e) = commands::stream_live(&client, &table, diff).await {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
        Some(cmd) => match commands::execute(&client, cmd).await {
            Ok(output) => println!("{}", output),
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                let _ = client.close().await;
                std::process::exit(1);
            }
        },
    }

    client.close().await?;
    Ok(())
}
