//! Command execution.

use crate::Commands;
use colored::Colorize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tether_client::{Action, Client, Notification, QueryResponse};

/// Executes a one-shot command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            client.ping().await?;
            Ok("PONG".green().to_string())
        }

        Commands::Info => {
            let info: Value = client.info().await?;
            if info.is_null() {
                return Ok("Not signed in".yellow().to_string());
            }
            Ok(format_json(&info))
        }

        Commands::Version => Ok(client.version().await?),

        Commands::Query { sql, vars } => {
            let sql = read_arg(&sql)?;
            let response = match vars {
                Some(vars) => client.query_with(&sql, parse_json_arg(&vars)?).await?,
                None => client.query(&sql).await?,
            };
            Ok(format_query(&response))
        }

        Commands::Select { what } => {
            let result: Value = client.select(&what).await?;
            Ok(format_json(&result))
        }

        Commands::Create { thing, data } => {
            let data = data
                .map(|d| parse_json_arg(&d))
                .transpose()?
                .unwrap_or(Value::Null);
            let record: Value = client.create(&thing, data).await?;
            Ok(format!("{}\n{}", "Created".green(), format_json(&record)))
        }

        Commands::Delete { thing } => {
            let removed: Value = client.delete(&thing).await?;
            let count = match &removed {
                Value::Array(items) => items.len(),
                Value::Null => 0,
                _ => 1,
            };
            Ok(format!("{} {} record(s)", "Deleted".green(), count))
        }

        Commands::Kill { id } => {
            client.kill(&id).await?;
            Ok(format!("{} live query {}", "Killed".green(), id.cyan()))
        }

        // Handled in main.rs
        Commands::Repl | Commands::Live { .. } | Commands::HashPassword { .. } => {
            Err("command cannot run here".into())
        }
    }
}

/// Prints notifications of a live query until Ctrl+C, then kills it.
pub async fn stream_live(
    client: &Client,
    table: &str,
    diff: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = client.live(table, diff).await?;
    eprintln!(
        "{} {} (live id: {})",
        "Watching".green(),
        table.cyan(),
        stream.id()
    );
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    loop {
        tokio::select! {
            notification = stream.next() => match notification {
                Some(notification) => println!("{}", format_notification(&notification)),
                None => {
                    let reason = stream
                        .close_reason()
                        .map(|r| format!("{:?}", r))
                        .unwrap_or_else(|| "unknown".to_string());
                    eprintln!("{}: {}", "Live query ended".red(), reason);
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping live query...".dimmed());
                let id = stream.id().to_string();
                client.kill(&id).await?;
                return Ok(());
            }
        }
    }
}

/// SHA-256 hex digest, as stored in `auth.users[].password_hash`.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// One block per statement: its index, time and result or error.
pub fn format_query(response: &QueryResponse<Value>) -> String {
    let mut output = String::new();
    for result in response.results() {
        let header = format!("-- Statement #{} ({:?})", result.index + 1, result.time);
        output.push_str(&header.dimmed().to_string());
        output.push('\n');
        match (&result.result, &result.error) {
            (_, Some(error)) => output.push_str(&error.to_string().red().to_string()),
            (Some(value), None) => output.push_str(&format_json(value)),
            (None, None) => output.push_str("null"),
        }
        output.push_str("\n\n");
    }
    output.trim_end().to_string()
}

pub fn format_notification(notification: &Notification) -> String {
    let action = match notification.action {
        Action::Create => "CREATE".green(),
        Action::Update => "UPDATE".yellow(),
        Action::Delete => "DELETE".red(),
    };
    format!("{} {}", action, notification.result)
}

/// Reads `@path` arguments from a file, else returns the argument itself.
pub fn read_arg(arg: &str) -> Result<String, std::io::Error> {
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path),
        None => Ok(arg.to_string()),
    }
}

/// Parses a JSON argument (either inline JSON or @file.json).
pub fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    Ok(serde_json::from_str(&read_arg(arg)?)?)
}

pub fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
