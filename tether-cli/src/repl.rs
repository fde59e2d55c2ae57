//! Interactive REPL.
//!
//! Lines starting with a known command run that command; anything else is
//! sent to the server as a `query`.

use crate::commands::{format_json, format_query};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use serde_json::Value;
use std::path::PathBuf;
use tether_client::Client;

const HISTORY_FILE: &str = ".tether_history";

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help
  ping                          Ping the server
  info                          Show the signed-in user
  version                       Show the server version

  use <ns> [db]                 Switch namespace and database
  signin <user> <pass>          Sign in
  let <name> <json>             Set a session variable
  unset <name>                  Remove a session variable

  select <what>                 Select a table or record
  create <thing> [json]         Create a record
  delete <thing>                Delete records
  kill <live_id>                Stop a live query

  <statements>                  Anything else runs as a query,
                                e.g. SELECT * FROM person;

  quit, exit                    Exit the REPL
"#;

pub async fn run(client: &Client, endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "tether CLI".bold().cyan());
    println!("{} {}", "Connected to".green(), endpoint);

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = history_path();
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        match rl.readline(&prompt(client)) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(client, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    println!("{}", "Disconnected.".dimmed());
    Ok(())
}

fn history_path() -> PathBuf {
    home::home_dir()
        .map(|home| home.join(HISTORY_FILE))
        .unwrap_or_else(|| HISTORY_FILE.into())
}

/// `ns/db>` once a namespace and database are selected.
fn prompt(client: &Client) -> String {
    let session = client.session();
    let label = match (&session.namespace, &session.database) {
        (Some(ns), Some(db)) => format!("{}/{}>", ns, db),
        (Some(ns), None) => format!("{}>", ns),
        _ => "tether>".to_string(),
    };
    format!("{} ", label.cyan())
}

/// `create person:a {"x": 1}` rather than `CREATE person:a CONTENT ...`.
fn is_create_shorthand(args: &[&str]) -> bool {
    match args {
        [] => false,
        [_] => true,
        [_, next, ..] => !next.eq_ignore_ascii_case("content"),
    }
}

async fn execute_repl_command(
    client: &Client,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let cmd = parts[0].to_lowercase();
    let args = &parts[1..];

    match cmd.as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "ping" => {
            client.ping().await?;
            Ok(Some("PONG".green().to_string()))
        }

        "info" => {
            let info: Value = client.info().await?;
            Ok(Some(format_json(&info)))
        }

        "version" => Ok(Some(client.version().await?)),

        "use" => {
            if args.is_empty() {
                return Ok(Some("Usage: use <ns> [db]".to_string()));
            }
            client.use_ns_db(Some(args[0]), args.get(1).copied()).await?;
            Ok(Some("OK".green().to_string()))
        }

        "signin" => {
            if args.len() < 2 {
                return Ok(Some("Usage: signin <user> <pass>".to_string()));
            }
            client
                .signin(serde_json::json!({ "user": args[0], "pass": args[1] }))
                .await?;
            Ok(Some(format!("{} as {}", "Signed in".green(), args[0].cyan())))
        }

        "let" => {
            if args.len() < 2 {
                return Ok(Some("Usage: let <name> <json>".to_string()));
            }
            let value: Value = serde_json::from_str(&args[1..].join(" "))?;
            client.set(args[0].trim_start_matches('$'), value).await?;
            Ok(Some("OK".green().to_string()))
        }

        "unset" => {
            if args.is_empty() {
                return Ok(Some("Usage: unset <name>".to_string()));
            }
            client.unset(args[0].trim_start_matches('$')).await?;
            Ok(Some("OK".green().to_string()))
        }

        // `select * from ...` is a statement, `select person` is the method.
        "select" if args.len() == 1 => {
            let result: Value = client.select(args[0]).await?;
            Ok(Some(format_json(&result)))
        }

        "create" if is_create_shorthand(args) => {
            let data = match args.get(1) {
                Some(_) => serde_json::from_str(&args[1..].join(" "))?,
                None => Value::Null,
            };
            let record: Value = client.create(args[0], data).await?;
            Ok(Some(format_json(&record)))
        }

        "delete" if args.len() == 1 && !args[0].eq_ignore_ascii_case("from") => {
            let removed: Value = client.delete(args[0]).await?;
            Ok(Some(format_json(&removed)))
        }

        "kill" if args.len() == 1 && !args[0].starts_with('\'') => {
            client.kill(args[0]).await?;
            Ok(Some("OK".green().to_string()))
        }

        _ => {
            let response = client.query::<Value>(line).await?;
            Ok(Some(format_query(&response)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_shorthand() {
        assert!(!is_create_shorthand(&[]));
        assert!(is_create_shorthand(&["person:a"]));
        assert!(is_create_shorthand(&["person:a", "{\"x\":", "1}"]));
        assert!(!is_create_shorthand(&["person:a", "CONTENT", "{}"]));
    }
}
