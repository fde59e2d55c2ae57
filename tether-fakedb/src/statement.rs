//! A tiny statement language, enough to exercise `query` replies.
//!
//! Supported statements (keywords are case-insensitive):
//!
//! ```text
//! BEGIN [TRANSACTION]            COMMIT [TRANSACTION]       CANCEL [TRANSACTION]
//! RETURN <expr>                  THROW <expr>
//! SELECT * FROM <what>           CREATE <what> [CONTENT <json>]
//! DELETE [FROM] <what>           LET $name = <expr>
//! LIVE SELECT [DIFF | *] FROM <table>
//! KILL <expr>
//! ```
//!
//! An expression is a `$param`, a single-quoted string or a JSON literal.

use crate::error::FakeDbError;
use crate::store::Target;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Value(Value),
    Param(String),
}

impl Expr {
    /// Resolves parameters against `vars`. Unknown parameters are `null`.
    pub fn eval(&self, vars: &BTreeMap<String, Value>) -> Value {
        match self {
            Expr::Value(value) => value.clone(),
            Expr::Param(name) => vars.get(name).cloned().unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Begin,
    Commit,
    Cancel,
    Return(Expr),
    Throw(Expr),
    Select { what: Target },
    Create { what: Target, content: Option<Expr> },
    Delete { what: Target },
    Let { name: String, value: Expr },
    Live { table: String, diff: bool },
    Kill(Expr),
}

impl Statement {
    /// Whether the statement starts or ends a transaction block.
    pub fn is_transaction_control(&self) -> bool {
        matches!(self, Statement::Begin | Statement::Commit | Statement::Cancel)
    }
}

/// Parses a batch of `;`-separated statements.
pub fn parse(sql: &str) -> Result<Vec<Statement>, FakeDbError> {
    split_statements(sql)
        .iter()
        .map(|s| parse_statement(s))
        .collect()
}

/// Splits on `;` outside quotes, dropping empty statements.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in sql.chars() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                current.push(c);
            }
            None if c == ';' => {
                statements.push(std::mem::take(&mut current));
            }
            None => current.push(c),
        }
    }
    statements.push(current);

    statements
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_statement(input: &str) -> Result<Statement, FakeDbError> {
    let (keyword, rest) = next_word(input);
    let statement = match keyword.to_ascii_uppercase().as_str() {
        "BEGIN" => transaction_keyword(Statement::Begin, rest)?,
        "COMMIT" => transaction_keyword(Statement::Commit, rest)?,
        "CANCEL" => transaction_keyword(Statement::Cancel, rest)?,
        "RETURN" => Statement::Return(parse_expr(rest)?),
        "THROW" => Statement::Throw(parse_expr(rest)?),
        "SELECT" => {
            let rest = expect_word(rest, "*")?;
            let rest = expect_word(rest, "FROM")?;
            Statement::Select {
                what: Target::parse(rest)?,
            }
        }
        "CREATE" => {
            let (what, rest) = next_word(rest);
            let what = Target::parse(what)?;
            let content = if rest.is_empty() {
                None
            } else {
                Some(parse_expr(expect_word(rest, "CONTENT")?)?)
            };
            Statement::Create { what, content }
        }
        "DELETE" => {
            let (word, after) = next_word(rest);
            let what = if word.eq_ignore_ascii_case("FROM") {
                after
            } else {
                rest
            };
            Statement::Delete {
                what: Target::parse(what)?,
            }
        }
        "LET" => {
            let (name, rest) = next_word(rest);
            let name = name
                .strip_prefix('$')
                .filter(|n| !n.is_empty())
                .ok_or_else(|| syntax_error(input, "expected a $parameter"))?;
            let rest = expect_word(rest, "=")?;
            Statement::Let {
                name: name.to_string(),
                value: parse_expr(rest)?,
            }
        }
        "LIVE" => {
            let rest = expect_word(rest, "SELECT")?;
            let (projection, rest) = next_word(rest);
            let diff = match projection.to_ascii_uppercase().as_str() {
                "DIFF" => true,
                "*" => false,
                _ => return Err(syntax_error(input, "expected DIFF or *")),
            };
            let rest = expect_word(rest, "FROM")?;
            let target = Target::parse(rest)?;
            if target.key.is_some() {
                return Err(syntax_error(input, "live queries watch whole tables"));
            }
            Statement::Live {
                table: target.table,
                diff,
            }
        }
        "KILL" => Statement::Kill(parse_expr(rest)?),
        _ => return Err(syntax_error(input, "unexpected statement")),
    };
    Ok(statement)
}

fn transaction_keyword(statement: Statement, rest: &str) -> Result<Statement, FakeDbError> {
    if rest.is_empty() || rest.eq_ignore_ascii_case("TRANSACTION") {
        Ok(statement)
    } else {
        Err(syntax_error(rest, "expected TRANSACTION"))
    }
}

fn next_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(end) => (&input[..end], input[end..].trim_start()),
        None => (input, ""),
    }
}

fn expect_word<'a>(input: &'a str, expected: &str) -> Result<&'a str, FakeDbError> {
    let (word, rest) = next_word(input);
    if word.eq_ignore_ascii_case(expected) {
        Ok(rest)
    } else {
        Err(syntax_error(input, &format!("expected {}", expected)))
    }
}

fn parse_expr(input: &str) -> Result<Expr, FakeDbError> {
    let input = input.trim();
    if let Some(name) = input.strip_prefix('$') {
        if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Ok(Expr::Param(name.to_string()));
        }
    }
    if let Some(inner) = input
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
    {
        return Ok(Expr::Value(Value::String(inner.replace("\\'", "'"))));
    }
    serde_json::from_str(input)
        .map(Expr::Value)
        .map_err(|_| syntax_error(input, "expected a value"))
}

fn syntax_error(near: &str, reason: &str) -> FakeDbError {
    let near: String = near.chars().take(40).collect();
    FakeDbError::Parse(format!("{} near '{}'", reason, near))
}
