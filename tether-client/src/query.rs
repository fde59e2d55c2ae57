//! Per-statement resolution of batch `query` replies.
//!
//! A `query` reply is an array with one raw result per statement. The
//! resolver turns it into typed [`QueryResult`]s, classifies failed statements
//! and collects them into a single [`QueryErrors`] value.

use crate::error::ClientError;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::ops::Range;
use std::time::Duration;
use tether_protocol::{ProtocolError, QueryStatus, RawQueryResult, NOT_EXECUTED_MESSAGE};
use thiserror::Error;

/// Failure of one statement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatementError {
    #[error("statement {index} failed: {message}")]
    Failed { index: usize, message: String },

    #[error("statement {index} not executed: transaction failed")]
    NotExecuted { index: usize },
}

impl StatementError {
    pub fn index(&self) -> usize {
        match self {
            StatementError::Failed { index, .. } | StatementError::NotExecuted { index } => *index,
        }
    }
}

/// Every statement error of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryErrors(Vec<StatementError>);

impl QueryErrors {
    pub fn new(errors: Vec<StatementError>) -> Self {
        Self(errors)
    }

    pub fn errors(&self) -> &[StatementError] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for QueryErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for QueryErrors {}

/// Outcome of one statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    pub index: usize,
    pub status: QueryStatus,
    /// Server-reported execution time.
    pub time: Duration,
    pub result: Option<T>,
    pub error: Option<StatementError>,
}

impl<T> QueryResult<T> {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Resolved reply of a whole batch.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse<T> {
    results: Vec<QueryResult<T>>,
    errors: Option<QueryErrors>,
}

impl<T> QueryResponse<T> {
    pub fn results(&self) -> &[QueryResult<T>] {
        &self.results
    }

    pub fn into_results(self) -> Vec<QueryResult<T>> {
        self.results
    }

    /// The aggregate error, if any statement failed.
    pub fn error(&self) -> Option<&QueryErrors> {
        self.errors.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_none()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Result of the first statement.
    pub fn first(&self) -> Option<&T> {
        self.results.first().and_then(|r| r.result.as_ref())
    }

    /// Moves the result of statement `index` out of the response.
    pub fn take(&mut self, index: usize) -> Option<T> {
        self.results.get_mut(index).and_then(|r| r.result.take())
    }

    pub fn total_time(&self) -> Duration {
        self.results.iter().map(|r| r.time).sum()
    }

    /// Fails with [`ClientError::Query`] if any statement failed.
    pub fn into_result(self) -> Result<Vec<QueryResult<T>>, ClientError> {
        match self.errors {
            Some(errors) => Err(ClientError::Query(errors)),
            None => Ok(self.results),
        }
    }
}

/// Turns raw `query` replies into [`QueryResponse`]s.
///
/// Statements inside an explicit transaction that follow a failure in the
/// same transaction are reported as not executed. Statements outside a
/// transaction, or in a different one, keep the outcome the server reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResolver {
    /// Result indices covered by each `BEGIN` block.
    transactions: Vec<Range<usize>>,
}

impl QueryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treats the whole batch as one transaction.
    pub fn transactional(mut self, transactional: bool) -> Self {
        self.transactions = if transactional {
            vec![0..usize::MAX]
        } else {
            Vec::new()
        };
        self
    }

    /// A resolver for the batch `sql`, aware of its `BEGIN` blocks.
    pub fn for_query(sql: &str) -> Self {
        Self {
            transactions: transaction_spans(sql),
        }
    }

    fn transaction_of(&self, index: usize) -> Option<usize> {
        self.transactions.iter().position(|span| span.contains(&index))
    }

    pub fn resolve<T: DeserializeOwned>(&self, raw: Value) -> Result<QueryResponse<T>, ClientError> {
        if !raw.is_array() {
            return Err(ClientError::Decode(ProtocolError::InvalidField {
                field: "result",
                reason: "query reply must be an array of statement results".to_string(),
            }));
        }
        let statements: Vec<RawQueryResult> = serde_json::from_value(raw).map_err(|e| {
            ClientError::Decode(ProtocolError::InvalidField {
                field: "result",
                reason: e.to_string(),
            })
        })?;

        let mut results = Vec::with_capacity(statements.len());
        let mut errors = Vec::new();
        let mut failed_transaction = None;

        for (index, statement) in statements.into_iter().enumerate() {
            let time = parse_duration(&statement.time).unwrap_or_else(|| {
                tracing::debug!("Unparseable statement time '{}'", statement.time);
                Duration::ZERO
            });
            let transaction = self.transaction_of(index);
            let aborted = transaction.is_some() && transaction == failed_transaction;

            let error = match statement.status {
                QueryStatus::Err => {
                    let message = match statement.result {
                        Value::String(message) => message,
                        other => other.to_string(),
                    };
                    if message == NOT_EXECUTED_MESSAGE || aborted {
                        Some(StatementError::NotExecuted { index })
                    } else {
                        if transaction.is_some() {
                            failed_transaction = transaction;
                        }
                        Some(StatementError::Failed { index, message })
                    }
                }
                QueryStatus::Ok if aborted => Some(StatementError::NotExecuted { index }),
                QueryStatus::Ok => {
                    let value: T = serde_json::from_value(statement.result)?;
                    results.push(QueryResult {
                        index,
                        status: QueryStatus::Ok,
                        time,
                        result: Some(value),
                        error: None,
                    });
                    continue;
                }
            };

            if let Some(error) = &error {
                errors.push(error.clone());
            }
            results.push(QueryResult {
                index,
                status: QueryStatus::Err,
                time,
                result: None,
                error,
            });
        }

        Ok(QueryResponse {
            results,
            errors: if errors.is_empty() {
                None
            } else {
                Some(QueryErrors::new(errors))
            },
        })
    }
}

/// Whether `sql` opens an explicit transaction with `BEGIN`.
pub fn is_explicit_transaction(sql: &str) -> bool {
    !transaction_spans(sql).is_empty()
}

/// Result indices of each `BEGIN ... COMMIT|CANCEL` block in `sql`.
///
/// Control statements produce no result of their own. A block left open runs
/// to the end of the batch; a stray `COMMIT` or `CANCEL` is ignored.
pub fn transaction_spans(sql: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut open = None;
    let mut index = 0;

    for statement in split_statements(sql) {
        let keyword = statement.split_whitespace().next().unwrap_or_default();
        if keyword.eq_ignore_ascii_case("BEGIN") {
            open.get_or_insert(index);
        } else if keyword.eq_ignore_ascii_case("COMMIT") || keyword.eq_ignore_ascii_case("CANCEL") {
            if let Some(start) = open.take() {
                spans.push(start..index);
            }
        } else {
            index += 1;
        }
    }
    if let Some(start) = open {
        spans.push(start..usize::MAX);
    }
    spans
}

/// Splits on `;` outside quoted strings (with backslash escapes), dropping empty
/// statements.
fn split_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut quote = None;
    let mut escaped = false;

    for (i, c) in sql.char_indices() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == ';' => {
                statements.push(&sql[start..i]);
                start = i + 1;
            }
            None => {}
        }
    }
    statements.push(&sql[start..]);

    statements
        .into_iter()
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .collect()
}

/// Parses server durations such as `"29.375µs"`, `"1.2ms"` or `"1m2.5s"`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let number: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "µs" | "μs" | "us" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += number * nanos_per_unit;
    }

    Some(Duration::from_nanos(total.round() as u64))
}
