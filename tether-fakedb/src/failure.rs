//! Failure injection.
//!
//! A [`FailurePlan`] holds rules consulted for every incoming request. The
//! first rule matching the request's method fires and, if it has a count,
//! is consumed.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_protocol::{ErrorCode, Method};

/// What the server does instead of (or before) a normal reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    /// Delays the reply.
    Delay { ms: u64 },
    /// Delays the reply by a uniformly random amount.
    RandomDelay { min_ms: u64, max_ms: u64 },
    /// Closes the connection without replying.
    DropConnection,
    /// Replies with bytes that are not a valid envelope.
    InvalidResponse,
    /// Replies with an error instead of executing the request.
    ServerError { code: i64, message: String },
}

impl Failure {
    /// The delay to apply before replying, if any.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Failure::Delay { ms } => Some(Duration::from_millis(*ms)),
            Failure::RandomDelay { min_ms, max_ms } => {
                let ms = if max_ms > min_ms {
                    rand::rng().random_range(*min_ms..=*max_ms)
                } else {
                    *min_ms
                };
                Some(Duration::from_millis(ms))
            }
            _ => None,
        }
    }

    pub fn server_error(code: ErrorCode, message: impl Into<String>) -> Self {
        Failure::ServerError {
            code: code.as_i64(),
            message: message.into(),
        }
    }
}

/// A failure armed for one method (or all methods), optionally a limited
/// number of times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRule {
    #[serde(default)]
    pub method: Option<Method>,
    pub failure: Failure,
    #[serde(default)]
    pub count: Option<u32>,
}

impl FailureRule {
    /// Fires on every request.
    pub fn always(failure: Failure) -> Self {
        Self {
            method: None,
            failure,
            count: None,
        }
    }

    pub fn on(method: Method, failure: Failure) -> Self {
        Self {
            method: Some(method),
            failure,
            count: None,
        }
    }

    pub fn times(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    fn matches(&self, method: Method) -> bool {
        self.method.map_or(true, |m| m == method)
    }
}

/// Armed failures.
#[derive(Debug, Default)]
pub struct FailurePlan {
    rules: Mutex<Vec<FailureRule>>,
}

impl FailurePlan {
    pub fn new(rules: impl IntoIterator<Item = FailureRule>) -> Self {
        Self {
            rules: Mutex::new(rules.into_iter().collect()),
        }
    }

    pub fn add(&self, rule: FailureRule) {
        self.rules.lock().push(rule);
    }

    pub fn clear(&self) {
        self.rules.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.rules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.lock().is_empty()
    }

    /// Returns the failure to apply to a request for `method`.
    pub fn next(&self, method: Method) -> Option<Failure> {
        let mut rules = self.rules.lock();
        let index = rules.iter().position(|rule| rule.matches(method))?;
        let rule = &mut rules[index];
        let failure = rule.failure.clone();
        match rule.count {
            Some(n) if n <= 1 => {
                rules.remove(index);
            }
            Some(n) => rule.count = Some(n - 1),
            None => {}
        }
        Some(failure)
    }
}
