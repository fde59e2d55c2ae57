//! Request id generation.

use parking_lot::Mutex;
use rand::distr::{Alphanumeric, SampleString};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Length of generated request ids.
pub const REQUEST_ID_LENGTH: usize = 16;

/// Produces request ids for one connection.
pub trait IdGenerator: Send + Sync + 'static {
    fn next_id(&self) -> String;
}

/// Random alphanumeric ids of fixed length.
pub struct RandomIdGenerator {
    rng: Mutex<StdRng>,
    length: usize,
}

impl RandomIdGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
            length: REQUEST_ID_LENGTH,
        }
    }

    /// Deterministic sequence, for reproducible tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            length: REQUEST_ID_LENGTH,
        }
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length.max(1);
        self
    }
}

impl Default for RandomIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> String {
        Alphanumeric.sample_string(&mut *self.rng.lock(), self.length)
    }
}

/// Monotonic ids `"{prefix}{n}"`.
pub struct SequentialIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        format!("{}{}", self.prefix, self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_random_ids_shape() {
        let ids = RandomIdGenerator::new();
        let id = ids.next_id();
        assert_eq!(id.len(), REQUEST_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_random_ids_distinct() {
        let ids = RandomIdGenerator::new();
        let seen: HashSet<String> = (0..10_000).map(|_| ids.next_id()).collect();
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn test_seeded_ids_repeat() {
        let a = RandomIdGenerator::with_seed(7);
        let b = RandomIdGenerator::with_seed(7);
        assert_eq!(a.next_id(), b.next_id());
        assert_eq!(a.next_id(), b.next_id());
    }

    #[test]
    fn test_length_override() {
        let ids = RandomIdGenerator::with_seed(1).with_length(0);
        assert_eq!(ids.next_id().len(), 1);
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIdGenerator::new("req-");
        assert_eq!(ids.next_id(), "req-1");
        assert_eq!(ids.next_id(), "req-2");
    }
}
