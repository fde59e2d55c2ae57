//! Pending-request table: one single-use delivery slot per outstanding request id.

use crate::error::ClientError;
use crate::router::LiveStream;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_protocol::{Method, Reply};
use tokio::sync::oneshot;

/// What the read loop hands back to a waiting caller.
#[derive(Debug)]
pub struct Delivered {
    pub reply: Reply,
    /// For successful `live` replies: the stream registered before any later
    /// frame was read, or the registration error.
    pub live: Option<Result<LiveStream, ClientError>>,
}

pub type Delivery = Result<Delivered, ClientError>;

struct Slot {
    method: Method,
    generation: u64,
    tx: oneshot::Sender<Delivery>,
}

/// A registered slot, held by the caller waiting on it.
pub struct Registration {
    pub generation: u64,
    pub rx: oneshot::Receiver<Delivery>,
}

/// Concurrent map from request id to delivery slot.
#[derive(Default)]
pub struct PendingTable {
    slots: DashMap<String, Slot>,
    generation: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot for `id`. An id that already has a slot is a collision.
    pub fn register(&self, id: &str, method: Method) -> Result<Registration, ClientError> {
        match self.slots.entry(id.to_string()) {
            Entry::Occupied(_) => Err(ClientError::IdCollision(id.to_string())),
            Entry::Vacant(vacant) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                vacant.insert(Slot {
                    method,
                    generation,
                    tx,
                });
                Ok(Registration { generation, rx })
            }
        }
    }

    /// Removes the slot for `id` so the caller can deliver into it.
    pub fn take(&self, id: &str) -> Option<(Method, oneshot::Sender<Delivery>)> {
        self.slots
            .remove(id)
            .map(|(_, slot)| (slot.method, slot.tx))
    }

    /// Removes the slot for `id` only if it is still the registration `generation`.
    pub fn remove_if_generation(&self, id: &str, generation: u64) -> bool {
        self.slots
            .remove_if(id, |_, slot| slot.generation == generation)
            .is_some()
    }

    /// Fails every outstanding slot with a connection-closed error.
    pub fn fail_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, slot)) = self.slots.remove(&id) {
                let _ = slot.tx.send(Err(ClientError::ConnectionClosed {
                    reason: reason.to_string(),
                }));
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Removes its slot when dropped, unless disarmed after delivery.
///
/// Covers timeouts and callers whose future is dropped mid-wait.
pub(crate) struct SlotGuard<'a> {
    table: &'a PendingTable,
    id: &'a str,
    generation: u64,
    armed: bool,
}

impl<'a> SlotGuard<'a> {
    pub(crate) fn new(table: &'a PendingTable, id: &'a str, generation: u64) -> Self {
        Self {
            table,
            id,
            generation,
            armed: true,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.table.remove_if_generation(self.id, self.generation) {
            tracing::debug!("Removed abandoned slot for request id={}", self.id);
        }
    }
}
