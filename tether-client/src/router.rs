//! Notification router: one unbounded queue per live query id.
//!
//! The read loop pushes into the queues without ever waiting on a consumer.
//! Removing a queue closes it, which is how consumers learn that their live
//! query ended; [`LiveStream::close_reason`] tells them why.

use crate::error::ClientError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tether_protocol::Notification;
use tokio::sync::mpsc;

/// Why a live stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The live query was killed or unregistered.
    Killed,
    /// The connection carrying the live query died. Live queries are not
    /// re-created by the reconnector.
    ConnectionLost,
    /// The client was closed.
    ClientClosed,
}

struct Subscriber {
    tx: mpsc::UnboundedSender<Notification>,
    reason: Arc<OnceLock<CloseReason>>,
}

impl Subscriber {
    fn close(self, reason: CloseReason) {
        let _ = self.reason.set(reason);
        // Dropping the sender closes the queue.
    }
}

/// Outcome of routing one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    /// No live query with that id. Expected right after a kill.
    Unrouted,
    /// The consumer dropped its stream; the subscription was pruned.
    ConsumerGone,
}

/// Concurrent map from live query id to its delivery queue.
#[derive(Default)]
pub struct NotificationRouter {
    subscribers: DashMap<String, Subscriber>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the queue for `id`. Only one stream may exist per id.
    pub fn register(&self, id: &str) -> Result<LiveStream, ClientError> {
        match self.subscribers.entry(id.to_string()) {
            Entry::Occupied(_) => Err(ClientError::SubscriptionExists(id.to_string())),
            Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let reason = Arc::new(OnceLock::new());
                vacant.insert(Subscriber {
                    tx,
                    reason: reason.clone(),
                });
                tracing::debug!("Registered live query {}", id);
                Ok(LiveStream {
                    id: id.to_string(),
                    rx,
                    reason,
                })
            }
        }
    }

    /// Removes and closes the queue for `id`. Unknown ids are a no-op.
    pub fn unregister(&self, id: &str) -> bool {
        self.unregister_with(id, CloseReason::Killed)
    }

    pub fn unregister_with(&self, id: &str, reason: CloseReason) -> bool {
        match self.subscribers.remove(id) {
            Some((_, subscriber)) => {
                subscriber.close(reason);
                tracing::debug!("Unregistered live query {} ({:?})", id, reason);
                true
            }
            None => false,
        }
    }

    /// Pushes `notification` to its live query's queue without blocking.
    pub fn dispatch(&self, notification: Notification) -> Dispatch {
        let id = notification.subscription_id.clone();
        let sent = match self.subscribers.get(&id) {
            Some(subscriber) => subscriber.tx.send(notification).is_ok(),
            None => return Dispatch::Unrouted,
        };

        if sent {
            Dispatch::Delivered
        } else {
            self.subscribers
                .remove_if(&id, |_, subscriber| subscriber.tx.is_closed());
            Dispatch::ConsumerGone
        }
    }

    /// Closes every queue, e.g. when the connection dies.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<String> = self
            .subscribers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter()
            .filter(|id| self.unregister_with(id, reason))
            .count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subscribers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

/// Notifications of one live query, in arrival order.
///
/// Ends (`None`) when the live query is killed or its connection is lost.
#[derive(Debug)]
pub struct LiveStream {
    id: String,
    rx: mpsc::UnboundedReceiver<Notification>,
    reason: Arc<OnceLock<CloseReason>>,
}

impl LiveStream {
    /// The live query id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the next notification; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Returns a buffered notification without waiting.
    pub fn try_next(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Set once the stream has been closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }
}

impl Stream for LiveStream {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
