//! Live query registry and change notifications.

use crate::server::Outbound;
use crate::store::{diff, Change, Scope};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tether_protocol::{Action, Codec, Notification};
use tokio::sync::mpsc;

/// A registered live query.
#[derive(Debug, Clone)]
pub struct LiveQuery {
    pub id: String,
    pub conn_id: u64,
    pub scope: Scope,
    pub table: String,
    pub diff: bool,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// Tracks live queries of every connection and pushes notifications to them.
pub struct LiveRegistry {
    codec: Arc<dyn Codec>,
    queries: DashMap<String, LiveQuery>,
}

impl LiveRegistry {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            codec,
            queries: DashMap::new(),
        }
    }

    /// Registers a live query and returns its id.
    pub fn register(
        &self,
        conn_id: u64,
        scope: Scope,
        table: &str,
        diff: bool,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(conn = conn_id, live_id = %id, table, diff, "live query registered");
        self.queries.insert(
            id.clone(),
            LiveQuery {
                id: id.clone(),
                conn_id,
                scope,
                table: table.to_string(),
                diff,
                outbound,
            },
        );
        id
    }

    /// Removes a live query owned by `conn_id`. Returns whether it existed.
    pub fn kill(&self, conn_id: u64, id: &str) -> bool {
        self.queries
            .remove_if(id, |_, query| query.conn_id == conn_id)
            .is_some()
    }

    /// Removes every live query of a connection.
    pub fn remove_connection(&self, conn_id: u64) -> usize {
        let before = self.queries.len();
        self.queries.retain(|_, query| query.conn_id != conn_id);
        before.saturating_sub(self.queries.len())
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<LiveQuery> {
        self.queries.get(id).map(|q| q.clone())
    }

    /// Sends a notification for each change to every live query watching
    /// the changed table. Returns the number of notifications sent.
    pub fn notify(&self, scope: &Scope, changes: &[Change]) -> usize {
        if changes.is_empty() || self.queries.is_empty() {
            return 0;
        }
        let mut sent = 0;
        for query in self.queries.iter() {
            if query.scope != *scope {
                continue;
            }
            for change in changes.iter().filter(|c| c.table == query.table) {
                let notification =
                    Notification::new(query.id.clone(), change.action, notification_result(change, query.diff));
                let bytes = match self.codec.encode_notification(&notification) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(live_id = %query.id, "failed to encode notification: {}", e);
                        continue;
                    }
                };
                if query.outbound.send(Outbound::Frame(bytes)).is_ok() {
                    sent += 1;
                }
            }
        }
        sent
    }
}

fn notification_result(change: &Change, diff_mode: bool) -> Value {
    if !diff_mode || change.action == Action::Delete {
        return change.record();
    }
    let before = change.before.clone().unwrap_or(Value::Null);
    let after = change.after.clone().unwrap_or(Value::Null);
    serde_json::to_value(diff(&before, &after)).unwrap_or(Value::Null)
}
