//! In-memory record store.
//!
//! Records are JSON objects grouped by namespace and database, then by table.
//! Every stored record carries its own `id` field as `table:key`.

use crate::error::FakeDbError;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tether_protocol::{Action, PatchOp};

type Table = BTreeMap<String, Value>;
type Tables = BTreeMap<String, Table>;

/// Namespace and database a request runs against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub namespace: String,
    pub database: String,
}

impl Scope {
    pub fn new(namespace: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            database: database.into(),
        }
    }
}

/// A whole table (`person`) or one record (`person:tobie`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub table: String,
    pub key: Option<String>,
}

impl Target {
    pub fn parse(s: &str) -> Result<Self, FakeDbError> {
        let s = s.trim();
        let (table, key) = match s.split_once(':') {
            Some((table, key)) => (table, Some(key)),
            None => (s, None),
        };
        let valid = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };
        if !valid(table) || key.is_some_and(|k| !valid(strip_brackets(k))) {
            return Err(FakeDbError::Parse(format!("invalid record or table '{}'", s)));
        }
        Ok(Self {
            table: table.to_string(),
            key: key.map(|k| strip_brackets(k).to_string()),
        })
    }

    pub fn record_id(&self, key: &str) -> String {
        format!("{}:{}", self.table, key)
    }
}

fn strip_brackets(key: &str) -> &str {
    key.strip_prefix('⟨')
        .and_then(|k| k.strip_suffix('⟩'))
        .unwrap_or(key)
}

/// A change to one record, used to drive live queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub table: String,
    pub action: Action,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl Change {
    /// The record as it should be reported: the new content, or the old
    /// content for deletions.
    pub fn record(&self) -> Value {
        self.after
            .clone()
            .or_else(|| self.before.clone())
            .unwrap_or(Value::Null)
    }
}

/// How an update treats the existing content.
#[derive(Debug, Clone)]
pub enum Modify {
    Replace(Value),
    Merge(Value),
    Patch(Vec<PatchOp>),
}

/// Saved contents of one scope, restored when a transaction fails.
#[derive(Debug, Clone)]
pub struct Snapshot {
    scope: Scope,
    tables: Option<Tables>,
}

/// The record store shared by every connection.
#[derive(Debug, Default)]
pub struct Store {
    scopes: Mutex<HashMap<Scope, Tables>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects a table (an array) or one record (`null` when missing).
    pub fn select(&self, scope: &Scope, target: &Target) -> Value {
        let scopes = self.scopes.lock();
        let table = scopes.get(scope).and_then(|t| t.get(&target.table));
        match &target.key {
            Some(key) => table
                .and_then(|t| t.get(key))
                .cloned()
                .unwrap_or(Value::Null),
            None => Value::Array(table.map(|t| t.values().cloned().collect()).unwrap_or_default()),
        }
    }

    /// Creates one record. Fails if the record exists.
    pub fn create(
        &self,
        scope: &Scope,
        target: &Target,
        content: Value,
    ) -> Result<Change, FakeDbError> {
        let mut scopes = self.scopes.lock();
        let table = scopes
            .entry(scope.clone())
            .or_default()
            .entry(target.table.clone())
            .or_default();
        let key = match &target.key {
            Some(key) => key.clone(),
            None => content
                .get("id")
                .and_then(Value::as_str)
                .map(|id| key_of(&target.table, id))
                .unwrap_or_else(generate_key),
        };
        if table.contains_key(&key) {
            return Err(FakeDbError::RecordExists(target.record_id(&key)));
        }
        let record = with_id(content, &target.record_id(&key))?;
        table.insert(key, record.clone());
        Ok(Change {
            table: target.table.clone(),
            action: Action::Create,
            before: None,
            after: Some(record),
        })
    }

    /// Inserts one object or an array of objects into a table.
    pub fn insert(
        &self,
        scope: &Scope,
        table: &str,
        data: Value,
    ) -> Result<Vec<Change>, FakeDbError> {
        let items = match data {
            Value::Array(items) => items,
            other => vec![other],
        };
        let target = Target {
            table: table.to_string(),
            key: None,
        };
        items
            .into_iter()
            .map(|item| self.create(scope, &target, item))
            .collect()
    }

    /// Modifies one record or every record of a table. With `upsert` a
    /// missing record is created first.
    pub fn modify(
        &self,
        scope: &Scope,
        target: &Target,
        modify: &Modify,
        upsert: bool,
    ) -> Result<Vec<Change>, FakeDbError> {
        let mut scopes = self.scopes.lock();
        let table = scopes
            .entry(scope.clone())
            .or_default()
            .entry(target.table.clone())
            .or_default();

        let keys: Vec<String> = match &target.key {
            Some(key) if table.contains_key(key) || upsert => vec![key.clone()],
            Some(_) => Vec::new(),
            None => table.keys().cloned().collect(),
        };

        let mut changes = Vec::with_capacity(keys.len());
        for key in keys {
            let id = target.record_id(&key);
            let before = table.get(&key).cloned();
            let base = before
                .clone()
                .unwrap_or_else(|| Value::Object(Map::new()));
            let updated = match modify {
                Modify::Replace(content) => content.clone(),
                Modify::Merge(content) => merge(base, content),
                Modify::Patch(ops) => apply_patch(base, ops)?,
            };
            let record = with_id(updated, &id)?;
            table.insert(key, record.clone());
            changes.push(Change {
                table: target.table.clone(),
                action: if before.is_some() {
                    Action::Update
                } else {
                    Action::Create
                },
                before,
                after: Some(record),
            });
        }
        Ok(changes)
    }

    /// Deletes one record or every record of a table.
    pub fn delete(&self, scope: &Scope, target: &Target) -> Vec<Change> {
        let mut scopes = self.scopes.lock();
        let Some(table) = scopes
            .get_mut(scope)
            .and_then(|t| t.get_mut(&target.table))
        else {
            return Vec::new();
        };
        let removed: Vec<Value> = match &target.key {
            Some(key) => table.remove(key).into_iter().collect(),
            None => std::mem::take(table).into_values().collect(),
        };
        removed
            .into_iter()
            .map(|record| Change {
                table: target.table.clone(),
                action: Action::Delete,
                before: Some(record),
                after: None,
            })
            .collect()
    }

    /// Creates an edge record `from -> relation -> to`.
    pub fn relate(
        &self,
        scope: &Scope,
        from: &Target,
        relation: &Target,
        to: &Target,
        data: Value,
    ) -> Result<Change, FakeDbError> {
        let (Some(from_key), Some(to_key)) = (&from.key, &to.key) else {
            return Err(FakeDbError::params("relate needs two record ids"));
        };
        let mut content = match data {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            _ => return Err(FakeDbError::params("relation content must be an object")),
        };
        content.insert("in".into(), Value::String(from.record_id(from_key)));
        content.insert("out".into(), Value::String(to.record_id(to_key)));
        self.create(scope, relation, Value::Object(content))
    }

    pub fn snapshot(&self, scope: &Scope) -> Snapshot {
        Snapshot {
            scope: scope.clone(),
            tables: self.scopes.lock().get(scope).cloned(),
        }
    }

    pub fn restore(&self, snapshot: Snapshot) {
        let mut scopes = self.scopes.lock();
        match snapshot.tables {
            Some(tables) => {
                scopes.insert(snapshot.scope, tables);
            }
            None => {
                scopes.remove(&snapshot.scope);
            }
        }
    }

    /// Number of records in one table.
    pub fn count(&self, scope: &Scope, table: &str) -> usize {
        self.scopes
            .lock()
            .get(scope)
            .and_then(|t| t.get(table))
            .map_or(0, |t| t.len())
    }
}

fn generate_key() -> String {
    let mut key = uuid::Uuid::new_v4().simple().to_string();
    key.truncate(20);
    key
}

/// Accepts both `person:tobie` and `tobie` as the key of a record of `table`.
fn key_of(table: &str, id: &str) -> String {
    id.strip_prefix(table)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(id)
        .to_string()
}

fn with_id(content: Value, id: &str) -> Result<Value, FakeDbError> {
    let mut map = match content {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => {
            return Err(FakeDbError::params(format!(
                "record content must be an object, got {}",
                other
            )))
        }
    };
    map.insert("id".into(), Value::String(id.to_string()));
    Ok(Value::Object(map))
}

fn merge(base: Value, content: &Value) -> Value {
    match (base, content) {
        (Value::Object(mut base), Value::Object(content)) => {
            for (key, value) in content {
                let merged = match base.remove(key) {
                    Some(existing) if value.is_object() => merge(existing, value),
                    _ => value.clone(),
                };
                base.insert(key.clone(), merged);
            }
            Value::Object(base)
        }
        (_, content) => content.clone(),
    }
}

/// Applies JSON patch `add`, `replace` and `remove` operations.
pub fn apply_patch(mut doc: Value, ops: &[PatchOp]) -> Result<Value, FakeDbError> {
    for op in ops {
        let (parent_path, last) = split_pointer(&op.path)?;
        let parent = doc
            .pointer_mut(&parent_path)
            .ok_or_else(|| FakeDbError::params(format!("patch path '{}' not found", op.path)))?;
        match op.op.as_str() {
            "add" | "replace" => {
                let value = op
                    .value
                    .clone()
                    .ok_or_else(|| FakeDbError::params("patch operation needs a value"))?;
                match parent {
                    Value::Object(map) => {
                        map.insert(last, value);
                    }
                    Value::Array(items) if last == "-" => items.push(value),
                    Value::Array(items) => {
                        let index = array_index(&last, items.len())?;
                        if op.op == "add" {
                            items.insert(index, value);
                        } else if index < items.len() {
                            items[index] = value;
                        } else {
                            return Err(FakeDbError::params("patch index out of range"));
                        }
                    }
                    _ => return Err(FakeDbError::params("patch parent is not a container")),
                }
            }
            "remove" => match parent {
                Value::Object(map) => {
                    map.remove(&last);
                }
                Value::Array(items) => {
                    let index = array_index(&last, items.len())?;
                    if index < items.len() {
                        items.remove(index);
                    }
                }
                _ => return Err(FakeDbError::params("patch parent is not a container")),
            },
            other => {
                return Err(FakeDbError::params(format!(
                    "unsupported patch operation '{}'",
                    other
                )))
            }
        }
    }
    Ok(doc)
}

fn split_pointer(path: &str) -> Result<(String, String), FakeDbError> {
    let (parent, last) = path
        .rsplit_once('/')
        .ok_or_else(|| FakeDbError::params(format!("invalid patch path '{}'", path)))?;
    let last = last.replace("~1", "/").replace("~0", "~");
    Ok((parent.to_string(), last))
}

fn array_index(token: &str, len: usize) -> Result<usize, FakeDbError> {
    token
        .parse::<usize>()
        .ok()
        .filter(|index| *index <= len)
        .ok_or_else(|| FakeDbError::params(format!("invalid array index '{}'", token)))
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Top-level field differences between two records, as patch operations.
pub fn diff(before: &Value, after: &Value) -> Vec<PatchOp> {
    let empty = Map::new();
    let before = before.as_object().unwrap_or(&empty);
    let after = after.as_object().unwrap_or(&empty);

    let mut ops = Vec::new();
    for (key, value) in after {
        let path = format!("/{}", escape_pointer(key));
        match before.get(key) {
            None => ops.push(PatchOp::add(path, value.clone())),
            Some(old) if old != value => ops.push(PatchOp::replace(path, value.clone())),
            Some(_) => {}
        }
    }
    for key in before.keys().filter(|key| !after.contains_key(*key)) {
        ops.push(PatchOp::remove(format!("/{}", escape_pointer(key))));
    }
    ops
}
