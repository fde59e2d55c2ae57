//! Request handler.
//!
//! Executes one request against the session, the store and the live query
//! registry, and produces its reply.

use crate::auth::Authenticator;
use crate::error::FakeDbError;
use crate::live::LiveRegistry;
use crate::server::Outbound;
use crate::session::Session;
use crate::statement::{self, Statement};
use crate::store::{self, Change, Modify, Scope, Store, Target};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tether_protocol::{
    Method, PatchOp, QueryStatus, RawQueryResult, Reply, Request, NOT_EXECUTED_MESSAGE,
};
use tokio::sync::mpsc;

/// Message reported for statements of a cancelled transaction.
pub const CANCELLED_MESSAGE: &str = "The query was not executed due to a cancelled transaction";

/// Handles requests of every connection.
pub struct CommandHandler {
    auth: Arc<Authenticator>,
    store: Arc<Store>,
    live: Arc<LiveRegistry>,
    auth_required: bool,
    version: String,
}

/// Positional request parameters.
struct Params(Vec<Value>);

impl Params {
    fn value(&self, index: usize) -> Value {
        self.0.get(index).cloned().unwrap_or(Value::Null)
    }

    fn string(&self, index: usize, name: &str) -> Result<String, FakeDbError> {
        match self.0.get(index) {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(FakeDbError::params(format!("expected string {}", name))),
        }
    }

    fn opt_string(&self, index: usize, name: &str) -> Result<Option<String>, FakeDbError> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(FakeDbError::params(format!("expected string or null {}", name))),
        }
    }

    fn target(&self, index: usize, name: &str) -> Result<Target, FakeDbError> {
        Target::parse(&self.string(index, name)?)
    }

    fn flag(&self, index: usize) -> bool {
        self.0.get(index).and_then(Value::as_bool).unwrap_or(false)
    }
}

impl CommandHandler {
    pub fn new(
        auth: Arc<Authenticator>,
        store: Arc<Store>,
        live: Arc<LiveRegistry>,
        auth_required: bool,
        version: String,
    ) -> Self {
        Self {
            auth,
            store,
            live,
            auth_required,
            version,
        }
    }

    /// Handles a request and returns the reply to send.
    pub fn handle(
        &self,
        session: &mut Session,
        outbound: &mpsc::UnboundedSender<Outbound>,
        request: Request,
    ) -> Reply {
        session.record_request();
        let method = request.method;
        match self.dispatch(session, outbound, method, Params(request.params)) {
            Ok(result) => Reply::ok(request.id, result),
            Err(e) => {
                tracing::debug!(conn = session.id, %method, "request failed: {}", e);
                Reply::error(request.id, e.to_reply_error())
            }
        }
    }

    fn dispatch(
        &self,
        session: &mut Session,
        outbound: &mpsc::UnboundedSender<Outbound>,
        method: Method,
        params: Params,
    ) -> Result<Value, FakeDbError> {
        match method {
            Method::Use => {
                if let Some(ns) = params.opt_string(0, "namespace")? {
                    session.namespace = Some(ns);
                }
                if let Some(db) = params.opt_string(1, "database")? {
                    session.database = Some(db);
                }
                Ok(Value::Null)
            }
            Method::Info => Ok(match &session.user {
                Some(user) => json!({ "id": format!("user:{}", user), "name": user }),
                None => Value::Null,
            }),
            Method::Version => Ok(Value::String(self.version.clone())),
            Method::Ping => Ok(Value::Null),
            Method::Signup => {
                let (user, pass) = credentials(&params.value(0))?;
                self.auth.add_user(&user, &pass)?;
                let token = self.auth.issue(&user);
                session.sign_in(user, token.clone());
                Ok(Value::String(token))
            }
            Method::Signin => {
                let (user, pass) = credentials(&params.value(0))?;
                let token = self.auth.signin(&user, &pass)?;
                session.sign_in(user, token.clone());
                Ok(Value::String(token))
            }
            Method::Authenticate => {
                let token = params.string(0, "token")?;
                let user = self.auth.validate(&token).ok_or(FakeDbError::AuthFailed)?;
                session.sign_in(user, token);
                Ok(Value::Null)
            }
            Method::Invalidate => {
                session.sign_out();
                Ok(Value::Null)
            }
            Method::Let => {
                let name = params.string(0, "name")?;
                let name = name.trim_start_matches('$').to_string();
                session.vars.insert(name, params.value(1));
                Ok(Value::Null)
            }
            Method::Unset => {
                let name = params.string(0, "name")?;
                session.vars.remove(name.trim_start_matches('$'));
                Ok(Value::Null)
            }
            Method::Live => {
                let scope = self.data_scope(session)?;
                let table = params.target(0, "table")?;
                if table.key.is_some() {
                    return Err(FakeDbError::params("live queries watch whole tables"));
                }
                let id = self.live.register(
                    session.id,
                    scope,
                    &table.table,
                    params.flag(1),
                    outbound.clone(),
                );
                session.live_ids.insert(id.clone());
                Ok(Value::String(id))
            }
            Method::Kill => {
                let id = params.string(0, "live id")?;
                self.live.kill(session.id, &id);
                session.live_ids.remove(&id);
                Ok(Value::Null)
            }
            Method::Query => {
                let sql = params.string(0, "query")?;
                let vars = match params.value(1) {
                    Value::Null => BTreeMap::new(),
                    Value::Object(map) => map.into_iter().collect(),
                    _ => return Err(FakeDbError::params("query variables must be an object")),
                };
                self.run_query(session, outbound, &sql, vars)
            }
            Method::Select => {
                let scope = self.data_scope(session)?;
                Ok(self.store.select(&scope, &params.target(0, "thing")?))
            }
            Method::Create => {
                let scope = self.data_scope(session)?;
                let target = params.target(0, "thing")?;
                let change = self.store.create(&scope, &target, params.value(1))?;
                let record = change.record();
                self.live.notify(&scope, &[change]);
                Ok(record)
            }
            Method::Insert => {
                let scope = self.data_scope(session)?;
                let table = params.target(0, "table")?;
                let changes = self.store.insert(&scope, &table.table, params.value(1))?;
                let records = changes.iter().map(Change::record).collect();
                self.live.notify(&scope, &changes);
                Ok(Value::Array(records))
            }
            Method::Update | Method::Upsert | Method::Merge | Method::Patch => {
                let scope = self.data_scope(session)?;
                let target = params.target(0, "thing")?;
                let (modify, return_diff) = match method {
                    Method::Merge => (Modify::Merge(params.value(1)), false),
                    Method::Patch => {
                        let ops: Vec<PatchOp> = serde_json::from_value(params.value(1))
                            .map_err(|e| FakeDbError::params(format!("invalid patch: {}", e)))?;
                        (Modify::Patch(ops), params.flag(2))
                    }
                    _ => (Modify::Replace(params.value(1)), false),
                };
                let changes =
                    self.store
                        .modify(&scope, &target, &modify, method == Method::Upsert)?;
                let mut results = Vec::with_capacity(changes.len());
                for change in &changes {
                    results.push(if return_diff {
                        let before = change.before.clone().unwrap_or(Value::Null);
                        serde_json::to_value(store::diff(&before, &change.record()))?
                    } else {
                        change.record()
                    });
                }
                self.live.notify(&scope, &changes);
                Ok(shape(&target, results))
            }
            Method::Delete => {
                let scope = self.data_scope(session)?;
                let target = params.target(0, "thing")?;
                let changes = self.store.delete(&scope, &target);
                let records = changes.iter().map(Change::record).collect();
                self.live.notify(&scope, &changes);
                Ok(shape(&target, records))
            }
            Method::Relate => {
                let scope = self.data_scope(session)?;
                let change = self.store.relate(
                    &scope,
                    &params.target(0, "from")?,
                    &params.target(1, "relation")?,
                    &params.target(2, "to")?,
                    params.value(3),
                )?;
                let record = change.record();
                self.live.notify(&scope, &[change]);
                Ok(record)
            }
        }
    }

    /// Scope for data methods: requires a namespace and database, and a
    /// signed-in user when authentication is required.
    fn data_scope(&self, session: &Session) -> Result<Scope, FakeDbError> {
        if self.auth_required && !session.is_authenticated() {
            return Err(FakeDbError::NotAllowed);
        }
        session.scope()
    }

    fn run_query(
        &self,
        session: &mut Session,
        outbound: &mpsc::UnboundedSender<Outbound>,
        sql: &str,
        bound: BTreeMap<String, Value>,
    ) -> Result<Value, FakeDbError> {
        let statements = statement::parse(sql)?;
        let mut vars = session.vars.clone();
        vars.extend(bound);

        let mut results = Vec::with_capacity(statements.len());
        let mut rest = statements.as_slice();
        while let Some((first, tail)) = rest.split_first() {
            match first {
                Statement::Begin => {
                    let end = tail
                        .iter()
                        .position(|s| matches!(s, Statement::Commit | Statement::Cancel));
                    let (block, commit, remaining) = match end {
                        Some(end) => (
                            &tail[..end],
                            matches!(tail[end], Statement::Commit),
                            &tail[end + 1..],
                        ),
                        // An unterminated transaction is cancelled.
                        None => (tail, false, &tail[tail.len()..]),
                    };
                    self.run_transaction(session, outbound, block, commit, &mut vars, &mut results);
                    rest = remaining;
                }
                // Stray COMMIT and CANCEL are no-ops.
                Statement::Commit | Statement::Cancel => rest = tail,
                statement => {
                    let mut changes = Vec::new();
                    let started = Instant::now();
                    let outcome = self.execute(session, outbound, statement, &mut vars, &mut changes);
                    results.push(raw_result(outcome, started));
                    if let Ok(scope) = session.scope() {
                        self.live.notify(&scope, &changes);
                    }
                    rest = tail;
                }
            }
        }

        Ok(serde_json::to_value(results)?)
    }

    fn run_transaction(
        &self,
        session: &mut Session,
        outbound: &mpsc::UnboundedSender<Outbound>,
        block: &[Statement],
        commit: bool,
        vars: &mut BTreeMap<String, Value>,
        results: &mut Vec<RawQueryResult>,
    ) {
        let scope = session.scope().ok();
        let snapshot = scope.as_ref().map(|scope| self.store.snapshot(scope));
        let first = results.len();
        let mut changes = Vec::new();
        let mut failed = false;

        for statement in block {
            if failed {
                results.push(RawQueryResult::err("0ns", NOT_EXECUTED_MESSAGE));
                continue;
            }
            let started = Instant::now();
            let outcome = self.execute(session, outbound, statement, vars, &mut changes);
            let result = raw_result(outcome, started);
            if result.status == QueryStatus::Err {
                failed = true;
                // Statements that already ran are reported as not executed.
                for earlier in &mut results[first..] {
                    *earlier = RawQueryResult::err(earlier.time.clone(), NOT_EXECUTED_MESSAGE);
                }
            }
            results.push(result);
        }

        if failed || !commit {
            if let Some(snapshot) = snapshot {
                self.store.restore(snapshot);
            }
            if !failed {
                for result in &mut results[first..] {
                    *result = RawQueryResult::err(result.time.clone(), CANCELLED_MESSAGE);
                }
            }
            tracing::debug!(conn = session.id, failed, "transaction rolled back");
            return;
        }

        if let Some(scope) = scope {
            self.live.notify(&scope, &changes);
        }
    }

    /// Executes one statement. Errors are statement-level messages.
    fn execute(
        &self,
        session: &mut Session,
        outbound: &mpsc::UnboundedSender<Outbound>,
        statement: &Statement,
        vars: &mut BTreeMap<String, Value>,
        changes: &mut Vec<Change>,
    ) -> Result<Value, String> {
        match statement {
            Statement::Begin | Statement::Commit | Statement::Cancel => Ok(Value::Null),
            Statement::Return(expr) => Ok(expr.eval(vars)),
            Statement::Throw(expr) => {
                let message = match expr.eval(vars) {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Err(format!("An error occurred: {}", message))
            }
            Statement::Select { what } => {
                let scope = self.data_scope(session).map_err(|e| e.to_string())?;
                Ok(match self.store.select(&scope, what) {
                    Value::Null => json!([]),
                    Value::Array(items) => Value::Array(items),
                    record => json!([record]),
                })
            }
            Statement::Create { what, content } => {
                let scope = self.data_scope(session).map_err(|e| e.to_string())?;
                let content = content
                    .as_ref()
                    .map_or(Value::Null, |expr| expr.eval(vars));
                let change = self
                    .store
                    .create(&scope, what, content)
                    .map_err(|e| e.to_string())?;
                let record = change.record();
                changes.push(change);
                Ok(json!([record]))
            }
            Statement::Delete { what } => {
                let scope = self.data_scope(session).map_err(|e| e.to_string())?;
                changes.extend(self.store.delete(&scope, what));
                Ok(json!([]))
            }
            Statement::Let { name, value } => {
                let value = value.eval(vars);
                vars.insert(name.clone(), value);
                Ok(Value::Null)
            }
            Statement::Live { table, diff } => {
                let scope = self.data_scope(session).map_err(|e| e.to_string())?;
                let id = self
                    .live
                    .register(session.id, scope, table, *diff, outbound.clone());
                session.live_ids.insert(id.clone());
                Ok(Value::String(id))
            }
            Statement::Kill(expr) => {
                let id = match expr.eval(vars) {
                    Value::String(id) => id,
                    other => return Err(format!("Can not execute KILL statement using id '{}'", other)),
                };
                if !self.live.kill(session.id, &id) {
                    return Err(format!("Can not execute KILL statement using id '{}'", id));
                }
                session.live_ids.remove(&id);
                Ok(Value::Null)
            }
        }
    }
}

fn raw_result(outcome: Result<Value, String>, started: Instant) -> RawQueryResult {
    let time = format!("{:?}", started.elapsed());
    match outcome {
        Ok(value) => RawQueryResult::ok(time, value),
        Err(message) => RawQueryResult::err(time, message),
    }
}

/// A single record target yields one value (or `null`), a table an array.
fn shape(target: &Target, mut results: Vec<Value>) -> Value {
    if target.key.is_some() {
        results.pop().unwrap_or(Value::Null)
    } else {
        Value::Array(results)
    }
}

fn credentials(value: &Value) -> Result<(String, String), FakeDbError> {
    let field = |names: [&str; 2]| {
        names
            .iter()
            .find_map(|name| value.get(*name).and_then(Value::as_str))
            .map(str::to_string)
    };
    match (field(["user", "username"]), field(["pass", "password"])) {
        (Some(user), Some(pass)) => Ok((user, pass)),
        _ => Err(FakeDbError::params("credentials need user and pass")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_protocol::{Codec, ErrorCode, JsonCodec};

    struct Fixture {
        handler: CommandHandler,
        session: Session,
        tx: mpsc::UnboundedSender<Outbound>,
        rx: mpsc::UnboundedReceiver<Outbound>,
        live: Arc<LiveRegistry>,
    }

    fn fixture(auth_required: bool) -> Fixture {
        let auth = Arc::new(Authenticator::default());
        auth.add_user("root", "root").unwrap();
        let live = Arc::new(LiveRegistry::new(Arc::new(JsonCodec)));
        let handler = CommandHandler::new(
            auth,
            Arc::new(Store::new()),
            live.clone(),
            auth_required,
            "fake-1.0".into(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        Fixture {
            handler,
            session: Session::new(1),
            tx,
            rx,
            live,
        }
    }

    impl Fixture {
        fn call(&mut self, method: Method, params: Vec<Value>) -> Reply {
            let request = Request::new("1", method).with_params(params);
            self.handler.handle(&mut self.session, &self.tx, request)
        }

        fn ok(&mut self, method: Method, params: Vec<Value>) -> Value {
            let reply = self.call(method, params);
            reply.into_result().unwrap()
        }

        fn err(&mut self, method: Method, params: Vec<Value>) -> ErrorCode {
            self.call(method, params).into_result().unwrap_err().code
        }

        fn with_db(mut self) -> Self {
            self.ok(Method::Use, vec![json!("test"), json!("app")]);
            self
        }

        fn query(&mut self, sql: &str) -> Vec<RawQueryResult> {
            serde_json::from_value(self.ok(Method::Query, vec![json!(sql)])).unwrap()
        }
    }

    #[test]
    fn test_session_methods() {
        let mut f = fixture(false);
        assert_eq!(f.ok(Method::Ping, vec![]), Value::Null);
        assert_eq!(f.ok(Method::Version, vec![]), json!("fake-1.0"));
        assert_eq!(f.ok(Method::Info, vec![]), Value::Null);

        f.ok(Method::Use, vec![json!("test"), json!("app")]);
        f.ok(Method::Use, vec![Value::Null, json!("other")]);
        assert_eq!(f.session.namespace.as_deref(), Some("test"));
        assert_eq!(f.session.database.as_deref(), Some("other"));

        f.ok(Method::Let, vec![json!("$name"), json!("tobie")]);
        assert_eq!(f.session.vars["name"], "tobie");
        f.ok(Method::Unset, vec![json!("name")]);
        assert!(f.session.vars.is_empty());
    }

    #[test]
    fn test_auth_flow() {
        let mut f = fixture(true).with_db();
        assert_eq!(f.err(Method::Select, vec![json!("person")]), ErrorCode::NotAllowed);
        assert_eq!(
            f.err(Method::Signin, vec![json!({"user": "root", "pass": "nope"})]),
            ErrorCode::NotAllowed
        );

        let token = f.ok(Method::Signin, vec![json!({"user": "root", "pass": "root"})]);
        assert!(token.is_string());
        assert_eq!(f.ok(Method::Select, vec![json!("person")]), json!([]));
        assert_eq!(f.ok(Method::Info, vec![])["name"], "root");

        f.ok(Method::Invalidate, vec![]);
        assert_eq!(f.err(Method::Select, vec![json!("person")]), ErrorCode::NotAllowed);

        f.ok(Method::Authenticate, vec![token]);
        assert!(f.session.is_authenticated());
        assert_eq!(
            f.err(Method::Authenticate, vec![json!("forged")]),
            ErrorCode::NotAllowed
        );
    }

    #[test]
    fn test_signup() {
        let mut f = fixture(true);
        let token = f.ok(
            Method::Signup,
            vec![json!({"username": "new", "password": "pw"})],
        );
        assert!(token.is_string());
        assert_eq!(f.session.user.as_deref(), Some("new"));
        assert_eq!(
            f.err(Method::Signup, vec![json!({"user": "new", "pass": "pw"})]),
            ErrorCode::NotAllowed
        );
        assert_eq!(f.err(Method::Signup, vec![json!({})]), ErrorCode::InvalidParams);
    }

    #[test]
    fn test_data_requires_database() {
        let mut f = fixture(false);
        let reply = f.call(Method::Select, vec![json!("person")]);
        let error = reply.into_result().unwrap_err();
        assert_eq!(error.code, ErrorCode::QueryFailed);
        assert_eq!(error.message, "Specify a namespace and database to use");
    }

    #[test]
    fn test_crud() {
        let mut f = fixture(false).with_db();
        let created = f.ok(
            Method::Create,
            vec![json!("person:tobie"), json!({"name": "Tobie"})],
        );
        assert_eq!(created, json!({"id": "person:tobie", "name": "Tobie"}));
        assert_eq!(
            f.err(Method::Create, vec![json!("person:tobie")]),
            ErrorCode::QueryFailed
        );

        let inserted = f.ok(Method::Insert, vec![json!("person"), json!([{"id": "jaime"}])]);
        assert_eq!(inserted, json!([{"id": "person:jaime"}]));

        let merged = f.ok(Method::Merge, vec![json!("person:tobie"), json!({"age": 3})]);
        assert_eq!(merged["age"], 3);
        assert_eq!(merged["name"], "Tobie");

        let updated = f.ok(Method::Update, vec![json!("person:tobie"), json!({"x": 1})]);
        assert_eq!(updated, json!({"id": "person:tobie", "x": 1}));
        assert_eq!(
            f.ok(Method::Update, vec![json!("person:ghost"), json!({})]),
            Value::Null
        );
        assert_eq!(
            f.ok(Method::Upsert, vec![json!("person:ghost"), json!({"y": 2})]),
            json!({"id": "person:ghost", "y": 2})
        );

        let diff = f.ok(
            Method::Patch,
            vec![
                json!("person:tobie"),
                json!([{"op": "replace", "path": "/x", "value": 5}]),
                json!(true),
            ],
        );
        assert_eq!(diff, json!([{"op": "replace", "path": "/x", "value": 5}]));

        let all = f.ok(Method::Select, vec![json!("person")]);
        assert_eq!(all.as_array().unwrap().len(), 3);
        assert_eq!(f.ok(Method::Select, vec![json!("person:none")]), Value::Null);

        let deleted = f.ok(Method::Delete, vec![json!("person:tobie")]);
        assert_eq!(deleted["id"], "person:tobie");
        assert_eq!(f.ok(Method::Delete, vec![json!("person:tobie")]), Value::Null);
        assert_eq!(
            f.ok(Method::Delete, vec![json!("person")])
                .as_array()
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_relate() {
        let mut f = fixture(false).with_db();
        let edge = f.ok(
            Method::Relate,
            vec![
                json!("person:tobie"),
                json!("wrote"),
                json!("article:one"),
                Value::Null,
            ],
        );
        assert_eq!(edge["in"], "person:tobie");
        assert_eq!(edge["out"], "article:one");
    }

    #[test]
    fn test_invalid_params() {
        let mut f = fixture(false).with_db();
        assert_eq!(f.err(Method::Select, vec![]), ErrorCode::InvalidParams);
        assert_eq!(f.err(Method::Select, vec![json!(1)]), ErrorCode::InvalidParams);
        assert_eq!(
            f.err(Method::Patch, vec![json!("a:b"), json!("not ops")]),
            ErrorCode::InvalidParams
        );
        assert_eq!(
            f.err(Method::Query, vec![json!("RETURN 1"), json!([1])]),
            ErrorCode::InvalidParams
        );
    }

    #[test]
    fn test_query_statements() {
        let mut f = fixture(false).with_db();
        let results = f.query("CREATE person:a CONTENT {\"n\": 1}; SELECT * FROM person; RETURN 7");
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.status == QueryStatus::Ok));
        assert_eq!(results[0].result, json!([{"id": "person:a", "n": 1}]));
        assert_eq!(results[1].result.as_array().unwrap().len(), 1);
        assert_eq!(results[2].result, json!(7));
        assert!(!results[2].time.is_empty());

        let results = f.query("CREATE person:a; RETURN 1");
        assert_eq!(results[0].status, QueryStatus::Err);
        assert!(results[0].result.as_str().unwrap().contains("already exists"));
        assert_eq!(results[1].status, QueryStatus::Ok);
    }

    #[test]
    fn test_query_vars() {
        let mut f = fixture(false).with_db();
        f.ok(Method::Let, vec![json!("session_var"), json!("s")]);
        let reply = f.ok(
            Method::Query,
            vec![
                json!("RETURN $bound; RETURN $session_var; LET $local = 3; RETURN $local"),
                json!({"bound": "b"}),
            ],
        );
        let results: Vec<RawQueryResult> = serde_json::from_value(reply).unwrap();
        assert_eq!(results[0].result, "b");
        assert_eq!(results[1].result, "s");
        assert_eq!(results[3].result, 3);
        // Query-local variables do not leak into the session.
        assert!(!f.session.vars.contains_key("local"));
    }

    #[test]
    fn test_failed_transaction() {
        let mut f = fixture(false).with_db();
        let results = f.query(
            "BEGIN; CREATE person:a; THROW 'some error'; RETURN 1; COMMIT; RETURN 'after'",
        );
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].result, NOT_EXECUTED_MESSAGE);
        assert_eq!(results[1].status, QueryStatus::Err);
        assert_eq!(results[1].result, "An error occurred: some error");
        assert_eq!(results[2].result, NOT_EXECUTED_MESSAGE);
        assert_eq!(results[3].status, QueryStatus::Ok);

        // The create was rolled back.
        assert_eq!(f.ok(Method::Select, vec![json!("person")]), json!([]));
    }

    #[test]
    fn test_committed_and_cancelled_transactions() {
        let mut f = fixture(false).with_db();
        let results = f.query("BEGIN TRANSACTION; CREATE person:a; COMMIT TRANSACTION");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, QueryStatus::Ok);

        let results = f.query("BEGIN; CREATE person:b; CANCEL");
        assert_eq!(results[0].status, QueryStatus::Err);
        assert_eq!(results[0].result, CANCELLED_MESSAGE);

        let results = f.query("BEGIN; CREATE person:c");
        assert_eq!(results[0].result, CANCELLED_MESSAGE);

        let all = f.ok(Method::Select, vec![json!("person")]);
        assert_eq!(all, json!([{"id": "person:a"}]));
    }

    #[test]
    fn test_query_parse_error() {
        let mut f = fixture(false).with_db();
        assert_eq!(
            f.err(Method::Query, vec![json!("DROP TABLE person")]),
            ErrorCode::QueryFailed
        );
    }

    #[test]
    fn test_live_and_kill() {
        let mut f = fixture(false).with_db();
        let id = f.ok(Method::Live, vec![json!("person")]);
        let id = id.as_str().unwrap().to_string();
        assert!(f.session.live_ids.contains(&id));

        f.ok(Method::Create, vec![json!("person:a")]);
        match f.rx.try_recv().unwrap() {
            Outbound::Frame(bytes) => {
                let envelope = JsonCodec.decode_envelope(&bytes).unwrap();
                assert!(envelope.is_notification());
                let notification = envelope.into_notification().unwrap();
                assert_eq!(notification.subscription_id, id);
            }
            other => panic!("unexpected {:?}", other),
        }

        f.ok(Method::Kill, vec![json!(id.clone())]);
        assert!(f.live.is_empty());
        // Killing again still succeeds.
        assert_eq!(f.ok(Method::Kill, vec![json!(id)]), Value::Null);
    }

    #[test]
    fn test_live_statements() {
        let mut f = fixture(false).with_db();
        let results = f.query("LIVE SELECT DIFF FROM person");
        let id = results[0].result.as_str().unwrap().to_string();
        assert!(f.live.get(&id).unwrap().diff);

        let results = f.query(&format!("KILL '{}'; KILL '{}'", id, id));
        assert_eq!(results[0].status, QueryStatus::Ok);
        assert_eq!(results[1].status, QueryStatus::Err);
    }

    #[test]
    fn test_transaction_defers_notifications() {
        let mut f = fixture(false).with_db();
        f.ok(Method::Live, vec![json!("person")]);

        f.query("BEGIN; CREATE person:a; THROW 'no'; COMMIT");
        assert!(f.rx.try_recv().is_err());

        f.query("BEGIN; CREATE person:b; COMMIT");
        assert!(f.rx.try_recv().is_ok());
    }
}
