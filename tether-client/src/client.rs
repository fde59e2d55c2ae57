//! High-level client API.

use crate::config::ConnectionConfig;
use crate::connection::ConnectionOptions;
use crate::error::ClientError;
use crate::query::{QueryResolver, QueryResponse};
use crate::reconnect::{ConnectionState, Reconnector, RequestOptions};
use crate::router::LiveStream;
use crate::session::SessionState;
use crate::transport::{self, Dialer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tether_protocol::{Method, PatchOp};

/// High-level client for a tether-compatible server.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Client {
    inner: Reconnector,
    config: Arc<ConnectionConfig>,
}

impl Client {
    /// Creates a client for the endpoint in `config`. Nothing is dialed until
    /// [`Client::connect`].
    pub fn new(config: ConnectionConfig) -> Self {
        let options = ConnectionOptions::default();
        let dialer = transport::dialer_for(&config, options.codec.name());
        Self::with_options(config, dialer, options)
    }

    /// Creates a client that opens its transports with `dialer`.
    pub fn with_dialer(config: ConnectionConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self::with_options(config, dialer, ConnectionOptions::default())
    }

    /// Creates a client with explicit codec and id generator. The request
    /// timeout is taken from `config`.
    pub fn with_options(
        config: ConnectionConfig,
        dialer: Arc<dyn Dialer>,
        options: ConnectionOptions,
    ) -> Self {
        let options = options.with_request_timeout(config.request_timeout);

        let mut session = SessionState::new();
        session.namespace = config.namespace.clone();
        session.database = config.database.clone();
        session.token = config.token.clone();

        let inner =
            Reconnector::new(dialer, options, config.reconnect.clone()).with_session(session);
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    /// Connects to the server and restores the configured session.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.inner.connect().await
    }

    /// Closes the connection. Pending calls fail and live streams end.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.inner.close().await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state() == ConnectionState::Connected
    }

    /// Snapshot of the session that would be replayed on reconnect.
    pub fn session(&self) -> SessionState {
        self.inner.session()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn reconnector(&self) -> &Reconnector {
        &self.inner
    }

    // =========================================================================
    // Raw requests
    // =========================================================================

    /// Sends any method with positional parameters.
    pub async fn send(&self, method: Method, params: Vec<Value>) -> Result<Value, ClientError> {
        self.inner.send(method, params).await
    }

    pub async fn send_with(
        &self,
        method: Method,
        params: Vec<Value>,
        options: RequestOptions,
    ) -> Result<Value, ClientError> {
        self.inner.send_with(method, params, options).await
    }

    /// Sends any method and decodes the result into `T`.
    pub async fn send_as<T: DeserializeOwned>(
        &self,
        method: Method,
        params: Vec<Value>,
    ) -> Result<T, ClientError> {
        let result = self.send(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Switches namespace and database. `None` keeps the current value.
    pub async fn use_ns_db(
        &self,
        namespace: Option<&str>,
        database: Option<&str>,
    ) -> Result<(), ClientError> {
        self.send(Method::Use, vec![json!(namespace), json!(database)])
            .await?;
        Ok(())
    }

    /// Signs up a record user and returns the issued token.
    pub async fn signup(&self, credentials: impl Serialize) -> Result<String, ClientError> {
        self.send_as(Method::Signup, vec![serde_json::to_value(credentials)?])
            .await
    }

    /// Signs in and returns the issued token.
    pub async fn signin(&self, credentials: impl Serialize) -> Result<String, ClientError> {
        self.send_as(Method::Signin, vec![serde_json::to_value(credentials)?])
            .await
    }

    pub async fn authenticate(&self, token: &str) -> Result<(), ClientError> {
        self.send(Method::Authenticate, vec![json!(token)]).await?;
        Ok(())
    }

    pub async fn invalidate(&self) -> Result<(), ClientError> {
        self.send(Method::Invalidate, vec![]).await?;
        Ok(())
    }

    /// Returns the record of the authenticated user.
    pub async fn info<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        self.send_as(Method::Info, vec![]).await
    }

    pub async fn version(&self) -> Result<String, ClientError> {
        self.send_as(Method::Version, vec![]).await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send(Method::Ping, vec![]).await?;
        Ok(())
    }

    /// Defines a session variable, usable as `$name` in queries.
    pub async fn set(&self, name: &str, value: impl Serialize) -> Result<(), ClientError> {
        self.send(Method::Let, vec![json!(name), serde_json::to_value(value)?])
            .await?;
        Ok(())
    }

    pub async fn unset(&self, name: &str) -> Result<(), ClientError> {
        self.send(Method::Unset, vec![json!(name)]).await?;
        Ok(())
    }

    // =========================================================================
    // Live queries
    // =========================================================================

    /// Starts a live query on `table`. With `diff` the notifications carry
    /// patch operations instead of whole records.
    pub async fn live(&self, table: &str, diff: bool) -> Result<LiveStream, ClientError> {
        self.inner
            .live(vec![json!(table), json!(diff)], RequestOptions::default())
            .await
    }

    /// Streams notifications of a live query started with `LIVE SELECT`.
    pub async fn subscribe(&self, live_id: &str) -> Result<LiveStream, ClientError> {
        self.inner.subscribe(live_id).await
    }

    /// Stops a live query. Killing an unknown or already killed id succeeds.
    pub async fn kill(&self, live_id: &str) -> Result<(), ClientError> {
        self.inner.unsubscribe(live_id);
        self.send(Method::Kill, vec![json!(live_id)]).await?;
        Ok(())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Runs a batch of statements.
    pub async fn query<T: DeserializeOwned>(
        &self,
        sql: &str,
    ) -> Result<QueryResponse<T>, ClientError> {
        let raw = self.send(Method::Query, vec![json!(sql)]).await?;
        QueryResolver::for_query(sql).resolve(raw)
    }

    /// Runs a batch of statements with bound variables.
    pub async fn query_with<T: DeserializeOwned>(
        &self,
        sql: &str,
        vars: impl Serialize,
    ) -> Result<QueryResponse<T>, ClientError> {
        let vars = serde_json::to_value(vars)?;
        let raw = self.send(Method::Query, vec![json!(sql), vars]).await?;
        QueryResolver::for_query(sql).resolve(raw)
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Selects a table or a single record.
    pub async fn select<T: DeserializeOwned>(&self, what: &str) -> Result<T, ClientError> {
        self.send_as(Method::Select, vec![json!(what)]).await
    }

    /// Selects one record; a missing record is [`ClientError::NoRow`].
    pub async fn select_one<T: DeserializeOwned>(&self, thing: &str) -> Result<T, ClientError> {
        match self.send(Method::Select, vec![json!(thing)]).await? {
            Value::Null => Err(ClientError::NoRow(thing.to_string())),
            Value::Array(items) if items.is_empty() => Err(ClientError::NoRow(thing.to_string())),
            value => Ok(serde_json::from_value(value)?),
        }
    }

    pub async fn create<T: DeserializeOwned>(
        &self,
        thing: &str,
        data: impl Serialize,
    ) -> Result<T, ClientError> {
        self.send_as(Method::Create, vec![json!(thing), serde_json::to_value(data)?])
            .await
    }

    pub async fn insert<T: DeserializeOwned>(
        &self,
        table: &str,
        data: impl Serialize,
    ) -> Result<T, ClientError> {
        self.send_as(Method::Insert, vec![json!(table), serde_json::to_value(data)?])
            .await
    }

    /// Replaces the content of a record or of every record of a table.
    pub async fn update<T: DeserializeOwned>(
        &self,
        thing: &str,
        data: impl Serialize,
    ) -> Result<T, ClientError> {
        self.send_as(Method::Update, vec![json!(thing), serde_json::to_value(data)?])
            .await
    }

    /// Like [`Client::update`], creating the record if it does not exist.
    pub async fn upsert<T: DeserializeOwned>(
        &self,
        thing: &str,
        data: impl Serialize,
    ) -> Result<T, ClientError> {
        self.send_as(Method::Upsert, vec![json!(thing), serde_json::to_value(data)?])
            .await
    }

    /// Merges `data` into the existing content.
    pub async fn merge<T: DeserializeOwned>(
        &self,
        thing: &str,
        data: impl Serialize,
    ) -> Result<T, ClientError> {
        self.send_as(Method::Merge, vec![json!(thing), serde_json::to_value(data)?])
            .await
    }

    /// Applies JSON patch operations. With `diff` the server returns the
    /// applied operations instead of the new content.
    pub async fn patch<T: DeserializeOwned>(
        &self,
        thing: &str,
        patches: Vec<PatchOp>,
        diff: bool,
    ) -> Result<T, ClientError> {
        self.send_as(
            Method::Patch,
            vec![json!(thing), serde_json::to_value(patches)?, json!(diff)],
        )
        .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, thing: &str) -> Result<T, ClientError> {
        self.send_as(Method::Delete, vec![json!(thing)]).await
    }

    /// Creates a graph edge `from -> relation -> to`.
    pub async fn relate<T: DeserializeOwned>(
        &self,
        from: &str,
        relation: &str,
        to: &str,
        data: impl Serialize,
    ) -> Result<T, ClientError> {
        self.send_as(
            Method::Relate,
            vec![
                json!(from),
                json!(relation),
                json!(to),
                serde_json::to_value(data)?,
            ],
        )
        .await
    }
}
