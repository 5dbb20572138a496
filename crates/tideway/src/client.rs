//! Async client

use std::sync::Arc;

use bson::Document as BsonDocument;
use tideway_common::Result;

use crate::blocking;
use crate::config::ClientConfig;
use crate::driver::Connector;
use crate::operation::{Dispatcher, Operation};
use crate::pool::{PoolStats, Request};
use crate::Database;

/// Async client for one endpoint
///
/// Every I/O method returns an [`Operation`] and runs the blocking call on
/// the client's executor. Cheap to clone; clones share the pool, the
/// executor and the credential cache.
#[derive(Clone)]
pub struct Client {
    delegate: blocking::Client,
    dispatcher: Dispatcher,
}

impl Client {
    /// Connect to a `memory://<name>` endpoint
    ///
    /// ```no_run
    /// # async fn demo() -> tideway::Result<()> {
    /// let client = tideway::Client::connect("memory://default?maxPoolSize=10")?;
    /// let db = client.database("app");
    /// let names = db.collection_names().await?;
    /// # Ok(()) }
    /// ```
    pub fn connect(uri: &str) -> Result<Self> {
        Self::from_config(ClientConfig::from_uri(uri)?)
    }

    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let dispatcher = Dispatcher::new(config.max_workers);
        Ok(Self {
            delegate: blocking::Client::from_config(config)?,
            dispatcher,
        })
    }

    pub fn new(connector: Arc<dyn Connector>, config: ClientConfig) -> Result<Self> {
        let dispatcher = Dispatcher::new(config.max_workers);
        Ok(Self {
            delegate: blocking::Client::new(connector, config)?,
            dispatcher,
        })
    }

    /// The blocking client this wraps
    pub fn delegate(&self) -> &blocking::Client {
        &self.delegate
    }

    /// Run `call` on the executor. Calls on a client bound to a request run
    /// in the order they are issued.
    pub(crate) fn dispatch<T, F>(&self, operation: &'static str, call: F) -> Operation<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.dispatcher
            .dispatch_on(operation, self.delegate.request(), call)
    }

    pub fn config(&self) -> &ClientConfig {
        self.delegate.config()
    }

    pub fn database(&self, name: &str) -> Database {
        Database::new(self, name)
    }

    pub fn database_names(&self) -> Operation<Vec<String>> {
        let client = self.delegate.clone();
        self.dispatch("database_names", move || client.database_names())
    }

    pub fn drop_database(&self, name: &str) -> Operation<()> {
        let client = self.delegate.clone();
        let name = name.to_string();
        self.dispatch("drop_database", move || client.drop_database(&name))
    }

    pub fn server_info(&self) -> Operation<BsonDocument> {
        let client = self.delegate.clone();
        self.dispatch("server_info", move || client.server_info())
    }

    /// Pin one connection. Checking out may block, so this runs on the
    /// executor like any other call.
    pub fn start_request(&self) -> Operation<Request> {
        let client = self.delegate.clone();
        self.dispatcher
            .dispatch("start_request", move || client.start_request())
    }

    /// A handle whose calls all run on `request`
    pub fn with_request(&self, request: &Request) -> Client {
        Client {
            delegate: self.delegate.with_request(request),
            dispatcher: self.dispatcher.clone(),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.delegate.pool().stats()
    }

    pub fn max_workers(&self) -> usize {
        self.dispatcher.executor().max_workers()
    }

    /// Close the pool and stop the executor
    ///
    /// Calls already running finish; later calls fail.
    pub fn close(&self) {
        self.delegate.close();
        self.dispatcher.executor().shutdown();
        tracing::info!(endpoint = %self.delegate.config().endpoint, "client closed");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("delegate", &self.delegate)
            .field("max_workers", &self.max_workers())
            .finish()
    }
}
