//! Blocking client

use std::collections::HashMap;
use std::sync::Arc;

use bson::{doc, Document as BsonDocument};
use parking_lot::RwLock;
use tideway_common::Result;

use super::{reply_error, reply_ok, Database};
use crate::auth::{self, Credential};
use crate::config::ClientConfig;
use crate::driver::Connector;
use crate::pool::{ConnectionPool, Request, SocketInfo};

struct ClientInner {
    pool: Arc<ConnectionPool>,
    config: ClientConfig,
    /// Credentials applied to every connection on checkout, keyed by database
    credentials: RwLock<HashMap<String, Credential>>,
}

/// Blocking client for one endpoint
///
/// Cheap to clone. A client bound to a [`Request`] (see [`Client::with_request`])
/// runs every call on the pinned connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    request: Option<Request>,
}

impl Client {
    pub fn new(connector: Arc<dyn Connector>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(connector, config.pool.clone());
        tracing::info!(
            endpoint = %pool.endpoint(),
            max_pool_size = config.pool.max_pool_size,
            "client created"
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                pool,
                config,
                credentials: RwLock::new(HashMap::new()),
            }),
            request: None,
        })
    }

    /// Connect to `memory://<name>` endpoints
    pub fn connect(uri: &str) -> Result<Self> {
        Self::from_config(ClientConfig::from_uri(uri)?)
    }

    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let connector = config.connector()?;
        Self::new(connector, config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    pub fn database(&self, name: &str) -> Database {
        Database::new(self.clone(), name)
    }

    /// Pin one connection for a sequence of calls
    pub fn start_request(&self) -> Result<Request> {
        self.inner.pool.start_request()
    }

    /// A handle on the same client whose calls all run on `request`
    pub fn with_request(&self, request: &Request) -> Client {
        Client {
            inner: Arc::clone(&self.inner),
            request: Some(request.clone()),
        }
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// The same client without any request pin
    pub(crate) fn unpinned(&self) -> Client {
        Client {
            inner: Arc::clone(&self.inner),
            request: None,
        }
    }

    pub fn database_names(&self) -> Result<Vec<String>> {
        let reply = self.admin_command(doc! { "listDatabases": 1 })?;
        let mut names: Vec<String> = reply
            .get_array("databases")
            .map(|dbs| {
                dbs.iter()
                    .filter_map(|d| d.as_document())
                    .filter_map(|d| d.get_str("name").ok())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    pub fn drop_database(&self, name: &str) -> Result<()> {
        let reply = self.with_connection(|sock| sock.run_command(name, doc! { "dropDatabase": 1 }))?;
        if !reply_ok(&reply) {
            return Err(reply_error(&reply));
        }
        Ok(())
    }

    /// `buildinfo` reply
    pub fn server_info(&self) -> Result<BsonDocument> {
        self.admin_command(doc! { "buildinfo": 1 })
    }

    /// Close pooled connections. Later calls fail with a connection error.
    pub fn close(&self) {
        self.inner.pool.close();
    }

    fn admin_command(&self, command: BsonDocument) -> Result<BsonDocument> {
        let reply = self.with_connection(|sock| sock.run_command("admin", command))?;
        if !reply_ok(&reply) {
            return Err(reply_error(&reply));
        }
        Ok(reply)
    }

    /// Run `f` on the pinned connection, or on one checked out for this call
    ///
    /// Cached credentials are brought up to date on the connection first.
    pub(crate) fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut SocketInfo) -> Result<R>,
    ) -> Result<R> {
        match &self.request {
            Some(request) => request.run(|sock| {
                self.check_auth(sock)?;
                f(sock)
            }),
            None => {
                let mut conn = self.inner.pool.checkout()?;
                self.check_auth(&mut *conn)?;
                f(&mut *conn)
            }
        }
    }

    fn check_auth(&self, sock: &mut SocketInfo) -> Result<()> {
        let wanted: Vec<(String, Credential)> = self
            .inner
            .credentials
            .read()
            .iter()
            .map(|(db, cred)| (db.clone(), cred.clone()))
            .collect();

        for (db, user) in sock.authenticated_dbs() {
            let still_cached = wanted.iter().any(|(d, c)| *d == db && c.user == user);
            if !still_cached {
                auth::logout_socket(sock, &db)?;
            }
        }

        for (db, credential) in &wanted {
            if sock.authenticated_user(db) != Some(credential.user.as_str()) {
                auth::authenticate_socket(sock, db, credential)?;
            }
        }
        Ok(())
    }

    pub(crate) fn cache_credential(&self, db: &str, credential: Credential) {
        self.inner.credentials.write().insert(db.to_string(), credential);
    }

    pub(crate) fn forget_credential(&self, db: &str) -> Option<Credential> {
        self.inner.credentials.write().remove(db)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.config.endpoint)
            .field("request", &self.request)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryServer;
    use crate::pool::PoolConfig;

    fn client(server: &MemoryServer) -> Client {
        Client::new(Arc::new(server.clone()), ClientConfig::default()).unwrap()
    }

    #[test]
    fn test_server_info_bits() {
        let client = client(&MemoryServer::new());
        let info = client.server_info().unwrap();
        assert_eq!(info.get_i32("bits").unwrap(), 64);
    }

    #[test]
    fn test_database_names_and_drop() {
        let client = client(&MemoryServer::new());
        client.database("b").create_collection("x", doc! {}).unwrap();
        client.database("a").create_collection("x", doc! {}).unwrap();
        assert_eq!(client.database_names().unwrap(), vec!["a", "b"]);

        client.drop_database("a").unwrap();
        assert_eq!(client.database_names().unwrap(), vec!["b"]);
    }

    #[test]
    fn test_with_request_reuses_pinned_connection() {
        let server = MemoryServer::new();
        let client = client(&server);
        let request = client.start_request().unwrap();
        let pinned = client.with_request(&request);

        for _ in 0..3 {
            pinned.server_info().unwrap();
        }
        assert_eq!(server.connections_opened(), 1);
        assert_eq!(client.pool().stats().active, 1);

        drop(pinned);
        request.end();
        assert_eq!(client.pool().stats().active, 0);
    }

    #[test]
    fn test_closed_client_refuses_work() {
        let client = client(&MemoryServer::new());
        client.close();
        assert!(client.server_info().unwrap_err().is_retryable());
    }

    #[test]
    fn test_new_validates_config() {
        let config = ClientConfig::default().pool(PoolConfig::default().max_pool_size(0));
        assert!(Client::new(Arc::new(MemoryServer::new()), config).is_err());
    }
}
