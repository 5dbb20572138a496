//! Connection pooling with request pinning
//!
//! Provides a thread-safe connection pool with:
//! - A hard cap on open connections
//! - Idle connection expiry
//! - An optional bounded wait when the pool is exhausted
//! - RAII guards that return connections on drop
//! - `Request`, which pins one connection to a sequence of operations
//!
//! Checkouts happen on executor worker threads, so the pool blocks with a
//! condition variable instead of awaiting.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::Document as BsonDocument;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tideway_common::{Result, TidewayError};
use tokio::sync::watch;

use crate::driver::{Connection, Connector, Namespace, QuerySpec, UpdateOutcome};

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum connections open at once, idle and checked out together
    pub max_pool_size: usize,
    /// Close idle connections unused for this long (default: never)
    pub max_idle_time: Option<Duration>,
    /// How long a checkout waits for a free connection.
    /// `None` fails immediately when the pool is exhausted.
    pub wait_queue_timeout: Option<Duration>,
    /// Application name, reported in logs
    pub app_name: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 100,
            max_idle_time: None,
            wait_queue_timeout: Some(Duration::from_secs(10)),
            app_name: Some("tideway".to_string()),
        }
    }
}

impl PoolConfig {
    /// Set maximum pool size
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set idle expiry
    pub fn max_idle_time(mut self, idle: Option<Duration>) -> Self {
        self.max_idle_time = idle;
        self
    }

    /// Set checkout wait; `None` means fail fast
    pub fn wait_queue_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_queue_timeout = timeout;
        self
    }

    /// Set application name
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    pub max_size: usize,
    /// Connections opened over the pool's lifetime
    pub created: u64,
}

/// One open connection plus the per-connection state the client tracks
pub struct SocketInfo {
    id: u64,
    connection: Box<dyn Connection>,
    /// db name -> authenticated user
    authenticated: HashMap<String, String>,
    last_used: Instant,
    broken: bool,
}

impl SocketInfo {
    fn new(id: u64, connection: Box<dyn Connection>) -> Self {
        Self {
            id,
            connection,
            authenticated: HashMap::new(),
            last_used: Instant::now(),
            broken: false,
        }
    }

    /// Pool-unique connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Discard this connection instead of returning it to the pool
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn authenticated_user(&self, db: &str) -> Option<&str> {
        self.authenticated.get(db).map(String::as_str)
    }

    pub(crate) fn authenticated_dbs(&self) -> Vec<(String, String)> {
        self.authenticated
            .iter()
            .map(|(db, user)| (db.clone(), user.clone()))
            .collect()
    }

    pub(crate) fn mark_authenticated(&mut self, db: &str, user: &str) {
        self.authenticated.insert(db.to_string(), user.to_string());
    }

    pub(crate) fn mark_logged_out(&mut self, db: &str) {
        self.authenticated.remove(db);
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(TidewayError::Connection(reason)) = &result {
            tracing::warn!(connection_id = self.id, reason = %reason, "connection failed");
            self.broken = true;
        }
        result
    }

    pub fn run_command(&mut self, db: &str, command: BsonDocument) -> Result<BsonDocument> {
        let result = self.connection.run_command(db, command);
        self.track(result)
    }

    pub fn insert(&mut self, ns: &Namespace, documents: Vec<BsonDocument>) -> Result<()> {
        let result = self.connection.insert(ns, documents);
        self.track(result)
    }

    pub fn update(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
        multi: bool,
    ) -> Result<UpdateOutcome> {
        let result = self.connection.update(ns, filter, update, upsert, multi);
        self.track(result)
    }

    pub fn delete(&mut self, ns: &Namespace, filter: BsonDocument, multi: bool) -> Result<u64> {
        let result = self.connection.delete(ns, filter, multi);
        self.track(result)
    }

    pub fn query(&mut self, ns: &Namespace, spec: &QuerySpec) -> Result<Vec<BsonDocument>> {
        let result = self.connection.query(ns, spec);
        self.track(result)
    }
}

impl std::fmt::Debug for SocketInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketInfo")
            .field("id", &self.id)
            .field("authenticated", &self.authenticated)
            .field("broken", &self.broken)
            .finish()
    }
}

struct PoolState {
    idle: VecDeque<SocketInfo>,
    active: usize,
    created: u64,
    closed: bool,
}

/// Connection pool over a [`Connector`]
///
/// Use `Arc<ConnectionPool>` for sharing across threads.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Create a new pool. No connection is opened until the first checkout.
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            connector,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: 0,
                created: 0,
                closed: false,
            }),
            available: Condvar::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn endpoint(&self) -> String {
        self.connector.describe()
    }

    fn prune_idle(&self, state: &mut PoolState) {
        if let Some(max_idle) = self.config.max_idle_time {
            let now = Instant::now();
            state
                .idle
                .retain(|sock| now.duration_since(sock.last_used) <= max_idle);
        }
    }

    fn exhausted(&self) -> TidewayError {
        TidewayError::ResourceExhausted(format!(
            "connection pool for {} exhausted ({} connections in use)",
            self.connector.describe(),
            self.config.max_pool_size
        ))
    }

    /// Get a connection from the pool
    ///
    /// This method will:
    /// 1. Reuse an idle connection
    /// 2. Open a new connection if the pool is below `max_pool_size`
    /// 3. Wait up to `wait_queue_timeout` for a connection to come back
    /// 4. Return `Err(TidewayError::ResourceExhausted)` otherwise
    pub fn checkout(self: &Arc<Self>) -> Result<PooledConnection> {
        let deadline = self.config.wait_queue_timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(TidewayError::Connection("connection pool closed".to_string()));
            }

            self.prune_idle(&mut state);

            if let Some(sock) = state.idle.pop_back() {
                state.active += 1;
                tracing::debug!(connection_id = sock.id, "reusing pooled connection");
                return Ok(PooledConnection {
                    sock: Some(sock),
                    pool: Arc::clone(self),
                });
            }

            if state.active + state.idle.len() < self.config.max_pool_size {
                // Reserve the slot before connecting without the lock held
                state.active += 1;
                drop(state);
                return self.open_connection();
            }

            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    let _ = self.available.wait_until(&mut state, deadline);
                }
                _ => {
                    tracing::warn!(
                        max_pool_size = self.config.max_pool_size,
                        "connection pool exhausted"
                    );
                    return Err(self.exhausted());
                }
            }
        }
    }

    fn open_connection(self: &Arc<Self>) -> Result<PooledConnection> {
        match self.connector.connect() {
            Ok(connection) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.state.lock().created += 1;
                tracing::debug!(
                    connection_id = id,
                    endpoint = %self.connector.describe(),
                    "opened connection"
                );
                Ok(PooledConnection {
                    sock: Some(SocketInfo::new(id, connection)),
                    pool: Arc::clone(self),
                })
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.active = state.active.saturating_sub(1);
                self.available.notify_one();
                Err(e)
            }
        }
    }

    /// Return a connection to the pool
    fn release(&self, mut sock: SocketInfo) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);

        if state.closed || sock.broken {
            tracing::debug!(connection_id = sock.id, "discarding connection");
        } else {
            tracing::debug!(connection_id = sock.id, "connection returned to pool");
            sock.last_used = Instant::now();
            state.idle.push_back(sock);
        }
        drop(state);
        self.available.notify_one();
    }

    /// Check out one connection and pin it for a sequence of operations
    pub fn start_request(self: &Arc<Self>) -> Result<Request> {
        let conn = self.checkout()?;
        tracing::debug!(connection_id = conn.id(), "request started");
        Ok(Request {
            inner: Arc::new(RequestInner {
                connection_id: conn.id(),
                conn: Mutex::new(conn),
                next_ticket: AtomicU64::new(0),
                serving: watch::channel(TurnState::default()).0,
            }),
        })
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            active: state.active,
            max_size: self.config.max_pool_size,
            created: state.created,
        }
    }

    /// Close idle connections and refuse further checkouts.
    /// Checked-out connections are discarded as they come back.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let dropped = state.idle.len();
        state.idle.clear();
        drop(state);
        self.available.notify_all();
        tracing::info!(closed_idle = dropped, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// RAII guard for a checked-out connection
///
/// The connection is returned to the pool when dropped.
pub struct PooledConnection {
    sock: Option<SocketInfo>,
    pool: Arc<ConnectionPool>,
}

impl Deref for PooledConnection {
    type Target = SocketInfo;

    fn deref(&self) -> &SocketInfo {
        self.sock.as_ref().expect("socket already released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut SocketInfo {
        self.sock.as_mut().expect("socket already released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(sock) = self.sock.take() {
            self.pool.release(sock);
        }
    }
}

struct RequestInner {
    connection_id: u64,
    conn: Mutex<PooledConnection>,
    next_ticket: AtomicU64,
    serving: watch::Sender<TurnState>,
}

impl Drop for RequestInner {
    fn drop(&mut self) {
        tracing::debug!(connection_id = self.connection_id, "request ended");
    }
}

/// Ticket currently served, plus later tickets dropped before their turn
#[derive(Debug, Default)]
struct TurnState {
    current: u64,
    abandoned: BTreeSet<u64>,
}

/// A connection pinned to one logical sequence of operations
///
/// Clones share the pin. Operations run through [`Request::run`] are
/// serialized on the pinned connection, so no other caller's commands are
/// interleaved with them. Async calls additionally take a [`Turn`] when they
/// are issued, which makes them run in issue order. The connection goes back
/// to the pool when the last clone and the last outstanding turn are dropped.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    /// Id of the pinned connection
    pub fn connection_id(&self) -> u64 {
        self.inner.connection_id
    }

    /// Run `f` with exclusive use of the pinned connection
    pub fn run<R>(&self, f: impl FnOnce(&mut SocketInfo) -> Result<R>) -> Result<R> {
        let mut conn = self.inner.conn.lock();
        f(&mut conn)
    }

    /// Reserve the next place in this request's queue
    ///
    /// Must be called on the issuing thread, before the work is handed off.
    pub(crate) fn take_turn(&self) -> Turn {
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::SeqCst);
        Turn {
            inner: Arc::clone(&self.inner),
            ticket,
        }
    }

    /// End this handle's share of the request
    pub fn end(self) {}
}

/// One place in a [`Request`]'s queue
///
/// Dropping the turn passes the connection to the next ticket, whether or
/// not this one ever ran.
pub(crate) struct Turn {
    inner: Arc<RequestInner>,
    ticket: u64,
}

impl Turn {
    /// Wait until every earlier ticket has been dropped
    pub(crate) async fn wait(&self) {
        let mut serving = self.inner.serving.subscribe();
        // The sender lives in `inner`, which this turn keeps alive
        let _ = serving.wait_for(|state| state.current == self.ticket).await;
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        let ticket = self.ticket;
        self.inner.serving.send_modify(|state| {
            if state.current == ticket {
                state.current += 1;
                while state.abandoned.remove(&state.current) {
                    state.current += 1;
                }
            } else if ticket > state.current {
                state.abandoned.insert(ticket);
            }
        });
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("connection_id", &self.inner.connection_id)
            .finish()
    }
}
