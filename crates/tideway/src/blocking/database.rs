//! Blocking database handle

use std::sync::Arc;

use bson::{doc, Bson, Document as BsonDocument};
use parking_lot::RwLock;
use tideway_common::{Result, TidewayError};

use super::{
    reply_error, reply_ok, validate_collection_name, Client, Collection, IntoCollectionTarget,
    NAMESPACE_EXISTS, NAMESPACE_NOT_FOUND,
};
use crate::auth::{self, Credential};
use crate::dbref::DbRef;
use crate::manipulator::{ObjectIdInjector, SonManipulator};
use crate::pool::Request;

pub(crate) type ManipulatorList = Arc<RwLock<Vec<Arc<dyn SonManipulator>>>>;

const USERS_COLLECTION: &str = "system.users";

struct DatabaseInner {
    client: Client,
    name: String,
    /// Registration order matters, see `manipulator::fix_incoming`
    manipulators: ManipulatorList,
}

/// Blocking handle on one database
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

/// Names a [`Database`] without owning its manipulator list
///
/// Manipulators registered on a database hold this instead of the database
/// itself, so a database and its manipulators never keep each other alive.
/// The handle keeps the client, which owns no manipulators, so it stays
/// usable after the database it was made from is dropped.
#[derive(Clone)]
pub struct DatabaseHandle {
    client: Client,
    name: String,
}

impl DatabaseHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A fresh handle on the named database, with default manipulators only
    pub fn database(&self) -> Database {
        self.client.database(&self.name)
    }

    /// `current` when it is the same database on the same pool, so its
    /// manipulators apply; otherwise a fresh handle
    pub(crate) fn resolve_against(&self, current: &Database) -> Database {
        if current.name() == self.name && Arc::ptr_eq(current.client().pool(), self.client.pool()) {
            current.clone()
        } else {
            self.database()
        }
    }
}

impl From<&Database> for DatabaseHandle {
    fn from(db: &Database) -> Self {
        DatabaseHandle {
            client: db.client().unpinned(),
            name: db.name().to_string(),
        }
    }
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DatabaseHandle({})", self.name)
    }
}

impl Database {
    /// Handle on `name`. An `ObjectIdInjector` is registered by default.
    pub fn new(client: Client, name: &str) -> Self {
        let default: Arc<dyn SonManipulator> = Arc::new(ObjectIdInjector);
        Self {
            inner: Arc::new(DatabaseInner {
                client,
                name: name.to_string(),
                manipulators: Arc::new(RwLock::new(vec![default])),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.clone(), name)
    }

    /// Same database, with every call pinned to `request`
    ///
    /// The manipulator list is shared with `self`.
    pub fn with_request(&self, request: &Request) -> Database {
        Database {
            inner: Arc::new(DatabaseInner {
                client: self.inner.client.with_request(request),
                name: self.inner.name.clone(),
                manipulators: Arc::clone(&self.inner.manipulators),
            }),
        }
    }

    /// Append a manipulator. Order of registration is significant.
    pub fn add_son_manipulator(&self, manipulator: impl SonManipulator + 'static) {
        tracing::debug!(db = %self.inner.name, manipulator = manipulator.name(), "manipulator added");
        self.inner.manipulators.write().push(Arc::new(manipulator));
    }

    /// Snapshot of the manipulator list
    pub(crate) fn manipulators(&self) -> Vec<Arc<dyn SonManipulator>> {
        self.inner.manipulators.read().clone()
    }

    /// Run a command. A reply with `ok: 0` becomes `OperationFailure`.
    pub fn command(&self, command: BsonDocument) -> Result<BsonDocument> {
        self.command_allowing(command, &[])
    }

    /// Like [`Database::command`], but failures carrying one of `allowed`
    /// codes return the raw reply
    pub fn command_allowing(&self, command: BsonDocument, allowed: &[i32]) -> Result<BsonDocument> {
        let name = &self.inner.name;
        let reply = self
            .inner
            .client
            .with_connection(|sock| sock.run_command(name, command))?;
        if reply_ok(&reply) {
            return Ok(reply);
        }
        let err = reply_error(&reply);
        match err.code() {
            Some(code) if allowed.contains(&code) => Ok(reply),
            _ => Err(err),
        }
    }

    pub fn collection_names(&self) -> Result<Vec<String>> {
        let reply = self.command(doc! { "listCollections": 1 })?;
        let mut names: Vec<String> = super::first_batch(&reply)
            .iter()
            .filter_map(|c| c.get_str("name").ok())
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Create `name` with `options` passed to the server verbatim
    pub fn create_collection(&self, name: &str, options: BsonDocument) -> Result<Collection> {
        validate_collection_name(name)?;
        if self.collection_names()?.iter().any(|n| n == name) {
            return Err(TidewayError::CollectionInvalid(format!(
                "collection {} already exists",
                name
            )));
        }

        let mut command = doc! { "create": name };
        for (key, value) in options {
            command.insert(key, value);
        }
        match self.command(command) {
            Ok(_) => Ok(self.collection(name)),
            Err(e) if e.code() == Some(NAMESPACE_EXISTS) => Err(TidewayError::CollectionInvalid(
                format!("collection {} already exists", name),
            )),
            Err(e) => Err(e),
        }
    }

    /// Drop a collection. Dropping a missing collection is not an error.
    pub fn drop_collection(&self, target: impl IntoCollectionTarget) -> Result<()> {
        let target = target.into_collection_target()?;
        self.command_allowing(doc! { "drop": target.name() }, &[NAMESPACE_NOT_FOUND])?;
        Ok(())
    }

    /// Ask the server to check a collection
    ///
    /// A missing namespace or a reply describing corruption is an
    /// `OperationFailure`.
    pub fn validate_collection(&self, target: impl IntoCollectionTarget) -> Result<BsonDocument> {
        let target = target.into_collection_target()?;
        let name = target.name();
        let reply = self.command(doc! { "validate": name })?;

        if let Ok(result) = reply.get_str("result") {
            let lowered = result.to_lowercase();
            if lowered.contains("exception") || lowered.contains("corrupt") {
                return Err(TidewayError::operation_failure(
                    format!("{} invalid: {}", name, result),
                    None,
                ));
            }
        }
        if let Ok(false) = reply.get_bool("valid") {
            let errors = reply
                .get_array("errors")
                .map(|e| format!("{:?}", e))
                .unwrap_or_default();
            return Err(TidewayError::operation_failure(
                format!("{} invalid: {}", name, errors),
                None,
            ));
        }
        Ok(reply)
    }

    /// Create or update a user in `system.users`
    pub fn add_user(&self, name: &str, password: &str, read_only: bool) -> Result<()> {
        let digest = auth::password_digest(name, password);
        self.collection(USERS_COLLECTION).update(
            doc! { "user": name },
            doc! { "$set": { "pwd": digest, "readOnly": read_only } },
            true,
            false,
        )?;
        Ok(())
    }

    pub fn remove_user(&self, name: &str) -> Result<()> {
        self.collection(USERS_COLLECTION).remove(doc! { "user": name })?;
        Ok(())
    }

    /// Authenticate and remember the credential for later connections
    ///
    /// The nonce handshake runs on one pinned connection, so concurrent
    /// calls never see each other's nonce.
    pub fn authenticate(&self, user: &str, password: &str) -> Result<bool> {
        let credential = Credential::new(user, password);
        let client = &self.inner.client;
        let request = match client.request() {
            Some(request) => request.clone(),
            None => client.start_request()?,
        };

        let name = &self.inner.name;
        request.run(|sock| auth::authenticate_socket(sock, name, &credential))?;
        client.cache_credential(name, credential);
        Ok(true)
    }

    /// Forget the cached credential and log out the connection in use
    ///
    /// Other pooled connections are logged out the next time they are
    /// checked out.
    pub fn logout(&self) -> Result<()> {
        let name = &self.inner.name;
        self.inner.client.forget_credential(name);
        self.inner
            .client
            .with_connection(|sock| auth::logout_socket(sock, name))
    }

    /// Fetch the document a DBRef points to
    pub fn dereference(&self, dbref: &DbRef) -> Result<Option<BsonDocument>> {
        if let Some(db) = &dbref.database {
            if db != &self.inner.name {
                return Err(TidewayError::InvalidArgument(format!(
                    "trying to dereference a DBRef that points to database {} from {}",
                    db, self.inner.name
                )));
            }
        }
        self.collection(&dbref.collection)
            .find_one(doc! { "_id": dbref.id.clone() })
    }

    /// `dereference` for a raw `{$ref, $id}` value
    pub fn dereference_value(&self, value: &Bson) -> Result<Option<BsonDocument>> {
        let dbref = value
            .as_document()
            .and_then(DbRef::from_document)
            .ok_or_else(|| TidewayError::InvalidArgument("value is not a DBRef".to_string()))?;
        self.dereference(&dbref)
    }
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        self.inner.name == other.inner.name
            && self.inner.client.config().endpoint == other.inner.client.config().endpoint
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("client", &self.inner.client)
            .finish()
    }
}
