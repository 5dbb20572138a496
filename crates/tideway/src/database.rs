//! Async database handle

use bson::Document as BsonDocument;
use tideway_common::Result;

use crate::blocking::{self, validate_collection_name, DatabaseHandle, IntoCollectionTarget};
use crate::dbref::DbRef;
use crate::manipulator::SonManipulator;
use crate::operation::Operation;
use crate::pool::Request;
use crate::{Client, Collection};

/// Async handle on one database
#[derive(Clone)]
pub struct Database {
    delegate: blocking::Database,
    client: Client,
}

impl Database {
    pub fn new(client: &Client, name: &str) -> Self {
        Self {
            delegate: client.delegate().database(name),
            client: client.clone(),
        }
    }

    pub fn name(&self) -> &str {
        self.delegate.name()
    }

    /// The blocking database this wraps
    pub fn delegate(&self) -> &blocking::Database {
        &self.delegate
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn collection(&self, name: &str) -> Collection {
        Collection::wrap(self.delegate.collection(name), self.clone())
    }

    /// Same database with every call pinned to `request`
    pub fn with_request(&self, request: &Request) -> Database {
        Database {
            delegate: self.delegate.with_request(request),
            client: self.client.with_request(request),
        }
    }

    fn dispatch<T, F>(&self, operation: &'static str, call: F) -> Operation<T>
    where
        F: FnOnce(blocking::Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.delegate.clone();
        self.client.dispatch(operation, move || call(db))
    }

    /// Run a command. A reply with `ok: 0` resolves to `OperationFailure`.
    pub fn command(&self, command: BsonDocument) -> Operation<BsonDocument> {
        self.dispatch("command", move |db| db.command(command))
    }

    pub fn collection_names(&self) -> Operation<Vec<String>> {
        self.dispatch("collection_names", |db| db.collection_names())
    }

    /// Create a collection. An existing name resolves to `CollectionInvalid`.
    pub fn create_collection(&self, name: &str, options: BsonDocument) -> Operation<Collection> {
        if let Err(e) = validate_collection_name(name) {
            return Operation::ready(Err(e));
        }
        let name = name.to_string();
        let this = self.clone();
        self.dispatch("create_collection", move |db| {
            let created = db.create_collection(&name, options)?;
            Ok(Collection::wrap(created, this))
        })
    }

    /// Drop a collection given by name or handle
    pub fn drop_collection(&self, target: impl IntoCollectionTarget) -> Operation<()> {
        let target = match target.into_collection_target() {
            Ok(target) => target,
            Err(e) => return Operation::ready(Err(e)),
        };
        self.dispatch("drop_collection", move |db| db.drop_collection(target))
    }

    /// Server-side consistency check
    ///
    /// A target that names no collection is rejected before any I/O.
    pub fn validate_collection(&self, target: impl IntoCollectionTarget) -> Operation<BsonDocument> {
        let target = match target.into_collection_target() {
            Ok(target) => target,
            Err(e) => return Operation::ready(Err(e)),
        };
        self.dispatch("validate_collection", move |db| db.validate_collection(target))
    }

    pub fn add_son_manipulator(&self, manipulator: impl SonManipulator + 'static) {
        self.delegate.add_son_manipulator(manipulator);
    }

    pub fn add_user(&self, name: &str, password: &str, read_only: bool) -> Operation<()> {
        let (name, password) = (name.to_string(), password.to_string());
        self.dispatch("add_user", move |db| db.add_user(&name, &password, read_only))
    }

    pub fn remove_user(&self, name: &str) -> Operation<()> {
        let name = name.to_string();
        self.dispatch("remove_user", move |db| db.remove_user(&name))
    }

    /// Authenticate on a pinned connection and cache the credential
    pub fn authenticate(&self, user: &str, password: &str) -> Operation<bool> {
        let (user, password) = (user.to_string(), password.to_string());
        self.dispatch("authenticate", move |db| db.authenticate(&user, &password))
    }

    pub fn logout(&self) -> Operation<()> {
        self.dispatch("logout", |db| db.logout())
    }

    pub fn dereference(&self, dbref: DbRef) -> Operation<Option<BsonDocument>> {
        self.dispatch("dereference", move |db| db.dereference(&dbref))
    }
}

impl From<&Database> for DatabaseHandle {
    fn from(db: &Database) -> Self {
        DatabaseHandle::from(db.delegate())
    }
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        self.delegate == other.delegate
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Database").field(&self.delegate).finish()
    }
}
