//! Blocking driver seam
//!
//! A [`Connector`] opens [`Connection`]s. A connection speaks commands plus
//! the four CRUD primitives and blocks the calling thread for every call.
//! Nothing above this module knows how bytes reach a server.

pub mod matcher;
pub mod memory;

use std::fmt;

use bson::{Bson, Document as BsonDocument};
use tideway_common::Result;

pub use memory::MemoryServer;

/// Fully qualified collection name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

/// Query shape sent with each `query` call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySpec {
    pub filter: BsonDocument,
    pub sort: Option<BsonDocument>,
    pub skip: u64,
    /// `None` returns every match
    pub limit: Option<u64>,
}

impl QuerySpec {
    pub fn new(filter: BsonDocument) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }
}

/// Result of an update call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub upserted_id: Option<Bson>,
}

/// One blocking connection to a server
///
/// `run_command` returns the raw reply, including `ok: 0` replies; turning
/// those into errors is the caller's job. CRUD calls report server-side
/// rejections as `TidewayError::OperationFailure`. `TidewayError::Connection`
/// from any method means the connection itself is no longer usable.
pub trait Connection: Send {
    fn run_command(&mut self, db: &str, command: BsonDocument) -> Result<BsonDocument>;

    fn insert(&mut self, ns: &Namespace, documents: Vec<BsonDocument>) -> Result<()>;

    fn update(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
        multi: bool,
    ) -> Result<UpdateOutcome>;

    fn delete(&mut self, ns: &Namespace, filter: BsonDocument, multi: bool) -> Result<u64>;

    fn query(&mut self, ns: &Namespace, spec: &QuerySpec) -> Result<Vec<BsonDocument>>;
}

/// Opens connections to one endpoint
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Human readable endpoint, used in logs
    fn describe(&self) -> String;
}
