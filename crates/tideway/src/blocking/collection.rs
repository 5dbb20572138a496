//! Blocking collection handle

use bson::{doc, Bson, Document as BsonDocument};
use tideway_common::{Result, TidewayError};

use super::{first_batch, reply_count, Cursor, Database, NAMESPACE_NOT_FOUND};
use crate::driver::{Namespace, QuerySpec};
use crate::manipulator::{fix_incoming, fix_outgoing};
use crate::pool::SocketInfo;

/// Check a collection name before it reaches the server
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TidewayError::InvalidArgument(
            "collection names cannot be empty".to_string(),
        ));
    }
    if name.contains('$') && !name.starts_with("oplog.$main") && !name.starts_with("$cmd") {
        return Err(TidewayError::InvalidArgument(format!(
            "collection names must not contain '$': {}",
            name
        )));
    }
    if name.starts_with('.') || name.ends_with('.') {
        return Err(TidewayError::InvalidArgument(format!(
            "collection names must not start or end with '.': {}",
            name
        )));
    }
    if name.contains('\0') {
        return Err(TidewayError::InvalidArgument(
            "collection names must not contain the null character".to_string(),
        ));
    }
    Ok(())
}

/// Blocking handle on one collection
#[derive(Clone)]
pub struct Collection {
    database: Database,
    name: String,
}

impl Collection {
    pub(crate) fn new(database: Database, name: &str) -> Self {
        Self {
            database,
            name: name.to_string(),
        }
    }

    /// Name within the database, e.g. `test.a`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `db.collection`
    pub fn full_name(&self) -> String {
        self.namespace().to_string()
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Dotted sub-collection, `users.child("admins")` is `users.admins`
    pub fn child(&self, name: &str) -> Collection {
        Collection::new(self.database.clone(), &format!("{}.{}", self.name, name))
    }

    pub(crate) fn namespace(&self) -> Namespace {
        Namespace::new(self.database.name(), self.name.as_str())
    }

    pub(crate) fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut SocketInfo) -> Result<R>,
    ) -> Result<R> {
        self.database.client().with_connection(f)
    }

    /// Insert one document and return its `_id`
    pub fn insert(&self, document: BsonDocument) -> Result<Bson> {
        let ids = self.insert_many(vec![document])?;
        ids.into_iter()
            .next()
            .ok_or_else(|| TidewayError::Internal("insert returned no id".to_string()))
    }

    /// Insert documents in order and return their `_id`s
    pub fn insert_many(&self, documents: Vec<BsonDocument>) -> Result<Vec<Bson>> {
        if documents.is_empty() {
            return Err(TidewayError::InvalidArgument(
                "cannot insert an empty list of documents".to_string(),
            ));
        }
        validate_collection_name(&self.name)?;

        let mut ids = Vec::with_capacity(documents.len());
        let mut wire = Vec::with_capacity(documents.len());
        for document in documents {
            let (visible, sent) = fix_incoming(document, self)?;
            ids.push(visible.get("_id").cloned().unwrap_or(Bson::Null));
            wire.push(sent);
        }

        let ns = self.namespace();
        self.with_connection(|sock| sock.insert(&ns, wire))?;
        Ok(ids)
    }

    /// Insert, or replace by `_id`
    ///
    /// Returns the document as the caller should now see it: with its `_id`
    /// and every non-copying manipulator applied.
    pub fn save(&self, document: BsonDocument) -> Result<BsonDocument> {
        validate_collection_name(&self.name)?;
        let (visible, wire) = fix_incoming(document, self)?;
        let ns = self.namespace();

        match wire.get("_id").cloned() {
            Some(id) => {
                self.with_connection(|sock| sock.update(&ns, doc! { "_id": id }, wire, true, false))?;
            }
            None => {
                self.with_connection(|sock| sock.insert(&ns, vec![wire]))?;
            }
        }
        Ok(visible)
    }

    /// Returns the number of documents matched or upserted
    pub fn update(
        &self,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
        multi: bool,
    ) -> Result<u64> {
        if update.is_empty() {
            return Err(TidewayError::InvalidArgument(
                "update document must not be empty".to_string(),
            ));
        }
        let ns = self.namespace();
        let outcome = self.with_connection(|sock| sock.update(&ns, filter, update, upsert, multi))?;
        Ok(outcome.matched + u64::from(outcome.upserted_id.is_some()))
    }

    /// Remove every match. An empty filter empties the collection.
    pub fn remove(&self, filter: BsonDocument) -> Result<u64> {
        let ns = self.namespace();
        self.with_connection(|sock| sock.delete(&ns, filter, true))
    }

    pub fn find_one(&self, filter: BsonDocument) -> Result<Option<BsonDocument>> {
        let ns = self.namespace();
        let spec = QuerySpec {
            limit: Some(1),
            ..QuerySpec::new(filter)
        };
        let found = self.with_connection(|sock| sock.query(&ns, &spec))?;
        found
            .into_iter()
            .next()
            .map(|doc| fix_outgoing(doc, self))
            .transpose()
    }

    /// Lazy cursor over every match. No I/O happens until the first read.
    pub fn find(&self, filter: BsonDocument) -> Cursor {
        Cursor::new(self.clone(), filter)
    }

    pub fn count(&self, filter: BsonDocument) -> Result<u64> {
        let reply = self
            .database
            .command(doc! { "count": self.name.as_str(), "query": filter })?;
        Ok(reply_count(&reply, "n"))
    }

    /// Creation options, without the `create` key. Empty when the
    /// collection does not exist.
    pub fn options(&self) -> Result<BsonDocument> {
        let reply = self.database.command(doc! {
            "listCollections": 1,
            "filter": { "name": self.name.as_str() },
        })?;
        let mut options = first_batch(&reply)
            .into_iter()
            .next()
            .and_then(|info| info.get_document("options").ok().cloned())
            .unwrap_or_default();
        options.remove("create");
        Ok(options)
    }

    pub fn drop(&self) -> Result<()> {
        self.database.drop_collection(self)
    }

    /// Create an index on `keys` and return its generated name
    pub fn create_index(&self, keys: BsonDocument, unique: bool) -> Result<String> {
        if keys.is_empty() {
            return Err(TidewayError::InvalidArgument(
                "index keys must not be empty".to_string(),
            ));
        }
        let name = index_name(&keys);
        let mut index = doc! { "key": keys, "name": name.as_str() };
        if unique {
            index.insert("unique", true);
        }
        self.database.command(doc! {
            "createIndexes": self.name.as_str(),
            "indexes": [index],
        })?;
        Ok(name)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.database.command(doc! {
            "dropIndexes": self.name.as_str(),
            "index": name,
        })?;
        Ok(())
    }

    /// Index name to `{key, unique?}`
    pub fn index_information(&self) -> Result<BsonDocument> {
        let reply = self
            .database
            .command_allowing(doc! { "listIndexes": self.name.as_str() }, &[NAMESPACE_NOT_FOUND])?;

        let mut info = BsonDocument::new();
        for index in first_batch(&reply) {
            let Ok(name) = index.get_str("name") else {
                continue;
            };
            let mut entry = BsonDocument::new();
            if let Ok(key) = index.get_document("key") {
                entry.insert("key", key.clone());
            }
            if let Ok(unique) = index.get_bool("unique") {
                entry.insert("unique", unique);
            }
            info.insert(name, entry);
        }
        Ok(info)
    }
}

/// `{a: 1, b: -1}` becomes `a_1_b_-1`
fn index_name(keys: &BsonDocument) -> String {
    keys.iter()
        .map(|(field, direction)| {
            let direction = match direction {
                Bson::Int32(v) => v.to_string(),
                Bson::Int64(v) => v.to_string(),
                Bson::Double(v) => (*v as i64).to_string(),
                Bson::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{}_{}", field, direction)
        })
        .collect::<Vec<_>>()
        .join("_")
}

impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.database == other.database
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("full_name", &self.full_name())
            .finish()
    }
}

/// Collection given by name or by handle
#[derive(Debug, Clone)]
pub enum CollectionTarget {
    Name(String),
    Collection(Collection),
}

impl CollectionTarget {
    pub fn name(&self) -> &str {
        match self {
            CollectionTarget::Name(name) => name,
            CollectionTarget::Collection(collection) => collection.name(),
        }
    }
}

/// Anything that can name a collection
///
/// Values that cannot (a non-string BSON value, `None`) fail with
/// `InvalidArgument` before any I/O.
pub trait IntoCollectionTarget {
    fn into_collection_target(self) -> Result<CollectionTarget>;
}

fn not_a_collection(found: &str) -> TidewayError {
    TidewayError::InvalidArgument(format!(
        "name_or_collection must be a string or a Collection, not {}",
        found
    ))
}

impl IntoCollectionTarget for CollectionTarget {
    fn into_collection_target(self) -> Result<CollectionTarget> {
        Ok(self)
    }
}

impl IntoCollectionTarget for &str {
    fn into_collection_target(self) -> Result<CollectionTarget> {
        Ok(CollectionTarget::Name(self.to_string()))
    }
}

impl IntoCollectionTarget for String {
    fn into_collection_target(self) -> Result<CollectionTarget> {
        Ok(CollectionTarget::Name(self))
    }
}

impl IntoCollectionTarget for &String {
    fn into_collection_target(self) -> Result<CollectionTarget> {
        Ok(CollectionTarget::Name(self.clone()))
    }
}

impl IntoCollectionTarget for Collection {
    fn into_collection_target(self) -> Result<CollectionTarget> {
        Ok(CollectionTarget::Collection(self))
    }
}

impl IntoCollectionTarget for &Collection {
    fn into_collection_target(self) -> Result<CollectionTarget> {
        Ok(CollectionTarget::Collection(self.clone()))
    }
}

impl IntoCollectionTarget for Bson {
    fn into_collection_target(self) -> Result<CollectionTarget> {
        match self {
            Bson::String(name) => Ok(CollectionTarget::Name(name)),
            other => Err(not_a_collection(&format!("{:?}", other.element_type()))),
        }
    }
}

impl IntoCollectionTarget for &Bson {
    fn into_collection_target(self) -> Result<CollectionTarget> {
        self.clone().into_collection_target()
    }
}

impl<T: IntoCollectionTarget> IntoCollectionTarget for Option<T> {
    fn into_collection_target(self) -> Result<CollectionTarget> {
        match self {
            Some(target) => target.into_collection_target(),
            None => Err(not_a_collection("None")),
        }
    }
}
