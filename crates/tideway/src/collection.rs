//! Async collection handle

use bson::{Bson, Document as BsonDocument};
use tideway_common::{Result, TidewayError};

use crate::blocking::{self, CollectionTarget, IntoCollectionTarget};
use crate::operation::Operation;
use crate::{Cursor, Database};

/// Async handle on one collection
#[derive(Clone)]
pub struct Collection {
    delegate: blocking::Collection,
    database: Database,
}

impl Collection {
    pub(crate) fn wrap(delegate: blocking::Collection, database: Database) -> Self {
        Self { delegate, database }
    }

    pub fn name(&self) -> &str {
        self.delegate.name()
    }

    pub fn full_name(&self) -> String {
        self.delegate.full_name()
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// The blocking collection this wraps
    pub fn delegate(&self) -> &blocking::Collection {
        &self.delegate
    }

    /// Dotted sub-collection
    pub fn child(&self, name: &str) -> Collection {
        Collection::wrap(self.delegate.child(name), self.database.clone())
    }

    fn dispatch<T, F>(&self, operation: &'static str, call: F) -> Operation<T>
    where
        F: FnOnce(blocking::Collection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let collection = self.delegate.clone();
        self.database
            .client()
            .dispatch(operation, move || call(collection))
    }

    /// Insert one document; resolves to its `_id`
    pub fn insert(&self, document: BsonDocument) -> Operation<Bson> {
        self.dispatch("insert", move |c| c.insert(document))
    }

    pub fn insert_many(&self, documents: Vec<BsonDocument>) -> Operation<Vec<Bson>> {
        if documents.is_empty() {
            return Operation::ready(Err(TidewayError::InvalidArgument(
                "cannot insert an empty list of documents".to_string(),
            )));
        }
        self.dispatch("insert_many", move |c| c.insert_many(documents))
    }

    /// Insert or replace by `_id`; resolves to the document as saved
    pub fn save(&self, document: BsonDocument) -> Operation<BsonDocument> {
        self.dispatch("save", move |c| c.save(document))
    }

    pub fn update(
        &self,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
        multi: bool,
    ) -> Operation<u64> {
        if update.is_empty() {
            return Operation::ready(Err(TidewayError::InvalidArgument(
                "update document must not be empty".to_string(),
            )));
        }
        self.dispatch("update", move |c| c.update(filter, update, upsert, multi))
    }

    pub fn remove(&self, filter: BsonDocument) -> Operation<u64> {
        self.dispatch("remove", move |c| c.remove(filter))
    }

    pub fn find_one(&self, filter: BsonDocument) -> Operation<Option<BsonDocument>> {
        self.dispatch("find_one", move |c| c.find_one(filter))
    }

    /// Lazy cursor; nothing is fetched until the first read
    pub fn find(&self, filter: BsonDocument) -> Cursor {
        Cursor::new(self.delegate.find(filter), self.database.client().clone())
    }

    pub fn count(&self, filter: BsonDocument) -> Operation<u64> {
        self.dispatch("count", move |c| c.count(filter))
    }

    pub fn options(&self) -> Operation<BsonDocument> {
        self.dispatch("options", |c| c.options())
    }

    pub fn drop(&self) -> Operation<()> {
        self.dispatch("drop", |c| c.drop())
    }

    pub fn create_index(&self, keys: BsonDocument, unique: bool) -> Operation<String> {
        if keys.is_empty() {
            return Operation::ready(Err(TidewayError::InvalidArgument(
                "index keys must not be empty".to_string(),
            )));
        }
        self.dispatch("create_index", move |c| c.create_index(keys, unique))
    }

    pub fn drop_index(&self, name: &str) -> Operation<()> {
        let name = name.to_string();
        self.dispatch("drop_index", move |c| c.drop_index(&name))
    }

    pub fn index_information(&self) -> Operation<BsonDocument> {
        self.dispatch("index_information", |c| c.index_information())
    }
}

impl IntoCollectionTarget for Collection {
    fn into_collection_target(self) -> Result<CollectionTarget> {
        Ok(CollectionTarget::Collection(self.delegate))
    }
}

impl IntoCollectionTarget for &Collection {
    fn into_collection_target(self) -> Result<CollectionTarget> {
        Ok(CollectionTarget::Collection(self.delegate.clone()))
    }
}

impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        self.delegate == other.delegate
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Collection").field(&self.delegate).finish()
    }
}
