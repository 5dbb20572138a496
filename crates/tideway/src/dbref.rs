//! Database references (`{$ref, $id, $db}`)

use bson::{Bson, Document as BsonDocument};

/// Reference to a document in another collection
#[derive(Debug, Clone, PartialEq)]
pub struct DbRef {
    pub collection: String,
    pub id: Bson,
    /// Set only when the reference crosses databases
    pub database: Option<String>,
}

impl DbRef {
    pub fn new(collection: impl Into<String>, id: Bson) -> Self {
        Self {
            collection: collection.into(),
            id,
            database: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn to_document(&self) -> BsonDocument {
        let mut doc = BsonDocument::new();
        doc.insert("$ref", self.collection.as_str());
        doc.insert("$id", self.id.clone());
        if let Some(db) = &self.database {
            doc.insert("$db", db.as_str());
        }
        doc
    }

    /// Parse a reference. Documents without `$ref` and `$id` are not references.
    pub fn from_document(doc: &BsonDocument) -> Option<Self> {
        let collection = doc.get_str("$ref").ok()?;
        let id = doc.get("$id")?;
        Some(Self {
            collection: collection.to_string(),
            id: id.clone(),
            database: doc.get_str("$db").ok().map(str::to_string),
        })
    }
}

impl From<DbRef> for Bson {
    fn from(dbref: DbRef) -> Self {
        Bson::Document(dbref.to_document())
    }
}
