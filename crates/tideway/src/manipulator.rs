//! Document manipulators
//!
//! A manipulator rewrites documents on their way to the server (incoming)
//! and back (outgoing). Manipulators that do not copy shape what the caller
//! sees after a save. Copying manipulators only shape what is stored.
//!
//! Incoming order: non-copying manipulators in registration order, then
//! copying ones in registration order. Outgoing runs the exact reverse:
//! copying manipulators last-registered first, then non-copying ones
//! last-registered first.

use std::sync::Arc;

use bson::{oid::ObjectId, Bson, Document as BsonDocument};
use tideway_common::Result;

use crate::blocking::{Collection, Database, DatabaseHandle};
use crate::dbref::DbRef;

/// Transform pair applied on save and on find
pub trait SonManipulator: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// True if incoming transforms must not be visible to the caller
    fn will_copy(&self) -> bool {
        false
    }

    fn transform_incoming(&self, son: BsonDocument, _collection: &Collection) -> Result<BsonDocument> {
        Ok(son)
    }

    fn transform_outgoing(&self, son: BsonDocument, _collection: &Collection) -> Result<BsonDocument> {
        Ok(son)
    }
}

/// Adds an `_id` to documents that lack one
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectIdInjector;

impl SonManipulator for ObjectIdInjector {
    fn name(&self) -> &str {
        "ObjectIdInjector"
    }

    fn transform_incoming(&self, mut son: BsonDocument, _collection: &Collection) -> Result<BsonDocument> {
        if !son.contains_key("_id") {
            son.insert("_id", ObjectId::new());
        }
        Ok(son)
    }
}

/// Records the collection name in `_ns`
#[derive(Debug, Clone, Copy, Default)]
pub struct NamespaceInjector;

impl SonManipulator for NamespaceInjector {
    fn name(&self) -> &str {
        "NamespaceInjector"
    }

    fn transform_incoming(&self, mut son: BsonDocument, collection: &Collection) -> Result<BsonDocument> {
        son.insert("_ns", collection.name());
        Ok(son)
    }
}

/// Stores embedded documents as references and resolves them on read
///
/// An embedded document is replaced when it carries both `_id` and `_ns`
/// (see [`NamespaceInjector`]). Reads follow references recursively, so a
/// reference always shows the current state of the target document.
#[derive(Debug, Clone)]
pub struct AutoReference {
    database: DatabaseHandle,
}

impl AutoReference {
    pub fn new(database: impl Into<DatabaseHandle>) -> Self {
        Self {
            database: database.into(),
        }
    }

    fn to_reference(value: Bson) -> Bson {
        match value {
            Bson::Document(doc) => match (doc.get("_ns"), doc.get("_id")) {
                (Some(Bson::String(ns)), Some(id)) => {
                    DbRef::new(ns.as_str(), Self::to_reference(id.clone())).into()
                }
                _ => Bson::Document(Self::references_in(doc)),
            },
            Bson::Array(items) => Bson::Array(items.into_iter().map(Self::to_reference).collect()),
            other => other,
        }
    }

    fn references_in(doc: BsonDocument) -> BsonDocument {
        doc.into_iter()
            .map(|(k, v)| (k, Self::to_reference(v)))
            .collect()
    }

    fn resolve(value: Bson, db: &Database) -> Result<Bson> {
        match value {
            Bson::Document(doc) => match DbRef::from_document(&doc) {
                Some(dbref) => Ok(db.dereference(&dbref)?.map(Bson::Document).unwrap_or(Bson::Null)),
                None => Ok(Bson::Document(Self::resolve_in(doc, db)?)),
            },
            Bson::Array(items) => items
                .into_iter()
                .map(|v| Self::resolve(v, db))
                .collect::<Result<Vec<_>>>()
                .map(Bson::Array),
            other => Ok(other),
        }
    }

    fn resolve_in(doc: BsonDocument, db: &Database) -> Result<BsonDocument> {
        doc.into_iter()
            .map(|(k, v)| Ok((k, Self::resolve(v, db)?)))
            .collect()
    }
}

impl SonManipulator for AutoReference {
    fn name(&self) -> &str {
        "AutoReference"
    }

    fn will_copy(&self) -> bool {
        true
    }

    fn transform_incoming(&self, son: BsonDocument, _collection: &Collection) -> Result<BsonDocument> {
        Ok(Self::references_in(son))
    }

    fn transform_outgoing(&self, son: BsonDocument, collection: &Collection) -> Result<BsonDocument> {
        // Reading through the collection's own database keeps nested
        // references resolving with the same manipulators
        let db = self.database.resolve_against(collection.database());
        Self::resolve_in(son, &db)
    }
}

/// Apply incoming manipulators
///
/// Returns the document the caller should see and the document to send.
pub(crate) fn fix_incoming(
    son: BsonDocument,
    collection: &Collection,
) -> Result<(BsonDocument, BsonDocument)> {
    let manipulators = collection.database().manipulators();

    let mut visible = son;
    for m in manipulators.iter().filter(|m| !m.will_copy()) {
        visible = m.transform_incoming(visible, collection)?;
    }

    let mut wire = visible.clone();
    for m in manipulators.iter().filter(|m| m.will_copy()) {
        wire = m.transform_incoming(wire, collection)?;
    }
    Ok((visible, wire))
}

/// Apply outgoing manipulators to one document read from the server
pub(crate) fn fix_outgoing(son: BsonDocument, collection: &Collection) -> Result<BsonDocument> {
    let manipulators: Vec<Arc<dyn SonManipulator>> = collection.database().manipulators();

    let mut son = son;
    for m in manipulators.iter().rev().filter(|m| m.will_copy()) {
        son = m.transform_outgoing(son, collection)?;
    }
    for m in manipulators.iter().rev().filter(|m| !m.will_copy()) {
        son = m.transform_outgoing(son, collection)?;
    }
    Ok(son)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::Client;
    use crate::config::ClientConfig;
    use crate::driver::MemoryServer;
    use bson::doc;
    use parking_lot::Mutex;

    fn collection() -> Collection {
        let client = Client::new(Arc::new(MemoryServer::new()), ClientConfig::default()).unwrap();
        client.database("manip").collection("things")
    }

    /// Appends its tag to `trail` on every transform
    struct Recorder {
        tag: &'static str,
        copying: bool,
        trail: Arc<Mutex<Vec<String>>>,
    }

    impl SonManipulator for Recorder {
        fn will_copy(&self) -> bool {
            self.copying
        }

        fn transform_incoming(&self, mut son: BsonDocument, _c: &Collection) -> Result<BsonDocument> {
            self.trail.lock().push(format!("in:{}", self.tag));
            son.insert(self.tag, true);
            Ok(son)
        }

        fn transform_outgoing(&self, son: BsonDocument, _c: &Collection) -> Result<BsonDocument> {
            self.trail.lock().push(format!("out:{}", self.tag));
            Ok(son)
        }
    }

    #[test]
    fn test_object_id_injector_keeps_existing_id() {
        let coll = collection();
        let out = ObjectIdInjector.transform_incoming(doc! { "_id": 5 }, &coll).unwrap();
        assert_eq!(out, doc! { "_id": 5 });

        let out = ObjectIdInjector.transform_incoming(doc! { "a": 1 }, &coll).unwrap();
        assert!(matches!(out.get("_id"), Some(Bson::ObjectId(_))));
    }

    #[test]
    fn test_namespace_injector() {
        let coll = collection();
        let out = NamespaceInjector.transform_incoming(doc! {}, &coll).unwrap();
        assert_eq!(out.get_str("_ns").unwrap(), "things");
    }

    #[test]
    fn test_copying_manipulators_do_not_leak_into_visible_document() {
        let coll = collection();
        let trail = Arc::new(Mutex::new(Vec::new()));
        let db = coll.database();
        db.add_son_manipulator(Recorder { tag: "copy", copying: true, trail: trail.clone() });
        db.add_son_manipulator(Recorder { tag: "plain", copying: false, trail: trail.clone() });

        let (visible, wire) = fix_incoming(doc! { "x": 1 }, &coll).unwrap();
        assert!(visible.contains_key("plain"));
        assert!(!visible.contains_key("copy"));
        assert!(wire.contains_key("plain") && wire.contains_key("copy"));
    }

    #[test]
    fn test_outgoing_runs_in_reverse_of_incoming() {
        let coll = collection();
        let trail = Arc::new(Mutex::new(Vec::new()));
        let db = coll.database();
        for (tag, copying) in [("c1", true), ("p1", false), ("c2", true), ("p2", false)] {
            db.add_son_manipulator(Recorder { tag, copying, trail: trail.clone() });
        }

        let (_, wire) = fix_incoming(doc! {}, &coll).unwrap();
        fix_outgoing(wire, &coll).unwrap();

        let seen = trail.lock().clone();
        assert_eq!(
            seen,
            vec![
                "in:p1", "in:p2", "in:c1", "in:c2", "out:c2", "out:c1", "out:p2", "out:p1"
            ]
        );
    }

    #[test]
    fn test_auto_reference_incoming_replaces_embedded_documents() {
        let coll = collection();
        let auto = AutoReference::new(coll.database());
        let son = doc! {
            "plain": { "x": 1 },
            "linked": { "_id": 3, "_ns": "people", "name": "x" },
            "many": [ { "_id": 4, "_ns": "people" } ],
        };
        let out = auto.transform_incoming(son, &coll).unwrap();
        assert_eq!(out.get_document("plain").unwrap(), &doc! { "x": 1 });
        assert_eq!(out.get_document("linked").unwrap(), &doc! { "$ref": "people", "$id": 3 });
        let many = out.get_array("many").unwrap();
        assert_eq!(many[0], Bson::Document(doc! { "$ref": "people", "$id": 4 }));
    }

    #[test]
    fn test_auto_reference_outgoing_resolves_and_nulls_missing() {
        let coll = collection();
        let db = coll.database();
        db.collection("people").insert(doc! { "_id": 3, "name": "x" }).unwrap();

        let auto = AutoReference::new(db);
        let son = doc! {
            "found": { "$ref": "people", "$id": 3 },
            "missing": { "$ref": "people", "$id": 99 },
        };
        let out = auto.transform_outgoing(son, &coll).unwrap();
        assert_eq!(out.get_document("found").unwrap(), &doc! { "_id": 3, "name": "x" });
        assert_eq!(out.get("missing"), Some(&Bson::Null));
    }

    #[test]
    fn test_auto_reference_from_temporary_database_resolves_nested() {
        let coll = collection();
        let db = coll.database();
        db.add_son_manipulator(NamespaceInjector);
        db.add_son_manipulator(AutoReference::new(&db.client().database(db.name())));

        let a = db.collection("a");
        let b = db.collection("b");
        let saved_a = a.save(doc! { "_id": 1, "v": "a" }).unwrap();
        let saved_b = b.save(doc! { "_id": 2, "a": saved_a.clone() }).unwrap();
        coll.save(doc! { "_id": 3, "b": saved_b }).unwrap();

        let found = coll.find_one(doc! { "_id": 3 }).unwrap().unwrap();
        let nested = found.get_document("b").unwrap().get_document("a").unwrap();
        assert_eq!(nested, &saved_a);
    }
}
