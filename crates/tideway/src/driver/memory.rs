//! In-process memory backend
//!
//! `MemoryServer` is a blocking, thread-safe document store that answers the
//! command and CRUD surface of [`Connection`]. Clones share one store, and
//! [`MemoryServer::named`] hands out process-wide instances so that
//! `memory://<name>` endpoints resolve to the same data.
//!
//! Per-connection state (the pending nonce and which databases are
//! authenticated) lives on the connection, exactly like a network server.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bson::{doc, oid::ObjectId, Bson, Document as BsonDocument};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tideway_common::{Result, TidewayError};

use super::matcher;
use super::{Connection, Connector, Namespace, QuerySpec, UpdateOutcome};
use crate::auth;

pub const UNAUTHORIZED: i32 = 13;
pub const NAMESPACE_NOT_FOUND: i32 = 26;
pub const INDEX_NOT_FOUND: i32 = 27;
pub const NAMESPACE_EXISTS: i32 = 48;
pub const COMMAND_NOT_FOUND: i32 = 59;
pub const DUPLICATE_KEY: i32 = 11000;

const BAD_VALUE: i32 = 2;
const FAILED_TO_PARSE: i32 = 9;
const INVALID_OPTIONS: i32 = 72;

const USERS_COLLECTION: &str = "system.users";
const ID_INDEX: &str = "_id_";

/// Commands that never require authentication
const OPEN_COMMANDS: &[&str] = &[
    "ping",
    "ismaster",
    "buildinfo",
    "getnonce",
    "authenticate",
    "logout",
];

#[derive(Debug, Default)]
struct CollectionState {
    options: BsonDocument,
    documents: Vec<BsonDocument>,
    indexes: Vec<BsonDocument>,
}

impl CollectionState {
    fn new(ns: &str, options: BsonDocument) -> Self {
        Self {
            options,
            documents: Vec::new(),
            indexes: vec![doc! { "v": 1, "key": { "_id": 1 }, "name": ID_INDEX, "ns": ns }],
        }
    }

    fn capped_max(&self) -> Option<usize> {
        if !self.options.get_bool("capped").unwrap_or(false) {
            return None;
        }
        self.options
            .get("max")
            .and_then(number_as_i64)
            .and_then(|max| usize::try_from(max).ok())
            .filter(|max| *max > 0)
    }

    fn violates_unique(&self, candidate: &BsonDocument, skip: Option<usize>) -> Option<String> {
        let mut keys: Vec<(String, Vec<String>)> = vec![(ID_INDEX.to_string(), vec!["_id".to_string()])];
        for index in &self.indexes {
            if index.get_bool("unique").unwrap_or(false) {
                if let (Ok(name), Ok(key)) = (index.get_str("name"), index.get_document("key")) {
                    keys.push((name.to_string(), key.keys().cloned().collect()));
                }
            }
        }

        for (name, fields) in keys {
            let clash = self.documents.iter().enumerate().any(|(i, existing)| {
                Some(i) != skip
                    && fields.iter().all(|field| {
                        match (matcher::lookup(existing, field), matcher::lookup(candidate, field)) {
                            (Some(a), Some(b)) => matcher::values_equal(a, b),
                            (None, None) => true,
                            _ => false,
                        }
                    })
            });
            if clash {
                return Some(name);
            }
        }
        None
    }
}

#[derive(Debug, Default)]
struct DatabaseState {
    collections: BTreeMap<String, CollectionState>,
}

#[derive(Debug, Default)]
struct ServerState {
    databases: BTreeMap<String, DatabaseState>,
    require_auth: bool,
    refuse_connections: bool,
    latency: Option<Duration>,
    connections_opened: u64,
}

impl ServerState {
    fn collection(&self, ns: &Namespace) -> Option<&CollectionState> {
        self.databases.get(&ns.db)?.collections.get(&ns.collection)
    }

    fn collection_mut(&mut self, ns: &Namespace) -> Option<&mut CollectionState> {
        self.databases.get_mut(&ns.db)?.collections.get_mut(&ns.collection)
    }

    fn collection_or_create(&mut self, ns: &Namespace) -> &mut CollectionState {
        let full_name = ns.to_string();
        self.databases
            .entry(ns.db.clone())
            .or_default()
            .collections
            .entry(ns.collection.clone())
            .or_insert_with(|| CollectionState::new(&full_name, BsonDocument::new()))
    }

    fn any_users(&self) -> bool {
        self.databases.values().any(|db| {
            db.collections
                .get(USERS_COLLECTION)
                .map(|users| !users.documents.is_empty())
                .unwrap_or(false)
        })
    }

    fn user_digest(&self, db: &str, user: &str) -> Option<String> {
        let users = self.databases.get(db)?.collections.get(USERS_COLLECTION)?;
        users
            .documents
            .iter()
            .find(|u| u.get_str("user").ok() == Some(user))
            .and_then(|u| u.get_str("pwd").ok())
            .map(str::to_string)
    }
}

/// Shared in-process document store
#[derive(Clone)]
pub struct MemoryServer {
    name: String,
    state: Arc<Mutex<ServerState>>,
}

static REGISTRY: Lazy<Mutex<HashMap<String, MemoryServer>>> = Lazy::new(|| Mutex::new(HashMap::new()));

impl MemoryServer {
    /// A fresh, private store
    pub fn new() -> Self {
        Self::with_name(format!("anonymous-{}", ObjectId::new().to_hex()))
    }

    fn with_name(name: String) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(ServerState::default())),
        }
    }

    /// Process-wide store registered under `name`, created on first use
    pub fn named(name: &str) -> Self {
        REGISTRY
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Self::with_name(name.to_string()))
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Require authentication once any user exists
    pub fn set_require_auth(&self, require: bool) {
        self.state.lock().require_auth = require;
    }

    /// Make every new connection attempt fail
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Sleep this long inside every call, to imitate network round trips
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Connections opened so far
    pub fn connections_opened(&self) -> u64 {
        self.state.lock().connections_opened
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryServer").field("name", &self.name).finish()
    }
}

impl Connector for MemoryServer {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut state = self.state.lock();
        if state.refuse_connections {
            return Err(TidewayError::Connection(format!(
                "{}: connection refused",
                self.describe()
            )));
        }
        state.connections_opened += 1;
        let id = state.connections_opened;
        drop(state);

        tracing::trace!(server = %self.name, connection = id, "memory connection opened");
        Ok(Box::new(MemoryConnection {
            server: self.clone(),
            nonce: None,
            authenticated: HashSet::new(),
        }))
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }
}

fn ok_reply(mut body: BsonDocument) -> BsonDocument {
    body.insert("ok", 1.0);
    body
}

fn error_reply(message: impl Into<String>, code: i32) -> BsonDocument {
    doc! { "ok": 0.0, "errmsg": message.into(), "code": code }
}

fn number_as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) => Some(*v as i64),
        _ => None,
    }
}

fn number_as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

/// Sum keeping the narrowest type that holds both operands
fn numeric_add(a: &Bson, b: &Bson) -> Option<Bson> {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => Some(
            x.checked_add(*y)
                .map(Bson::Int32)
                .unwrap_or(Bson::Int64(i64::from(*x) + i64::from(*y))),
        ),
        (Bson::Double(_), _) | (_, Bson::Double(_)) => {
            Some(Bson::Double(number_as_f64(a)? + number_as_f64(b)?))
        }
        _ => Some(Bson::Int64(number_as_i64(a)? + number_as_i64(b)?)),
    }
}

fn cursor_reply(ns: String, batch: Vec<BsonDocument>) -> BsonDocument {
    ok_reply(doc! {
        "cursor": {
            "id": 0i64,
            "ns": ns,
            "firstBatch": batch.into_iter().map(Bson::Document).collect::<Vec<_>>(),
        }
    })
}

fn set_path(doc: &mut BsonDocument, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, BsonDocument::new());
            }
            if let Some(Bson::Document(sub)) = doc.get_mut(head) {
                set_path(sub, rest, value);
            }
        }
    }
}

fn unset_path(doc: &mut BsonDocument, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(sub)) = doc.get_mut(head) {
                unset_path(sub, rest);
            }
        }
    }
}

fn is_operator_update(update: &BsonDocument) -> bool {
    !update.is_empty() && update.keys().all(|k| k.starts_with('$'))
}

fn apply_operators(target: &mut BsonDocument, update: &BsonDocument) -> Result<()> {
    for (op, fields) in update {
        let fields = fields.as_document().ok_or_else(|| {
            TidewayError::operation_failure(format!("{} requires a document", op), Some(FAILED_TO_PARSE))
        })?;
        for (path, value) in fields {
            match op.as_str() {
                "$set" => set_path(target, path, value.clone()),
                "$unset" => unset_path(target, path),
                "$inc" => {
                    let current = matcher::lookup(target, path).cloned().unwrap_or(Bson::Int32(0));
                    let sum = numeric_add(&current, value).ok_or_else(|| {
                        TidewayError::operation_failure(
                            format!("cannot $inc non-numeric field {}", path),
                            Some(BAD_VALUE),
                        )
                    })?;
                    set_path(target, path, sum);
                }
                "$push" => {
                    let mut items = match matcher::lookup(target, path) {
                        Some(Bson::Array(items)) => items.clone(),
                        None => Vec::new(),
                        Some(_) => {
                            return Err(TidewayError::operation_failure(
                                format!("cannot $push to non-array field {}", path),
                                Some(BAD_VALUE),
                            ))
                        }
                    };
                    items.push(value.clone());
                    set_path(target, path, Bson::Array(items));
                }
                other => {
                    return Err(TidewayError::operation_failure(
                        format!("unsupported update operator {}", other),
                        Some(FAILED_TO_PARSE),
                    ))
                }
            }
        }
    }
    Ok(())
}

fn with_id_first(doc: BsonDocument, id: Bson) -> BsonDocument {
    let mut out = doc! { "_id": id };
    for (k, v) in doc {
        if k != "_id" {
            out.insert(k, v);
        }
    }
    out
}

struct MemoryConnection {
    server: MemoryServer,
    nonce: Option<String>,
    /// Databases this connection has authenticated against
    authenticated: HashSet<String>,
}

impl MemoryConnection {
    fn pause(&self) {
        let latency = self.server.state.lock().latency;
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }
    }

    fn authorized(&self, state: &ServerState, db: &str) -> bool {
        !state.require_auth
            || !state.any_users()
            || self.authenticated.contains(db)
            || self.authenticated.contains("admin")
    }

    fn check_authorized(&self, state: &ServerState, ns: &Namespace) -> Result<()> {
        if self.authorized(state, &ns.db) {
            Ok(())
        } else {
            Err(TidewayError::operation_failure(
                format!("unauthorized for {}", ns),
                Some(UNAUTHORIZED),
            ))
        }
    }

    fn dispatch(&mut self, state: &mut ServerState, db: &str, command: BsonDocument) -> BsonDocument {
        let Some((name, argument)) = command.iter().next().map(|(k, v)| (k.to_lowercase(), v.clone())) else {
            return error_reply("no command specified", FAILED_TO_PARSE);
        };

        if !OPEN_COMMANDS.contains(&name.as_str()) && !self.authorized(state, db) {
            return error_reply(format!("unauthorized for {} on {}", name, db), UNAUTHORIZED);
        }

        let collection_arg = argument.as_str().map(str::to_string);
        let ns_of = |coll: &str| Namespace::new(db, coll);

        match name.as_str() {
            "ping" => ok_reply(BsonDocument::new()),
            "ismaster" => ok_reply(doc! { "ismaster": true, "maxBsonObjectSize": 16 * 1024 * 1024 }),
            "buildinfo" => ok_reply(doc! {
                "version": "2.4.0",
                "gitVersion": "tideway-memory",
                "bits": 64,
                "debug": false,
                "maxBsonObjectSize": 16 * 1024 * 1024,
            }),
            "getnonce" => {
                let nonce = format!("{:016x}", rand::random::<u64>());
                self.nonce = Some(nonce.clone());
                ok_reply(doc! { "nonce": nonce })
            }
            "authenticate" => self.authenticate(state, db, &command),
            "logout" => {
                self.authenticated.remove(db);
                ok_reply(BsonDocument::new())
            }
            "create" => {
                let Some(coll) = collection_arg else {
                    return error_reply("collection name must be a string", BAD_VALUE);
                };
                let ns = ns_of(&coll);
                if state.collection(&ns).is_some() {
                    return error_reply("collection already exists", NAMESPACE_EXISTS);
                }
                let options: BsonDocument = command
                    .iter()
                    .skip(1)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                state
                    .databases
                    .entry(db.to_string())
                    .or_default()
                    .collections
                    .insert(coll, CollectionState::new(&ns.to_string(), options));
                ok_reply(BsonDocument::new())
            }
            "drop" => {
                let Some(coll) = collection_arg else {
                    return error_reply("collection name must be a string", BAD_VALUE);
                };
                let removed = state
                    .databases
                    .get_mut(db)
                    .and_then(|d| d.collections.remove(&coll));
                match removed {
                    Some(dropped) => ok_reply(doc! {
                        "ns": ns_of(&coll).to_string(),
                        "nIndexesWas": dropped.indexes.len() as i32,
                    }),
                    None => error_reply("ns not found", NAMESPACE_NOT_FOUND),
                }
            }
            "listcollections" => {
                let filter = command.get_document("filter").cloned().unwrap_or_default();
                let batch = state
                    .databases
                    .get(db)
                    .map(|d| {
                        d.collections
                            .iter()
                            .map(|(name, c)| doc! { "name": name.as_str(), "options": c.options.clone() })
                            .filter(|entry| matcher::matches(entry, &filter))
                            .collect()
                    })
                    .unwrap_or_default();
                cursor_reply(format!("{}.$cmd.listCollections", db), batch)
            }
            "validate" => {
                let Some(coll) = collection_arg else {
                    return error_reply("collection name must be a string", BAD_VALUE);
                };
                let ns = ns_of(&coll);
                match state.collection(&ns) {
                    Some(c) => {
                        let mut keys_per_index = BsonDocument::new();
                        for index in &c.indexes {
                            if let Ok(name) = index.get_str("name") {
                                keys_per_index.insert(name, c.documents.len() as i64);
                            }
                        }
                        ok_reply(doc! {
                            "ns": ns.to_string(),
                            "nrecords": c.documents.len() as i64,
                            "nIndexes": c.indexes.len() as i32,
                            "keysPerIndex": keys_per_index,
                            "valid": true,
                            "errors": Vec::<Bson>::new(),
                        })
                    }
                    None => error_reply("ns not found", NAMESPACE_NOT_FOUND),
                }
            }
            "count" => {
                let Some(coll) = collection_arg else {
                    return error_reply("collection name must be a string", BAD_VALUE);
                };
                let query = command.get_document("query").cloned().unwrap_or_default();
                let n = state
                    .collection(&ns_of(&coll))
                    .map(|c| c.documents.iter().filter(|d| matcher::matches(d, &query)).count())
                    .unwrap_or(0);
                ok_reply(doc! { "n": n as i64 })
            }
            "dropdatabase" => {
                state.databases.remove(db);
                self.authenticated.remove(db);
                ok_reply(doc! { "dropped": db })
            }
            "listdatabases" => {
                let databases: Vec<Bson> = state
                    .databases
                    .iter()
                    .map(|(name, d)| {
                        Bson::Document(doc! {
                            "name": name.as_str(),
                            "sizeOnDisk": 0.0,
                            "empty": d.collections.values().all(|c| c.documents.is_empty()),
                        })
                    })
                    .collect();
                ok_reply(doc! { "databases": databases })
            }
            "createindexes" => {
                let Some(coll) = collection_arg else {
                    return error_reply("collection name must be a string", BAD_VALUE);
                };
                let Ok(indexes) = command.get_array("indexes") else {
                    return error_reply("createIndexes requires an indexes array", FAILED_TO_PARSE);
                };
                let ns = ns_of(&coll);
                let created_automatically = state.collection(&ns).is_none();
                let target = state.collection_or_create(&ns);
                let before = target.indexes.len() as i32;
                for spec in indexes.iter().filter_map(Bson::as_document) {
                    let Ok(name) = spec.get_str("name") else {
                        return error_reply("index specification requires a name", FAILED_TO_PARSE);
                    };
                    if !target.indexes.iter().any(|i| i.get_str("name").ok() == Some(name)) {
                        let mut stored = spec.clone();
                        stored.insert("v", 1);
                        stored.insert("ns", ns.to_string());
                        target.indexes.push(stored);
                    }
                }
                ok_reply(doc! {
                    "createdCollectionAutomatically": created_automatically,
                    "numIndexesBefore": before,
                    "numIndexesAfter": target.indexes.len() as i32,
                })
            }
            "dropindexes" => {
                let Some(coll) = collection_arg else {
                    return error_reply("collection name must be a string", BAD_VALUE);
                };
                let index = command.get_str("index").unwrap_or("").to_string();
                let Some(target) = state.collection_mut(&ns_of(&coll)) else {
                    return error_reply("ns not found", NAMESPACE_NOT_FOUND);
                };
                let before = target.indexes.len() as i32;
                if index == "*" {
                    target.indexes.retain(|i| i.get_str("name").ok() == Some(ID_INDEX));
                } else if index == ID_INDEX {
                    return error_reply("cannot drop _id index", INVALID_OPTIONS);
                } else if let Some(pos) = target
                    .indexes
                    .iter()
                    .position(|i| i.get_str("name").ok() == Some(index.as_str()))
                {
                    target.indexes.remove(pos);
                } else {
                    return error_reply(format!("index not found with name [{}]", index), INDEX_NOT_FOUND);
                }
                ok_reply(doc! { "nIndexesWas": before })
            }
            "listindexes" => {
                let Some(coll) = collection_arg else {
                    return error_reply("collection name must be a string", BAD_VALUE);
                };
                let ns = ns_of(&coll);
                match state.collection(&ns) {
                    Some(c) => cursor_reply(format!("{}.$cmd.listIndexes.{}", db, coll), c.indexes.clone()),
                    None => error_reply("ns not found", NAMESPACE_NOT_FOUND),
                }
            }
            other => error_reply(format!("no such cmd: {}", other), COMMAND_NOT_FOUND),
        }
    }

    fn authenticate(&mut self, state: &ServerState, db: &str, command: &BsonDocument) -> BsonDocument {
        let expected_nonce = self.nonce.take();
        let (Ok(user), Ok(nonce), Ok(key)) = (
            command.get_str("user"),
            command.get_str("nonce"),
            command.get_str("key"),
        ) else {
            return error_reply("auth fails", auth::AUTHENTICATION_FAILED);
        };

        if expected_nonce.as_deref() != Some(nonce) {
            return error_reply("auth fails: nonce mismatch", auth::AUTHENTICATION_FAILED);
        }

        match state.user_digest(db, user) {
            Some(digest) if auth::auth_key(nonce, user, &digest) == key => {
                self.authenticated.insert(db.to_string());
                ok_reply(doc! { "dbname": db, "user": user })
            }
            _ => error_reply("auth fails", auth::AUTHENTICATION_FAILED),
        }
    }
}

impl Connection for MemoryConnection {
    fn run_command(&mut self, db: &str, command: BsonDocument) -> Result<BsonDocument> {
        self.pause();
        let server = self.server.clone();
        let mut state = server.state.lock();
        Ok(self.dispatch(&mut state, db, command))
    }

    fn insert(&mut self, ns: &Namespace, documents: Vec<BsonDocument>) -> Result<()> {
        self.pause();
        let mut state = self.server.state.lock();
        self.check_authorized(&state, ns)?;

        let target = state.collection_or_create(ns);
        for document in documents {
            let id = document.get("_id").cloned().unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
            let document = with_id_first(document, id);
            if let Some(index) = target.violates_unique(&document, None) {
                return Err(TidewayError::operation_failure(
                    format!("E11000 duplicate key error index: {}.${}", ns, index),
                    Some(DUPLICATE_KEY),
                ));
            }
            target.documents.push(document);
            if let Some(max) = target.capped_max() {
                while target.documents.len() > max {
                    target.documents.remove(0);
                }
            }
        }
        Ok(())
    }

    fn update(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
        multi: bool,
    ) -> Result<UpdateOutcome> {
        self.pause();
        let mut state = self.server.state.lock();
        self.check_authorized(&state, ns)?;

        let operators = is_operator_update(&update);
        if multi && !operators {
            return Err(TidewayError::operation_failure(
                "multi update only works with $ operators",
                Some(FAILED_TO_PARSE),
            ));
        }

        let target = state.collection_or_create(ns);
        let positions: Vec<usize> = target
            .documents
            .iter()
            .enumerate()
            .filter(|(_, d)| matcher::matches(d, &filter))
            .map(|(i, _)| i)
            .take(if multi { usize::MAX } else { 1 })
            .collect();

        for &pos in &positions {
            let existing = &target.documents[pos];
            let id = existing.get("_id").cloned().unwrap_or(Bson::Null);
            let replacement = if operators {
                let mut updated = existing.clone();
                apply_operators(&mut updated, &update)?;
                updated
            } else {
                with_id_first(update.clone(), id)
            };
            if let Some(index) = target.violates_unique(&replacement, Some(pos)) {
                return Err(TidewayError::operation_failure(
                    format!("E11000 duplicate key error index: {}.${}", ns, index),
                    Some(DUPLICATE_KEY),
                ));
            }
            target.documents[pos] = replacement;
        }

        if !positions.is_empty() || !upsert {
            return Ok(UpdateOutcome {
                matched: positions.len() as u64,
                upserted_id: None,
            });
        }

        let mut created = if operators {
            let mut base = BsonDocument::new();
            for (key, value) in &filter {
                let is_condition = matches!(value, Bson::Document(d) if d.keys().any(|k| k.starts_with('$')));
                if !key.starts_with('$') && !is_condition {
                    set_path(&mut base, key, value.clone());
                }
            }
            apply_operators(&mut base, &update)?;
            base
        } else {
            update
        };

        let id = created
            .get("_id")
            .cloned()
            .or_else(|| filter.get("_id").filter(|v| !matches!(v, Bson::Document(_))).cloned())
            .unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
        created = with_id_first(created, id.clone());
        if let Some(index) = target.violates_unique(&created, None) {
            return Err(TidewayError::operation_failure(
                format!("E11000 duplicate key error index: {}.${}", ns, index),
                Some(DUPLICATE_KEY),
            ));
        }
        target.documents.push(created);

        Ok(UpdateOutcome {
            matched: 0,
            upserted_id: Some(id),
        })
    }

    fn delete(&mut self, ns: &Namespace, filter: BsonDocument, multi: bool) -> Result<u64> {
        self.pause();
        let mut state = self.server.state.lock();
        self.check_authorized(&state, ns)?;

        let Some(target) = state.collection_mut(ns) else {
            return Ok(0);
        };
        let mut removed = 0u64;
        target.documents.retain(|d| {
            if (multi || removed == 0) && matcher::matches(d, &filter) {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    fn query(&mut self, ns: &Namespace, spec: &QuerySpec) -> Result<Vec<BsonDocument>> {
        self.pause();
        let state = self.server.state.lock();
        self.check_authorized(&state, ns)?;

        let Some(source) = state.collection(ns) else {
            return Ok(Vec::new());
        };
        let mut found: Vec<BsonDocument> = source
            .documents
            .iter()
            .filter(|d| matcher::matches(d, &spec.filter))
            .cloned()
            .collect();
        if let Some(sort) = &spec.sort {
            matcher::sort_documents(&mut found, sort);
        }

        let skip = usize::try_from(spec.skip).unwrap_or(usize::MAX);
        let limit = spec
            .limit
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(usize::MAX);
        Ok(found.into_iter().skip(skip).take(limit).collect())
    }
}
