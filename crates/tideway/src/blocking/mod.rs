//! Synchronous client facade
//!
//! `Client`, `Database`, `Collection` and `Cursor` here block the calling
//! thread for every round trip. The async wrappers at the crate root run
//! these calls on the executor.

mod client;
mod collection;
mod cursor;
mod database;

use bson::{Bson, Document as BsonDocument};
use tideway_common::TidewayError;

pub use client::Client;
pub use collection::{validate_collection_name, Collection, CollectionTarget, IntoCollectionTarget};
pub use cursor::Cursor;
pub use database::{Database, DatabaseHandle};

pub use crate::driver::memory::{
    COMMAND_NOT_FOUND, DUPLICATE_KEY, INDEX_NOT_FOUND, NAMESPACE_EXISTS, NAMESPACE_NOT_FOUND,
    UNAUTHORIZED,
};

/// True when a command reply reports success
pub(crate) fn reply_ok(reply: &BsonDocument) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    }
}

/// Error for a failed command reply
pub(crate) fn reply_error(reply: &BsonDocument) -> TidewayError {
    let message = reply
        .get_str("errmsg")
        .unwrap_or("command failed")
        .to_string();
    let code = match reply.get("code") {
        Some(Bson::Int32(c)) => Some(*c),
        Some(Bson::Int64(c)) => i32::try_from(*c).ok(),
        Some(Bson::Double(c)) => Some(*c as i32),
        _ => None,
    };
    TidewayError::operation_failure(message, code)
}

/// Reads a numeric reply field regardless of its BSON width
pub(crate) fn reply_count(reply: &BsonDocument, field: &str) -> u64 {
    match reply.get(field) {
        Some(Bson::Int32(n)) => u64::try_from(*n).unwrap_or(0),
        Some(Bson::Int64(n)) => u64::try_from(*n).unwrap_or(0),
        Some(Bson::Double(n)) if *n > 0.0 => *n as u64,
        _ => 0,
    }
}

/// Documents in `cursor.firstBatch` of a listing reply
pub(crate) fn first_batch(reply: &BsonDocument) -> Vec<BsonDocument> {
    reply
        .get_document("cursor")
        .and_then(|c| c.get_array("firstBatch"))
        .map(|batch| batch.iter().filter_map(Bson::as_document).cloned().collect())
        .unwrap_or_default()
}
