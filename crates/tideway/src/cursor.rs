//! Async cursor

use std::sync::Arc;

use bson::Document as BsonDocument;
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use tideway_common::{Result, TidewayError};

use crate::blocking;
use crate::operation::Operation;
use crate::Client;

/// Async view of a blocking cursor
///
/// Reads run on the executor. The blocking cursor sits behind a mutex, so
/// concurrent reads on one cursor are served one at a time.
#[derive(Clone)]
pub struct Cursor {
    inner: Arc<Mutex<blocking::Cursor>>,
    /// Set when an option could not be applied because a read was in flight
    deferred: Arc<Mutex<Option<TidewayError>>>,
    client: Client,
}

impl Cursor {
    pub(crate) fn new(cursor: blocking::Cursor, client: Client) -> Self {
        Self {
            inner: Arc::new(Mutex::new(cursor)),
            deferred: Arc::new(Mutex::new(None)),
            client,
        }
    }

    /// Apply an option without waiting on a read in flight
    fn configure(self, option: &str, apply: impl FnOnce(&mut blocking::Cursor)) -> Self {
        match self.inner.try_lock() {
            Some(mut cursor) => apply(&mut cursor),
            None => {
                let mut deferred = self.deferred.lock();
                if deferred.is_none() {
                    *deferred = Some(TidewayError::InvalidArgument(format!(
                        "cannot set {} while the cursor is fetching",
                        option
                    )));
                }
            }
        }
        self
    }

    pub fn skip(self, skip: u64) -> Self {
        self.configure("skip", |c| c.set_skip(skip))
    }

    /// 0 means no limit
    pub fn limit(self, limit: u64) -> Self {
        self.configure("limit", |c| c.set_limit(limit))
    }

    pub fn batch_size(self, batch_size: u64) -> Self {
        self.configure("batch_size", |c| c.set_batch_size(batch_size))
    }

    pub fn sort(self, sort: BsonDocument) -> Self {
        self.configure("sort", |c| c.set_sort(sort))
    }

    /// False once exhausted or closed. A cursor busy fetching counts as alive.
    pub fn alive(&self) -> bool {
        self.inner.try_lock().map(|c| c.alive()).unwrap_or(true)
    }

    /// An option that was set mid-fetch fails the next read
    fn take_deferred<T>(&self) -> Option<Operation<T>> {
        self.deferred.lock().take().map(|e| Operation::ready(Err(e)))
    }

    pub fn next(&self) -> Operation<Option<BsonDocument>> {
        if let Some(failed) = self.take_deferred() {
            return failed;
        }
        let inner = Arc::clone(&self.inner);
        self.client
            .dispatch("cursor_next", move || inner.lock().next_document())
    }

    /// Up to `length` documents, or everything left for `None`
    pub fn to_list(&self, length: Option<usize>) -> Operation<Vec<BsonDocument>> {
        if let Some(failed) = self.take_deferred() {
            return failed;
        }
        let inner = Arc::clone(&self.inner);
        self.client
            .dispatch("cursor_to_list", move || inner.lock().to_list(length))
    }

    pub fn close(&self) -> Operation<()> {
        let inner = Arc::clone(&self.inner);
        self.client.dispatch("cursor_close", move || {
            inner.lock().close();
            Ok(())
        })
    }

    /// Stream every remaining document. The stream ends after the first
    /// error.
    pub fn into_stream(self) -> impl Stream<Item = Result<BsonDocument>> {
        stream::unfold(Some(self), |state| async move {
            let cursor = state?;
            match cursor.next().await {
                Ok(Some(doc)) => Some((Ok(doc), Some(cursor))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_lock() {
            Some(cursor) => f.debug_tuple("Cursor").field(&*cursor).finish(),
            None => f.debug_tuple("Cursor").field(&"<busy>").finish(),
        }
    }
}
