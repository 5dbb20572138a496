//! Lazy, forward-only cursor

use std::collections::VecDeque;

use bson::Document as BsonDocument;
use tideway_common::{Result, TidewayError};

use super::Collection;
use crate::driver::QuerySpec;
use crate::manipulator::fix_outgoing;

const DEFAULT_BATCH_SIZE: u64 = 101;

/// Cursor over the results of `Collection::find`
///
/// Documents are fetched in batches on first use. Once the cursor reports
/// exhaustion, or is closed, it yields nothing more.
pub struct Cursor {
    collection: Collection,
    spec: QuerySpec,
    batch_size: u64,
    buffer: VecDeque<BsonDocument>,
    /// Documents fetched from the server so far
    retrieved: u64,
    started: bool,
    exhausted: bool,
    killed: bool,
    /// Builder misuse, reported on the next read
    deferred_error: Option<TidewayError>,
}

impl Cursor {
    pub(crate) fn new(collection: Collection, filter: BsonDocument) -> Self {
        Self {
            collection,
            spec: QuerySpec::new(filter),
            batch_size: DEFAULT_BATCH_SIZE,
            buffer: VecDeque::new(),
            retrieved: 0,
            started: false,
            exhausted: false,
            killed: false,
            deferred_error: None,
        }
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    fn configure(&mut self, apply: impl FnOnce(&mut Self)) {
        if self.started {
            self.deferred_error.get_or_insert_with(|| {
                TidewayError::InvalidArgument(
                    "cannot set cursor options after the query has run".to_string(),
                )
            });
            return;
        }
        apply(self);
    }

    pub(crate) fn set_skip(&mut self, skip: u64) {
        self.configure(|c| c.spec.skip = skip);
    }

    /// 0 means no limit
    pub(crate) fn set_limit(&mut self, limit: u64) {
        self.configure(|c| c.spec.limit = (limit > 0).then_some(limit));
    }

    pub(crate) fn set_batch_size(&mut self, batch_size: u64) {
        self.configure(|c| {
            c.batch_size = if batch_size == 0 { DEFAULT_BATCH_SIZE } else { batch_size }
        });
    }

    pub(crate) fn set_sort(&mut self, sort: BsonDocument) {
        self.configure(|c| c.spec.sort = Some(sort));
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.set_skip(skip);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.set_limit(limit);
        self
    }

    pub fn batch_size(mut self, batch_size: u64) -> Self {
        self.set_batch_size(batch_size);
        self
    }

    pub fn sort(mut self, sort: BsonDocument) -> Self {
        self.set_sort(sort);
        self
    }

    /// False once every document has been handed out or the cursor closed
    pub fn alive(&self) -> bool {
        !self.killed && (!self.exhausted || !self.buffer.is_empty())
    }

    pub fn close(&mut self) {
        self.killed = true;
        self.buffer.clear();
    }

    fn fetch_batch(&mut self) -> Result<()> {
        let mut take = self.batch_size;
        if let Some(limit) = self.spec.limit {
            let remaining = limit.saturating_sub(self.retrieved);
            if remaining == 0 {
                self.exhausted = true;
                return Ok(());
            }
            take = take.min(remaining);
        }

        let page = QuerySpec {
            filter: self.spec.filter.clone(),
            sort: self.spec.sort.clone(),
            skip: self.spec.skip + self.retrieved,
            limit: Some(take),
        };
        let ns = self.collection.namespace();
        let batch = self.collection.with_connection(|sock| sock.query(&ns, &page))?;

        tracing::trace!(ns = %ns, fetched = batch.len(), "cursor batch");
        self.retrieved += batch.len() as u64;
        if (batch.len() as u64) < take {
            self.exhausted = true;
        }
        self.buffer.extend(batch);
        Ok(())
    }

    /// Next document with outgoing manipulators applied
    pub fn next_document(&mut self) -> Result<Option<BsonDocument>> {
        if let Some(err) = self.deferred_error.take() {
            return Err(err);
        }
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return fix_outgoing(doc, &self.collection).map(Some);
            }
            if self.killed || self.exhausted {
                return Ok(None);
            }
            self.started = true;
            if let Err(e) = self.fetch_batch() {
                self.killed = true;
                return Err(e);
            }
        }
    }

    /// Up to `length` documents, or all remaining ones for `None`
    pub fn to_list(&mut self, length: Option<usize>) -> Result<Vec<BsonDocument>> {
        let mut out = Vec::new();
        while length.map_or(true, |n| out.len() < n) {
            match self.next_document()? {
                Some(doc) => out.push(doc),
                None => break,
            }
        }
        Ok(out)
    }
}

impl Iterator for Cursor {
    type Item = Result<BsonDocument>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_document().transpose()
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("collection", &self.collection)
            .field("spec", &self.spec)
            .field("retrieved", &self.retrieved)
            .field("alive", &self.alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::Client;
    use crate::config::ClientConfig;
    use crate::driver::MemoryServer;
    use bson::doc;
    use std::sync::Arc;

    fn numbers(n: i32) -> Collection {
        let client = Client::new(Arc::new(MemoryServer::new()), ClientConfig::default()).unwrap();
        let coll = client.database("cursor").collection("numbers");
        coll.insert_many((0..n).map(|i| doc! { "_id": i }).collect()).unwrap();
        coll
    }

    fn ids(docs: &[BsonDocument]) -> Vec<i32> {
        docs.iter().map(|d| d.get_i32("_id").unwrap()).collect()
    }

    #[test]
    fn test_pages_through_small_batches() {
        let coll = numbers(10);
        let mut cursor = coll.find(doc! {}).batch_size(3);
        let all = cursor.to_list(None).unwrap();
        assert_eq!(ids(&all), (0..10).collect::<Vec<_>>());
        assert!(!cursor.alive());
        assert!(cursor.next_document().unwrap().is_none());
    }

    #[test]
    fn test_skip_limit_sort() {
        let coll = numbers(10);
        let mut cursor = coll
            .find(doc! { "_id": { "$gte": 2 } })
            .sort(doc! { "_id": -1 })
            .skip(1)
            .limit(3)
            .batch_size(2);
        assert_eq!(ids(&cursor.to_list(None).unwrap()), vec![8, 7, 6]);
    }

    #[test]
    fn test_to_list_length() {
        let coll = numbers(5);
        let mut cursor = coll.find(doc! {});
        assert_eq!(cursor.to_list(Some(2)).unwrap().len(), 2);
        assert_eq!(cursor.to_list(Some(10)).unwrap().len(), 3);
    }

    #[test]
    fn test_close_stops_iteration() {
        let coll = numbers(5);
        let mut cursor = coll.find(doc! {});
        assert!(cursor.next_document().unwrap().is_some());
        cursor.close();
        assert!(!cursor.alive());
        assert!(cursor.next_document().unwrap().is_none());
    }

    #[test]
    fn test_options_after_start_are_reported() {
        let coll = numbers(3);
        let mut cursor = coll.find(doc! {});
        cursor.next_document().unwrap();
        let mut cursor = cursor.limit(1);
        assert!(cursor.next_document().unwrap_err().is_argument_error());
    }

    #[test]
    fn test_iterator() {
        let coll = numbers(4);
        let collected: Result<Vec<_>> = coll.find(doc! {}).collect();
        assert_eq!(collected.unwrap().len(), 4);
    }
}
