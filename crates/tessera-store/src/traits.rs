//! The contracts between the database handle and its backends.
//!
//! [`RequestExecutor`] is the logical operation surface every backend
//! answers inside one transaction. [`KvEngine`] and [`KvTransaction`] are the
//! ordered byte stores the cursor executor runs on. [`RangeQuery`],
//! [`WriteItem`] and [`BulkResult`] are the values passed across.

use std::ops::{Bound, ControlFlow};

use serde_json::Value;
use tessera_core::{Key, KeyRange};

use crate::error::{StoreError, StoreResult};

/// Whether a transaction may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Iteration direction of a range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    /// Whether results come highest key first.
    pub fn is_reverse(&self) -> bool {
        matches!(self, Self::Reverse)
    }
}

/// A range query over a store or one of its indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub store: String,
    pub index: Option<String>,
    pub range: Option<KeyRange>,
    pub direction: Direction,
    /// Return each record at most once (index queries) or count distinct
    /// index keys (counts).
    pub unique: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl RangeQuery {
    /// Every record of `store` in key order.
    pub fn new(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            index: None,
            range: None,
            direction: Direction::Forward,
            unique: false,
            limit: None,
            offset: 0,
        }
    }

    /// Query through the named index instead of the primary key.
    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    /// Restrict results to keys inside `range`.
    pub fn range(mut self, range: KeyRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.direction = if reverse {
            Direction::Reverse
        } else {
            Direction::Forward
        };
        self
    }

    /// Return each record once even when it has several index keys.
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Return at most `limit` results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first `offset` matches.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Whether the result window has room after `seen` matches were
    /// produced (offset included).
    pub(crate) fn wants_more(&self, seen: usize) -> bool {
        match self.limit {
            Some(limit) => seen < self.offset.saturating_add(limit),
            None => true,
        }
    }

    /// Apply offset and limit to an already ordered result.
    pub(crate) fn window<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// A record to write together with its optional out-of-line key.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteItem {
    pub value: Value,
    pub key: Option<Key>,
}

impl WriteItem {
    /// A record whose key comes from its key path or the key generator.
    pub fn new(value: Value) -> Self {
        Self { value, key: None }
    }

    /// A record stored under an out-of-line `key`.
    pub fn with_key(value: Value, key: impl Into<Key>) -> Self {
        Self {
            value,
            key: Some(key.into()),
        }
    }
}

impl From<Value> for WriteItem {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// Per-item outcome of a bulk request. Failures do not abort siblings.
#[derive(Debug, Clone)]
pub struct BulkResult<T> {
    results: Vec<StoreResult<T>>,
    peak_in_flight: usize,
}

impl<T> BulkResult<T> {
    pub fn new(results: Vec<StoreResult<T>>) -> Self {
        Self {
            results,
            peak_in_flight: 0,
        }
    }

    pub(crate) fn with_peak(mut self, peak: usize) -> Self {
        self.peak_in_flight = peak;
        self
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Number of items that succeeded.
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    /// Number of items that failed.
    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }

    /// Whether every item succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed() == 0
    }

    /// Largest number of items that were in flight at once. Zero for
    /// engines that do not pipeline.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    /// Outcomes in submission order.
    pub fn results(&self) -> &[StoreResult<T>] {
        &self.results
    }

    pub fn into_results(self) -> Vec<StoreResult<T>> {
        self.results
    }

    /// All values, or the first error.
    pub fn into_result(self) -> StoreResult<Vec<T>> {
        self.results.into_iter().collect()
    }

    /// The first error, if any.
    pub fn first_error(&self) -> Option<&StoreError> {
        self.results.iter().find_map(|r| r.as_ref().err())
    }
}

/// The logical operation set, implemented once per backend.
///
/// An executor lives for exactly one backend transaction. Every method
/// checks that the store is inside the transaction scope and that writes
/// happen in a read-write transaction.
pub trait RequestExecutor {
    /// The record stored under `key`.
    fn get_by_id(&mut self, store: &str, key: &Key) -> StoreResult<Option<Value>>;

    /// The records stored under each key, in request order.
    fn list_by_ids(&mut self, store: &str, keys: &[Key]) -> BulkResult<Option<Value>>;

    /// Records whose primary key is in the query range.
    fn list_by_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<Value>>;

    /// Records whose index key is in the query range, ordered by index key
    /// then primary key.
    fn list_by_index_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<Value>>;

    /// Primary keys in the query range.
    fn keys_by_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<Key>>;

    /// Primary keys of records whose index key is in the query range.
    fn keys_by_index_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<Key>>;

    /// `(primary key, record)` pairs in the query range.
    fn entries_by_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<(Key, Value)>>;

    /// Number of records in each store.
    fn count_stores(&mut self, stores: &[String]) -> StoreResult<Vec<u64>>;

    /// Number of records (or index entries, when an index is given) in range.
    fn count_key_range(&mut self, query: &RangeQuery) -> StoreResult<u64>;

    /// Insert a record, failing with a constraint error if the key exists.
    fn add_object(&mut self, store: &str, item: &WriteItem) -> StoreResult<Key>;

    /// Insert many records; each item succeeds or fails on its own.
    fn add_objects(&mut self, store: &str, items: &[WriteItem]) -> BulkResult<Key>;

    /// Insert or overwrite a record.
    fn put_object(&mut self, store: &str, item: &WriteItem) -> StoreResult<Key>;

    /// Insert or overwrite many records.
    fn put_objects(&mut self, store: &str, items: &[WriteItem]) -> BulkResult<Key>;

    /// Delete one record. Deleting a missing key succeeds.
    fn remove_by_id(&mut self, store: &str, key: &Key) -> StoreResult<()>;

    /// Delete every record in range, returning how many were removed.
    fn remove_by_key_range(&mut self, store: &str, range: Option<&KeyRange>) -> StoreResult<u64>;

    /// Delete every record with an index key in range.
    fn remove_by_index_key_range(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
    ) -> StoreResult<u64>;

    /// Delete every record of each store.
    fn clear_by_stores(&mut self, stores: &[String]) -> StoreResult<()>;
}

/// Body of a transaction: runs its requests and returns whether to commit.
pub type TransactionBody<'b> = dyn FnMut(&mut dyn RequestExecutor) -> bool + 'b;

/// Visitor called for each entry of a scan. Return `Break` to stop.
pub type ScanVisitor<'v> = dyn FnMut(&[u8], &[u8]) -> ControlFlow<()> + 'v;

/// An ordered byte key-value engine with named tables.
pub trait KvEngine: Send {
    /// Begin a transaction. Every transaction can write; read-only callers
    /// abort instead of committing.
    fn begin(&self) -> StoreResult<Box<dyn KvTransaction + '_>>;
}

/// One transaction of a [`KvEngine`].
pub trait KvTransaction {
    fn get(&self, table: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Remove a key, returning whether it existed.
    fn delete(&mut self, table: &str, key: &[u8]) -> StoreResult<bool>;

    /// Visit entries between the bounds in key order (or reverse order).
    fn scan(
        &self,
        table: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        reverse: bool,
        visit: &mut ScanVisitor<'_>,
    ) -> StoreResult<()>;

    /// Remove a table and all its entries. Missing tables are ignored.
    fn drop_table(&mut self, table: &str) -> StoreResult<()>;

    fn commit(self: Box<Self>) -> StoreResult<()>;

    fn abort(self: Box<Self>) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_result_counts() {
        let bulk: BulkResult<u8> = BulkResult::new(vec![
            Ok(1),
            Err(StoreError::Closed),
            Ok(3),
        ]);
        assert_eq!(bulk.len(), 3);
        assert_eq!(bulk.succeeded(), 2);
        assert_eq!(bulk.failed(), 1);
        assert!(!bulk.is_complete());
        assert!(matches!(bulk.first_error(), Some(StoreError::Closed)));
        assert!(bulk.into_result().is_err());
    }

    #[test]
    fn query_window() {
        let q = RangeQuery::new("s").offset(1).limit(2);
        assert_eq!(q.window(vec![1, 2, 3, 4]), vec![2, 3]);
        assert!(q.wants_more(2));
        assert!(!q.wants_more(3));
        assert!(RangeQuery::new("s").wants_more(usize::MAX));
    }
}
