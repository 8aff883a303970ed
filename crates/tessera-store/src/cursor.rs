//! The cursor engine: logical operations over an ordered byte KV store.
//!
//! Layout inside the engine:
//!
//! | Table | Key | Value |
//! |-------|-----|-------|
//! | `store:<name>` | collation bytes of the primary key | record JSON |
//! | `index:<store>:<index>` | collation bytes of `[index key, primary key]` | empty |
//! | `__meta__` | `schema`, `seq:<store>` | schema config JSON, last generated key |
//!
//! Because collation bytes sort like keys, a byte range scan visits records
//! in key order and index entries in `(index key, primary key)` order.

use std::collections::{BTreeSet, VecDeque};
use std::ops::{Bound, ControlFlow};

use serde_json::Value;
use tessera_core::{DatabaseSchema, IndexSchema, Key, KeyRange, SchemaConfig, StoreSchema};
use tracing::debug;

use crate::codec::{decode_native, encode_native};
use crate::collate;
use crate::error::{ErrorContext, StoreError, StoreResult};
use crate::traits::{
    BulkResult, KvEngine, KvTransaction, RangeQuery, RequestExecutor, TransactionBody, TxMode,
    WriteItem,
};
use crate::upgrade::UpgradePlan;

/// Default number of bulk items in flight at once.
pub const DEFAULT_PIPELINE_WINDOW: usize = 16;

const META_TABLE: &str = "__meta__";
const SCHEMA_KEY: &[u8] = b"schema";

fn store_table(store: &str) -> String {
    format!("store:{store}")
}

fn index_table(store: &str, index: &str) -> String {
    format!("index:{store}:{index}")
}

fn seq_key(store: &str) -> Vec<u8> {
    format!("seq:{store}").into_bytes()
}

type ByteBounds = (Bound<Vec<u8>>, Bound<Vec<u8>>);

fn borrow_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(b) => Bound::Included(b.as_slice()),
        Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Byte bounds covering every primary key of `range`. Open ends are
/// filtered afterwards with [`KeyRange::contains`].
fn key_bounds(range: Option<&KeyRange>) -> ByteBounds {
    let lower = match range.and_then(KeyRange::lower) {
        Some(k) => Bound::Included(collate::encode(k)),
        None => Bound::Unbounded,
    };
    let upper = match range.and_then(KeyRange::upper) {
        Some(k) => Bound::Excluded(collate::past_prefix(collate::encode(k))),
        None => Bound::Unbounded,
    };
    (lower, upper)
}

/// Byte bounds covering every index entry whose index key is in `range`.
fn index_bounds(range: Option<&KeyRange>) -> ByteBounds {
    let lower = match range.and_then(KeyRange::lower) {
        Some(k) => Bound::Included(collate::index_prefix(k)),
        None => Bound::Unbounded,
    };
    let upper = match range.and_then(KeyRange::upper) {
        Some(k) => Bound::Excluded(collate::past_prefix(collate::index_prefix(k))),
        None => Bound::Unbounded,
    };
    (lower, upper)
}

fn in_range(range: Option<&KeyRange>, key: &Key) -> bool {
    range.map_or(true, |r| r.contains(key))
}

// ── Pipeline ────────────────────────────────────────────────────────

/// Bounded fan-out for bulk requests.
///
/// Each item goes through two stages. `issue` starts an item (key
/// resolution, validation, the raw read) and `complete` finishes it against
/// the transaction. Up to `window` items are issued ahead of the oldest
/// completion, completions run in submission order, and finishing one item
/// issues the next queued one. Each item's outcome lands in its own slot; an
/// item failing in either stage does not stop its siblings.
#[derive(Debug, Clone, Copy)]
pub struct Pipeline {
    window: usize,
}

impl Pipeline {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Run `count` items through the window, threading `ctx` through both
    /// stages.
    pub fn run<C: ?Sized, P, T>(
        &self,
        ctx: &mut C,
        count: usize,
        mut issue: impl FnMut(&mut C, usize) -> StoreResult<P>,
        mut complete: impl FnMut(&mut C, usize, P) -> StoreResult<T>,
    ) -> BulkResult<T> {
        let mut slots: Vec<Option<StoreResult<T>>> = (0..count).map(|_| None).collect();
        let mut in_flight: VecDeque<(usize, P)> = VecDeque::with_capacity(self.window);
        let mut next = 0;
        let mut peak = 0;
        loop {
            while in_flight.len() < self.window && next < count {
                match issue(ctx, next) {
                    Ok(pending) => in_flight.push_back((next, pending)),
                    Err(e) => slots[next] = Some(Err(e)),
                }
                next += 1;
            }
            peak = peak.max(in_flight.len());
            let Some((slot, pending)) = in_flight.pop_front() else {
                break;
            };
            slots[slot] = Some(complete(ctx, slot, pending));
        }
        let results = slots
            .into_iter()
            .map(|s| s.unwrap_or_else(|| Err(StoreError::InvalidArgument("bulk slot never ran".into()))))
            .collect();
        BulkResult::new(results).with_peak(peak)
    }
}

/// A write whose key work is done, waiting to be applied.
struct StagedWrite<'i> {
    item: &'i WriteItem,
    /// Key, record and native key bytes. `None` when the key is generated
    /// on apply.
    resolved: Option<(Key, Value, Vec<u8>)>,
}

// ── Executor ────────────────────────────────────────────────────────

/// [`RequestExecutor`] over one [`KvTransaction`].
pub struct CursorExecutor<'t> {
    txn: &'t mut dyn KvTransaction,
    schema: &'t DatabaseSchema,
    scope: &'t [String],
    mode: TxMode,
    pipeline: Pipeline,
}

impl<'t> CursorExecutor<'t> {
    pub fn new(
        txn: &'t mut dyn KvTransaction,
        schema: &'t DatabaseSchema,
        scope: &'t [String],
        mode: TxMode,
        window: usize,
    ) -> Self {
        Self {
            txn,
            schema,
            scope,
            mode,
            pipeline: Pipeline::new(window),
        }
    }

    fn store(&self, name: &str) -> StoreResult<&'t StoreSchema> {
        if !self.scope.iter().any(|s| s == name) {
            return Err(StoreError::NotFound(format!(
                "store {name} is not in the transaction scope"
            )));
        }
        self.schema
            .store(name)
            .ok_or_else(|| StoreError::NotFound(format!("store {name}")))
    }

    fn writable(&self, op: &'static str) -> StoreResult<()> {
        match self.mode {
            TxMode::ReadWrite => Ok(()),
            TxMode::ReadOnly => Err(StoreError::InvalidArgument(format!(
                "{op} requires a read-write transaction"
            ))),
        }
    }

    fn index(store: &'t StoreSchema, name: &str) -> StoreResult<&'t IndexSchema> {
        store
            .index(name)
            .ok_or_else(|| StoreError::NotFound(format!("index {name} on store {}", store.name())))
    }

    fn each(
        &self,
        table: &str,
        bounds: &ByteBounds,
        reverse: bool,
        mut f: impl FnMut(&[u8], &[u8]) -> StoreResult<ControlFlow<()>>,
    ) -> StoreResult<()> {
        let mut failure = None;
        self.txn.scan(
            table,
            borrow_bound(&bounds.0),
            borrow_bound(&bounds.1),
            reverse,
            &mut |k, v| match f(k, v) {
                Ok(flow) => flow,
                Err(e) => {
                    failure = Some(e);
                    ControlFlow::Break(())
                }
            },
        )?;
        failure.map_or(Ok(()), Err)
    }

    /// Visit `(primary key, record bytes)` in range.
    fn scan_records(
        &self,
        store: &StoreSchema,
        range: Option<&KeyRange>,
        reverse: bool,
        mut f: impl FnMut(Key, &[u8]) -> StoreResult<ControlFlow<()>>,
    ) -> StoreResult<()> {
        self.each(&store_table(store.name()), &key_bounds(range), reverse, |k, v| {
            let key = decode_native(k)?;
            if in_range(range, &key) {
                f(key, v)
            } else {
                Ok(ControlFlow::Continue(()))
            }
        })
    }

    /// Visit `(index key, primary key)` in range.
    fn scan_index(
        &self,
        store: &StoreSchema,
        index: &IndexSchema,
        range: Option<&KeyRange>,
        reverse: bool,
        mut f: impl FnMut(Key, Key) -> StoreResult<ControlFlow<()>>,
    ) -> StoreResult<()> {
        let table = index_table(store.name(), index.name());
        self.each(&table, &index_bounds(range), reverse, |k, _| {
            let (index_key, primary_key) = collate::split_index_entry(k)
                .map_err(|e| StoreError::backend(ErrorContext::op("scan").store(store.name()), e))?;
            if in_range(range, &index_key) {
                f(index_key, primary_key)
            } else {
                Ok(ControlFlow::Continue(()))
            }
        })
    }

    fn decode_record(bytes: &[u8], ctx: &ErrorContext) -> StoreResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::data_clone(ctx.clone(), e))
    }

    fn read(&self, store: &StoreSchema, key: &Key, ctx: &ErrorContext) -> StoreResult<Option<Value>> {
        let bytes = encode_native(key, store.key_type()).map_err(|e| e.with_context(ctx))?;
        match self.txn.get(&store_table(store.name()), &bytes)? {
            Some(raw) => Self::decode_record(&raw, ctx).map(Some),
            None => Ok(None),
        }
    }

    /// Primary keys matching an index query, honouring unique, offset and limit.
    fn index_matches(&self, query: &RangeQuery) -> StoreResult<Vec<Key>> {
        let store = self.store(&query.store)?;
        let name = query
            .index
            .as_deref()
            .ok_or_else(|| StoreError::InvalidArgument("index query without an index".into()))?;
        let index = Self::index(store, name)?;
        let mut seen = BTreeSet::new();
        let mut matched = 0usize;
        let mut out = Vec::new();
        self.scan_index(
            store,
            index,
            query.range.as_ref(),
            query.direction.is_reverse(),
            |_, pk| {
                if query.unique && !seen.insert(collate::encode(&pk)) {
                    return Ok(ControlFlow::Continue(()));
                }
                matched += 1;
                if matched > query.offset {
                    out.push(pk);
                }
                Ok(if query.wants_more(matched) {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                })
            },
        )?;
        Ok(out)
    }

    fn record_entries(&self, query: &RangeQuery) -> StoreResult<Vec<(Key, Value)>> {
        let store = self.store(&query.store)?;
        let ctx = ErrorContext::op("list").store(store.name());
        let mut matched = 0usize;
        let mut out = Vec::new();
        self.scan_records(
            store,
            query.range.as_ref(),
            query.direction.is_reverse(),
            |key, raw| {
                matched += 1;
                if matched > query.offset {
                    out.push((key, Self::decode_record(raw, &ctx)?));
                }
                Ok(if query.wants_more(matched) {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                })
            },
        )?;
        Ok(out)
    }

    fn last_generated(&self, store: &str) -> StoreResult<u64> {
        Ok(match self.txn.get(META_TABLE, &seq_key(store))? {
            Some(raw) if raw.len() == 8 => {
                let mut word = [0u8; 8];
                word.copy_from_slice(&raw);
                u64::from_be_bytes(word)
            }
            _ => 0,
        })
    }

    fn set_generated(&mut self, store: &str, value: u64) -> StoreResult<()> {
        self.txn.put(META_TABLE, &seq_key(store), &value.to_be_bytes())
    }

    fn generate_key(&mut self, store: &StoreSchema) -> StoreResult<Key> {
        let next = self.last_generated(store.name())?.saturating_add(1);
        self.set_generated(store.name(), next)?;
        Ok(Key::Number(next as f64))
    }

    /// Explicit numeric keys move the generator past them.
    fn observe_key(&mut self, store: &StoreSchema, key: &Key) -> StoreResult<()> {
        if let Key::Number(n) = key {
            if n.is_finite() && *n >= 1.0 {
                let floor = n.floor().min(u64::MAX as f64) as u64;
                if floor > self.last_generated(store.name())? {
                    self.set_generated(store.name(), floor)?;
                }
            }
        }
        Ok(())
    }

    /// Decide the primary key and the record to persist.
    fn resolve_key(
        &mut self,
        store: &StoreSchema,
        item: &WriteItem,
        ctx: &ErrorContext,
    ) -> StoreResult<(Key, Value)> {
        let (key, value, generated) = resolve_key(store, item, ctx, || self.generate_key(store))?;
        if !generated && store.auto_increment() {
            self.observe_key(store, &key)?;
        }
        Ok((key, value))
    }

    /// First stage of a write: everything that does not depend on the
    /// transaction's current contents.
    fn stage_write<'i>(
        &self,
        store_name: &str,
        item: &'i WriteItem,
        overwrite: bool,
    ) -> StoreResult<StagedWrite<'i>> {
        let op = if overwrite { "put" } else { "add" };
        self.writable(op)?;
        let store = self.store(store_name)?;
        if needs_generated_key(store, item) {
            return Ok(StagedWrite { item, resolved: None });
        }
        let ctx = ErrorContext::op(op).store(store_name);
        let (key, record, _) = resolve_key(store, item, &ctx, || {
            Err(StoreError::InvalidArgument("key generation while staging".into()))
        })?;
        let pk = encode_native(&key, store.key_type())
            .map_err(|e| e.with_context(&ctx.key(&key)))?;
        Ok(StagedWrite {
            item,
            resolved: Some((key, record, pk)),
        })
    }

    fn apply_write(
        &mut self,
        store_name: &str,
        staged: StagedWrite<'_>,
        overwrite: bool,
    ) -> StoreResult<Key> {
        let op = if overwrite { "put" } else { "add" };
        let store = self.store(store_name)?;
        let ctx = ErrorContext::op(op).store(store_name);
        let (key, record, pk) = match staged.resolved {
            Some((key, record, pk)) => {
                if store.auto_increment() {
                    self.observe_key(store, &key)?;
                }
                (key, record, pk)
            }
            None => {
                let (key, record) = self.resolve_key(store, staged.item, &ctx)?;
                let pk = encode_native(&key, store.key_type())
                    .map_err(|e| e.with_context(&ctx.clone().key(&key)))?;
                (key, record, pk)
            }
        };
        let ctx = ctx.key(&key);
        let table = store_table(store_name);

        let existing = match self.txn.get(&table, &pk)? {
            Some(raw) => Some(Self::decode_record(&raw, &ctx)?),
            None => None,
        };
        if existing.is_some() && !overwrite {
            return Err(StoreError::constraint(ctx, "key already exists"));
        }

        let stored = store.project_fixed(&record);
        for index in store.indexes().iter().filter(|i| i.unique()) {
            for index_key in index.index_keys(&stored) {
                let bounds = (
                    Bound::Included(collate::index_prefix(&index_key)),
                    Bound::Excluded(collate::past_prefix(collate::index_prefix(&index_key))),
                );
                let mut conflict = false;
                self.each(&index_table(store_name, index.name()), &bounds, false, |k, _| {
                    let (_, other) = collate::split_index_entry(k)
                        .map_err(|e| StoreError::backend(ctx.clone(), e))?;
                    if other == key {
                        return Ok(ControlFlow::Continue(()));
                    }
                    conflict = true;
                    Ok(ControlFlow::Break(()))
                })?;
                if conflict {
                    return Err(StoreError::constraint(
                        ctx,
                        format!("unique index {} already contains {index_key}", index.name()),
                    ));
                }
            }
        }

        if let Some(old) = &existing {
            self.remove_index_entries(store, &key, old)?;
        }
        for index in store.indexes() {
            let table = index_table(store_name, index.name());
            for index_key in index.index_keys(&stored) {
                self.txn.put(&table, &collate::index_entry(&index_key, &key), &[])?;
            }
        }
        let bytes = serde_json::to_vec(&stored).map_err(|e| StoreError::data_clone(ctx.clone(), e))?;
        self.txn.put(&table, &pk, &bytes)?;
        debug!(store = store_name, key = %key, op, "record written");
        Ok(key)
    }

    fn write_one(&mut self, store_name: &str, item: &WriteItem, overwrite: bool) -> StoreResult<Key> {
        let staged = self.stage_write(store_name, item, overwrite)?;
        self.apply_write(store_name, staged, overwrite)
    }

    fn write_many(
        &mut self,
        store_name: &str,
        items: &[WriteItem],
        overwrite: bool,
    ) -> BulkResult<Key> {
        let pipeline = self.pipeline;
        pipeline.run(
            self,
            items.len(),
            |ex, i| ex.stage_write(store_name, &items[i], overwrite),
            |ex, _, staged| ex.apply_write(store_name, staged, overwrite),
        )
    }

    /// First stage of a keyed read: the raw record bytes.
    fn fetch(&self, store_name: &str, key: &Key) -> StoreResult<Option<Vec<u8>>> {
        let store = self.store(store_name)?;
        let ctx = ErrorContext::op("get").store(store_name).key(key);
        let bytes = encode_native(key, store.key_type()).map_err(|e| e.with_context(&ctx))?;
        self.txn.get(&store_table(store_name), &bytes)
    }

    fn remove_index_entries(&mut self, store: &StoreSchema, key: &Key, record: &Value) -> StoreResult<()> {
        for index in store.indexes() {
            let table = index_table(store.name(), index.name());
            for index_key in index.index_keys(record) {
                self.txn.delete(&table, &collate::index_entry(&index_key, key))?;
            }
        }
        Ok(())
    }

    fn remove_one(&mut self, store: &StoreSchema, key: &Key, ctx: &ErrorContext) -> StoreResult<bool> {
        let pk = encode_native(key, store.key_type()).map_err(|e| e.with_context(ctx))?;
        let table = store_table(store.name());
        let Some(raw) = self.txn.get(&table, &pk)? else {
            return Ok(false);
        };
        let old = Self::decode_record(&raw, ctx)?;
        self.remove_index_entries(store, key, &old)?;
        self.txn.delete(&table, &pk)
    }
}

/// Whether writing `item` asks the store to generate its key.
pub(crate) fn needs_generated_key(store: &StoreSchema, item: &WriteItem) -> bool {
    if !store.auto_increment() {
        return false;
    }
    match store.key_path() {
        Some(_) => {
            item.key.is_none()
                && store.extract_key(&item.value).is_none()
                && !store.has_key_value(&item.value)
        }
        None => item.key.is_none(),
    }
}

/// Shared key resolution: inline key paths, out-of-line keys and
/// generated keys. Returns the key, the record with any generated key
/// written in, and whether the key was generated.
pub(crate) fn resolve_key(
    store: &StoreSchema,
    item: &WriteItem,
    ctx: &ErrorContext,
    generate: impl FnOnce() -> StoreResult<Key>,
) -> StoreResult<(Key, Value, bool)> {
    match store.key_path() {
        Some(_) => {
            if item.key.is_some() {
                return Err(StoreError::InvalidArgument(format!(
                    "store {} uses an inline key path and rejects explicit keys",
                    store.name()
                )));
            }
            if let Some(key) = store.extract_key(&item.value) {
                return Ok((key, item.value.clone(), false));
            }
            if store.has_key_value(&item.value) {
                return Err(StoreError::invalid_key(
                    ctx.clone(),
                    "value at the key path is not a valid key of the declared type",
                ));
            }
            if !store.auto_increment() {
                return Err(StoreError::invalid_key(ctx.clone(), "record has no key"));
            }
            let key = generate()?;
            let value = store
                .set_key_value(&item.value, &key)
                .map_err(|e| StoreError::data_clone(ctx.clone(), e))?;
            Ok((key, value, true))
        }
        None => match &item.key {
            Some(key) if store.accepts_key(key) => Ok((key.clone(), item.value.clone(), false)),
            Some(key) => Err(StoreError::invalid_key(
                ctx.clone().key(key),
                "key does not match the declared key type",
            )),
            None if store.auto_increment() => Ok((generate()?, item.value.clone(), true)),
            None => Err(StoreError::invalid_key(ctx.clone(), "no key supplied")),
        },
    }
}

impl RequestExecutor for CursorExecutor<'_> {
    fn get_by_id(&mut self, store: &str, key: &Key) -> StoreResult<Option<Value>> {
        let s = self.store(store)?;
        self.read(s, key, &ErrorContext::op("get").store(store).key(key))
    }

    fn list_by_ids(&mut self, store: &str, keys: &[Key]) -> BulkResult<Option<Value>> {
        let pipeline = self.pipeline;
        pipeline.run(
            self,
            keys.len(),
            |ex, i| ex.fetch(store, &keys[i]),
            |_, i, raw| {
                let ctx = ErrorContext::op("get").store(store).key(&keys[i]);
                raw.map(|raw| Self::decode_record(&raw, &ctx)).transpose()
            },
        )
    }

    fn list_by_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<Value>> {
        if query.index.is_some() {
            return self.list_by_index_key_range(query);
        }
        Ok(self.record_entries(query)?.into_iter().map(|(_, v)| v).collect())
    }

    fn list_by_index_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<Value>> {
        let store = self.store(&query.store)?;
        let keys = self.index_matches(query)?;
        let ctx = ErrorContext::op("list").store(&query.store);
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            match self.read(store, &key, &ctx)? {
                Some(value) => out.push(value),
                None => {
                    return Err(StoreError::backend(
                        ctx.key(&key),
                        "index entry points at a missing record",
                    ))
                }
            }
        }
        Ok(out)
    }

    fn keys_by_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<Key>> {
        if query.index.is_some() {
            return self.keys_by_index_key_range(query);
        }
        let store = self.store(&query.store)?;
        let mut matched = 0usize;
        let mut out = Vec::new();
        self.scan_records(
            store,
            query.range.as_ref(),
            query.direction.is_reverse(),
            |key, _| {
                matched += 1;
                if matched > query.offset {
                    out.push(key);
                }
                Ok(if query.wants_more(matched) {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                })
            },
        )?;
        Ok(out)
    }

    fn keys_by_index_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<Key>> {
        self.index_matches(query)
    }

    fn entries_by_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<(Key, Value)>> {
        self.record_entries(query)
    }

    fn count_stores(&mut self, stores: &[String]) -> StoreResult<Vec<u64>> {
        stores
            .iter()
            .map(|name| self.count_key_range(&RangeQuery::new(name.as_str())))
            .collect()
    }

    fn count_key_range(&mut self, query: &RangeQuery) -> StoreResult<u64> {
        let store = self.store(&query.store)?;
        let mut count = 0u64;
        match &query.index {
            None => self.scan_records(store, query.range.as_ref(), false, |_, _| {
                count += 1;
                Ok(ControlFlow::Continue(()))
            })?,
            Some(name) => {
                let index = Self::index(store, name)?;
                let mut last: Option<Key> = None;
                self.scan_index(store, index, query.range.as_ref(), false, |index_key, _| {
                    if !query.unique || last.as_ref() != Some(&index_key) {
                        count += 1;
                    }
                    last = Some(index_key);
                    Ok(ControlFlow::Continue(()))
                })?;
            }
        }
        Ok(count)
    }

    fn add_object(&mut self, store: &str, item: &WriteItem) -> StoreResult<Key> {
        self.write_one(store, item, false)
    }

    fn add_objects(&mut self, store: &str, items: &[WriteItem]) -> BulkResult<Key> {
        self.write_many(store, items, false)
    }

    fn put_object(&mut self, store: &str, item: &WriteItem) -> StoreResult<Key> {
        self.write_one(store, item, true)
    }

    fn put_objects(&mut self, store: &str, items: &[WriteItem]) -> BulkResult<Key> {
        self.write_many(store, items, true)
    }

    fn remove_by_id(&mut self, store: &str, key: &Key) -> StoreResult<()> {
        self.writable("remove")?;
        let s = self.store(store)?;
        self.remove_one(s, key, &ErrorContext::op("remove").store(store).key(key))?;
        Ok(())
    }

    fn remove_by_key_range(&mut self, store: &str, range: Option<&KeyRange>) -> StoreResult<u64> {
        self.writable("remove")?;
        let s = self.store(store)?;
        let mut keys = Vec::new();
        self.scan_records(s, range, false, |key, _| {
            keys.push(key);
            Ok(ControlFlow::Continue(()))
        })?;
        let ctx = ErrorContext::op("remove").store(store);
        let mut removed = 0;
        for key in keys {
            if self.remove_one(s, &key, &ctx)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn remove_by_index_key_range(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
    ) -> StoreResult<u64> {
        self.writable("remove")?;
        let s = self.store(store)?;
        let mut query = RangeQuery::new(store).index(index).unique(true);
        query.range = range.cloned();
        let keys = self.index_matches(&query)?;
        let ctx = ErrorContext::op("remove").store(store);
        let mut removed = 0;
        for key in keys {
            if self.remove_one(s, &key, &ctx)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn clear_by_stores(&mut self, stores: &[String]) -> StoreResult<()> {
        self.writable("clear")?;
        for name in stores {
            let s = self.store(name)?;
            drop_store_tables(&mut *self.txn, s)?;
        }
        Ok(())
    }
}

fn drop_store_tables(txn: &mut dyn KvTransaction, store: &StoreSchema) -> StoreResult<()> {
    txn.drop_table(&store_table(store.name()))?;
    for index in store.indexes() {
        txn.drop_table(&index_table(store.name(), index.name()))?;
    }
    Ok(())
}

// ── Connection ──────────────────────────────────────────────────────

/// A cursor-engine connection: one [`KvEngine`] plus the executor settings.
pub struct CursorConnection {
    engine: Box<dyn KvEngine>,
    window: usize,
}

impl CursorConnection {
    pub fn new(engine: impl KvEngine + 'static, window: usize) -> Self {
        Self {
            engine: Box::new(engine),
            window,
        }
    }

    /// The schema persisted by the last successful upgrade.
    pub fn load_schema(&self) -> StoreResult<Option<DatabaseSchema>> {
        let txn = self.engine.begin()?;
        let raw = txn.get(META_TABLE, SCHEMA_KEY)?;
        txn.abort()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let text = String::from_utf8(raw).map_err(|e| {
            StoreError::data_clone(ErrorContext::op("load_schema"), e)
        })?;
        let config = SchemaConfig::from_json_str(&text)?;
        Ok(Some(DatabaseSchema::from_config(&config)?))
    }

    /// Run one transaction.
    pub fn run(
        &mut self,
        schema: &DatabaseSchema,
        scope: &[String],
        mode: TxMode,
        body: &mut TransactionBody<'_>,
    ) -> StoreResult<()> {
        let mut txn = self.engine.begin()?;
        let commit = {
            let mut executor = CursorExecutor::new(txn.as_mut(), schema, scope, mode, self.window);
            body(&mut executor)
        };
        if commit && mode == TxMode::ReadWrite {
            txn.commit()
        } else {
            txn.abort()
        }
    }

    /// Move the database from `old` to `new` in one transaction, then run
    /// `body` against the new schema before committing.
    pub fn upgrade(
        &mut self,
        old: Option<&DatabaseSchema>,
        new: &DatabaseSchema,
        body: &mut TransactionBody<'_>,
    ) -> StoreResult<()> {
        let mut txn = self.engine.begin()?;
        match apply_upgrade(txn.as_mut(), old, new, self.window, body) {
            Ok(true) => txn.commit(),
            Ok(false) => {
                txn.abort()?;
                Err(StoreError::Connection("upgrade transaction was aborted".into()))
            }
            Err(e) => {
                // The upgrade error is the one worth reporting.
                let _ = txn.abort();
                Err(e)
            }
        }
    }
}

fn apply_upgrade(
    txn: &mut dyn KvTransaction,
    old: Option<&DatabaseSchema>,
    new: &DatabaseSchema,
    window: usize,
    body: &mut TransactionBody<'_>,
) -> StoreResult<bool> {
    let plan = UpgradePlan::between(old, new);
    let mut carried = Vec::new();
    if let Some(old) = old {
        let old_scope: Vec<String> = old.stores().iter().map(|s| s.name().to_string()).collect();
        for name in &plan.rebuilt {
            let mut reader = CursorExecutor::new(&mut *txn, old, &old_scope, TxMode::ReadOnly, window);
            let entries = reader.entries_by_key_range(&RangeQuery::new(name.as_str()))?;
            carried.push((name.clone(), entries));
        }
        for name in plan.dropped.iter().chain(&plan.rebuilt) {
            let store = old.require_store(name)?;
            drop_store_tables(&mut *txn, store)?;
            if plan.dropped.contains(name) {
                txn.delete(META_TABLE, &seq_key(name))?;
            }
        }
    }

    let scope: Vec<String> = new.stores().iter().map(|s| s.name().to_string()).collect();
    let mut writer = CursorExecutor::new(&mut *txn, new, &scope, TxMode::ReadWrite, window);
    for (name, entries) in carried {
        let store = new.require_store(&name)?;
        debug!(store = %name, records = entries.len(), "rebuilding store");
        for (key, value) in entries {
            let item = match store.key_path() {
                Some(_) => WriteItem::new(value),
                None => WriteItem {
                    value,
                    key: Some(key),
                },
            };
            writer.put_object(&name, &item)?;
        }
    }
    let config = new.to_config().to_json_string()?;
    writer.txn.put(META_TABLE, SCHEMA_KEY, config.as_bytes())?;
    Ok(body(&mut writer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryEngine;
    use crate::ErrorKind;
    use serde_json::json;
    use tessera_core::{DataType, IndexSchema};

    fn schema() -> DatabaseSchema {
        DatabaseSchema::new(vec![
            StoreSchema::new("S")
                .with_key_path("id")
                .with_key_type(DataType::Numeric)
                .with_index(IndexSchema::new("tags").with_multi_entry(true))
                .with_index(IndexSchema::new("email").with_unique(true)),
            StoreSchema::new("auto")
                .with_key_path("id")
                .with_auto_increment(true)
                .with_key_type(DataType::Integer),
            StoreSchema::new("loose"),
        ])
        .unwrap()
    }

    fn scope(schema: &DatabaseSchema) -> Vec<String> {
        schema.stores().iter().map(|s| s.name().to_string()).collect()
    }

    fn with_executor<T>(
        engine: &MemoryEngine,
        schema: &DatabaseSchema,
        mode: TxMode,
        f: impl FnOnce(&mut CursorExecutor<'_>) -> T,
    ) -> T {
        let scope = scope(schema);
        let mut txn = engine.begin().unwrap();
        let out = {
            let mut ex = CursorExecutor::new(txn.as_mut(), schema, &scope, mode, 4);
            f(&mut ex)
        };
        txn.commit().unwrap();
        out
    }

    #[test]
    fn multi_entry_scenario() {
        let engine = MemoryEngine::new();
        let schema = schema();
        with_executor(&engine, &schema, TxMode::ReadWrite, |ex| {
            ex.put_object("S", &WriteItem::new(json!({"id": 1, "tags": ["a", "b"]})))
                .unwrap();
            let query = RangeQuery::new("S").index("tags").range(KeyRange::only("a").unwrap());
            assert_eq!(
                ex.list_by_index_key_range(&query).unwrap(),
                vec![json!({"id": 1, "tags": ["a", "b"]})]
            );
        });
        assert_eq!(engine.table_len("index:S:tags"), 2);
        with_executor(&engine, &schema, TxMode::ReadWrite, |ex| {
            ex.remove_by_id("S", &Key::from(1)).unwrap();
        });
        assert_eq!(engine.table_len("index:S:tags"), 0);
    }

    #[test]
    fn add_conflicts_and_put_overwrites() {
        let engine = MemoryEngine::new();
        let schema = schema();
        with_executor(&engine, &schema, TxMode::ReadWrite, |ex| {
            ex.add_object("S", &WriteItem::new(json!({"id": 1, "v": 1}))).unwrap();
            let err = ex
                .add_object("S", &WriteItem::new(json!({"id": 1, "v": 2})))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Constraint);
            ex.put_object("S", &WriteItem::new(json!({"id": 1, "v": 3}))).unwrap();
            assert_eq!(
                ex.get_by_id("S", &Key::from(1)).unwrap(),
                Some(json!({"id": 1, "v": 3}))
            );
        });
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let engine = MemoryEngine::new();
        let schema = schema();
        with_executor(&engine, &schema, TxMode::ReadWrite, |ex| {
            ex.put_object("S", &WriteItem::new(json!({"id": 1, "email": "a@x"}))).unwrap();
            // rewriting the same record keeps its own entry
            ex.put_object("S", &WriteItem::new(json!({"id": 1, "email": "a@x"}))).unwrap();
            let err = ex
                .put_object("S", &WriteItem::new(json!({"id": 2, "email": "a@x"})))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Constraint);
        });
    }

    #[test]
    fn bulk_writes_report_per_item() {
        let engine = MemoryEngine::new();
        let schema = schema();
        with_executor(&engine, &schema, TxMode::ReadWrite, |ex| {
            let items: Vec<_> = (0..10)
                .map(|i| WriteItem::new(json!({"id": i % 7})))
                .collect();
            let bulk = ex.add_objects("S", &items);
            assert_eq!(bulk.len(), 10);
            assert_eq!(bulk.failed(), 3);
            assert_eq!(bulk.peak_in_flight(), 4);
            assert_eq!(ex.count_stores(&["S".to_string()]).unwrap(), vec![7]);

            // both copies are issued before either is applied
            let twins = [
                WriteItem::new(json!({"id": 20})),
                WriteItem::new(json!({"id": 20})),
            ];
            let kinds: Vec<_> = ex
                .add_objects("S", &twins)
                .results()
                .iter()
                .map(|r| r.as_ref().err().map(StoreError::kind))
                .collect();
            assert_eq!(kinds, vec![None, Some(ErrorKind::Constraint)]);

            let generated = ex.add_objects(
                "auto",
                &[
                    WriteItem::new(json!({"v": "a"})),
                    WriteItem::new(json!({"id": 10, "v": "b"})),
                    WriteItem::new(json!({"v": "c"})),
                ],
            );
            assert_eq!(
                generated.into_result().unwrap(),
                vec![Key::from(1), Key::from(10), Key::from(11)]
            );
        });
    }

    #[test]
    fn pipeline_issues_ahead_of_completions() {
        let mut log = Vec::new();
        let bulk = Pipeline::new(3).run(
            &mut log,
            5,
            |log: &mut Vec<String>, i| {
                log.push(format!("issue {i}"));
                Ok(i * 10)
            },
            |log, i, issued| {
                log.push(format!("complete {i}"));
                Ok(issued + 1)
            },
        );
        assert_eq!(
            log,
            [
                "issue 0", "issue 1", "issue 2", "complete 0", "issue 3", "complete 1",
                "issue 4", "complete 2", "complete 3", "complete 4",
            ]
        );
        assert_eq!(bulk.peak_in_flight(), 3);
        assert_eq!(bulk.into_result().unwrap(), vec![1, 11, 21, 31, 41]);
    }

    #[test]
    fn pipeline_failures_stay_in_their_slot() {
        let mut log = Vec::new();
        let bulk = Pipeline::new(3).run(
            &mut log,
            6,
            |log: &mut Vec<String>, i| {
                log.push(format!("i{i}"));
                if i == 1 {
                    return Err(StoreError::InvalidArgument("bad item".into()));
                }
                Ok(i)
            },
            |log, i, _| {
                log.push(format!("c{i}"));
                if i == 3 {
                    return Err(StoreError::constraint(ErrorContext::op("add"), "taken"));
                }
                Ok(i)
            },
        );
        assert_eq!(
            log,
            ["i0", "i1", "i2", "i3", "c0", "i4", "c2", "i5", "c3", "c4", "c5"]
        );
        let kinds: Vec<_> = bulk
            .results()
            .iter()
            .map(|r| r.as_ref().err().map(StoreError::kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                None,
                Some(ErrorKind::InvalidArgument),
                None,
                Some(ErrorKind::Constraint),
                None,
                None,
            ]
        );
        assert_eq!(bulk.peak_in_flight(), 3);
    }

    #[test]
    fn auto_increment_follows_explicit_keys() {
        let engine = MemoryEngine::new();
        let schema = schema();
        with_executor(&engine, &schema, TxMode::ReadWrite, |ex| {
            let k1 = ex.add_object("auto", &WriteItem::new(json!({"v": "a"}))).unwrap();
            assert_eq!(k1, Key::from(1));
            ex.add_object("auto", &WriteItem::new(json!({"id": 10, "v": "b"}))).unwrap();
            let k3 = ex.add_object("auto", &WriteItem::new(json!({"v": "c"}))).unwrap();
            assert_eq!(k3, Key::from(11));
            assert_eq!(
                ex.get_by_id("auto", &Key::from(11)).unwrap(),
                Some(json!({"id": 11, "v": "c"}))
            );
        });
    }

    #[test]
    fn out_of_line_keys() {
        let engine = MemoryEngine::new();
        let schema = schema();
        with_executor(&engine, &schema, TxMode::ReadWrite, |ex| {
            let err = ex.put_object("loose", &WriteItem::new(json!("x"))).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidKey);
            ex.put_object("loose", &WriteItem::with_key(json!("x"), "k")).unwrap();
            assert_eq!(ex.get_by_id("loose", &Key::from("k")).unwrap(), Some(json!("x")));
            let err = ex
                .put_object("S", &WriteItem::with_key(json!({"id": 1}), 1))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        });
    }

    #[test]
    fn read_only_and_scope_are_enforced() {
        let engine = MemoryEngine::new();
        let schema = schema();
        with_executor(&engine, &schema, TxMode::ReadOnly, |ex| {
            let err = ex.put_object("S", &WriteItem::new(json!({"id": 1}))).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        });
        let narrow = vec!["S".to_string()];
        let mut txn = engine.begin().unwrap();
        let mut ex = CursorExecutor::new(txn.as_mut(), &schema, &narrow, TxMode::ReadWrite, 4);
        let err = ex.get_by_id("loose", &Key::from(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn ranges_offsets_and_direction() {
        let engine = MemoryEngine::new();
        let schema = schema();
        with_executor(&engine, &schema, TxMode::ReadWrite, |ex| {
            for i in 1..=6 {
                ex.put_object("S", &WriteItem::new(json!({"id": i}))).unwrap();
            }
            let q = RangeQuery::new("S")
                .range(KeyRange::bound(2, 5, true, false).unwrap())
                .reverse(true)
                .offset(1)
                .limit(2);
            assert_eq!(ex.keys_by_key_range(&q).unwrap(), vec![Key::from(4), Key::from(3)]);
            let removed = ex
                .remove_by_key_range("S", Some(&KeyRange::upper_bound(3, false).unwrap()))
                .unwrap();
            assert_eq!(removed, 3);
            assert_eq!(ex.count_key_range(&RangeQuery::new("S")).unwrap(), 3);
        });
    }

    #[test]
    fn unique_index_query_returns_each_record_once() {
        let engine = MemoryEngine::new();
        let schema = schema();
        with_executor(&engine, &schema, TxMode::ReadWrite, |ex| {
            ex.put_object("S", &WriteItem::new(json!({"id": 1, "tags": ["a", "b"]}))).unwrap();
            ex.put_object("S", &WriteItem::new(json!({"id": 2, "tags": ["b"]}))).unwrap();
            let all = RangeQuery::new("S").index("tags");
            assert_eq!(
                ex.keys_by_index_key_range(&all).unwrap(),
                vec![Key::from(1), Key::from(1), Key::from(2)]
            );
            assert_eq!(
                ex.keys_by_index_key_range(&all.clone().unique(true)).unwrap(),
                vec![Key::from(1), Key::from(2)]
            );
            assert_eq!(ex.count_key_range(&all).unwrap(), 3);
            assert_eq!(ex.count_key_range(&all.clone().unique(true)).unwrap(), 2);
            let removed = ex
                .remove_by_index_key_range("S", "tags", Some(&KeyRange::only("b").unwrap()))
                .unwrap();
            assert_eq!(removed, 2);
        });
    }

    #[test]
    fn upgrade_rebuilds_changed_stores() {
        let engine = MemoryEngine::new();
        let v1 = DatabaseSchema::new(vec![StoreSchema::new("p").with_key_path("id")])
            .unwrap()
            .with_version(1);
        let mut conn = CursorConnection::new(engine.clone(), 4);
        conn.upgrade(None, &v1, &mut |_| true).unwrap();
        conn.run(&v1, &["p".to_string()], TxMode::ReadWrite, &mut |ex| {
            ex.put_object("p", &WriteItem::new(json!({"id": 1, "name": "ann"}))).is_ok()
        })
        .unwrap();

        let v2 = DatabaseSchema::new(vec![StoreSchema::new("p")
            .with_key_path("id")
            .with_index(IndexSchema::new("name"))])
        .unwrap()
        .with_version(2);
        conn.upgrade(Some(&v1), &v2, &mut |_| true).unwrap();
        assert_eq!(engine.table_len("index:p:name"), 1);
        assert_eq!(conn.load_schema().unwrap(), Some(v2));
    }
}
