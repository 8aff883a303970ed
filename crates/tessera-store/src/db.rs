//! The database handle.
//!
//! [`Database`] owns a [`Scheduler`] and appends every request to its
//! shared FIFO queue, where the queue capacity is enforced. Whichever thread
//! manages to take the scheduler lock runs the queued transactions; everyone
//! else just enqueues. A request submitted from inside a running transaction
//! therefore queues behind it instead of deadlocking.
//!
//! ```
//! use serde_json::json;
//! use tessera_core::{DatabaseSchema, IndexSchema, KeyRange, StoreSchema};
//! use tessera_store::{BackendKind, Database, DatabaseConfig, RangeQuery};
//!
//! let schema = DatabaseSchema::new(vec![StoreSchema::new("notes")
//!     .with_key_path("id")
//!     .with_index(IndexSchema::new("tags").with_multi_entry(true))])
//! .unwrap();
//! let config = DatabaseConfig::new("doc")
//!     .with_backends([BackendKind::Memory])
//!     .with_schema(&schema);
//! let db = Database::open(config).unwrap();
//!
//! db.put("notes", json!({"id": 1, "tags": ["a", "b"]})).wait().unwrap();
//! let tagged = db
//!     .get_range(RangeQuery::new("notes").index("tags").range(KeyRange::only("b").unwrap()))
//!     .wait()
//!     .unwrap();
//! assert_eq!(tagged.len(), 1);
//! ```

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::task::{Context, Poll};

use serde_json::Value;
use tessera_core::{DatabaseSchema, Key, KeyRange, StoreSchema};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::backend;
use crate::config::DatabaseConfig;
use crate::error::{StoreError, StoreResult};
use crate::scheduler::{
    ConnectionState, PendingRequest, RequestMode, Scheduler, SharedState, TransactionJob,
};
use crate::traits::{BulkResult, RangeQuery, RequestExecutor, TxMode, WriteItem};

thread_local! {
    static IN_TRANSACTION: Cell<bool> = const { Cell::new(false) };
}

fn in_transaction() -> bool {
    IN_TRANSACTION.with(Cell::get)
}

/// Marks the current thread as running a transaction body until dropped.
struct TransactionGuard {
    previous: bool,
}

impl TransactionGuard {
    fn enter() -> Self {
        Self {
            previous: IN_TRANSACTION.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        IN_TRANSACTION.with(|flag| flag.set(self.previous));
    }
}

// ── Request ─────────────────────────────────────────────────────────

/// The eventual result of a submitted request.
///
/// Await it from async code or call [`Request::wait`] from a plain thread.
#[must_use = "a request does nothing observable unless its result is read"]
#[derive(Debug)]
pub struct Request<T> {
    rx: oneshot::Receiver<StoreResult<T>>,
}

impl<T> Request<T> {
    /// A request that has already completed.
    pub fn ready(result: StoreResult<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Block the current thread until the request completes.
    ///
    /// Inside a running transaction only already-completed requests can be
    /// read; anything else would wait on itself and fails instead. Must not
    /// be called from within an async runtime.
    pub fn wait(mut self) -> StoreResult<T> {
        if in_transaction() {
            return match self.rx.try_recv() {
                Ok(result) => result,
                Err(oneshot::error::TryRecvError::Empty) => Err(StoreError::InvalidArgument(
                    "cannot wait for a queued request inside a running transaction".into(),
                )),
                Err(oneshot::error::TryRecvError::Closed) => Err(StoreError::Closed),
            };
        }
        self.rx.blocking_recv().unwrap_or(Err(StoreError::Closed))
    }
}

impl<T> Future for Request<T> {
    type Output = StoreResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(StoreError::Closed)))
    }
}

/// Adapts a closure to [`TransactionJob`] and reports its output.
struct FnJob<F, T> {
    body: Option<F>,
    output: Option<StoreResult<T>>,
    tx: oneshot::Sender<StoreResult<T>>,
}

impl<F, T> TransactionJob for FnJob<F, T>
where
    F: FnOnce(&mut dyn RequestExecutor) -> StoreResult<T> + Send,
    T: Send,
{
    fn run(&mut self, executor: &mut dyn RequestExecutor) -> bool {
        let Some(body) = self.body.take() else {
            return false;
        };
        let output = {
            let _guard = TransactionGuard::enter();
            body(executor)
        };
        let commit = output.is_ok();
        self.output = Some(output);
        commit
    }

    fn finish(self: Box<Self>, outcome: StoreResult<()>) {
        let this = *self;
        let result = match (outcome, this.output) {
            (Ok(()), Some(output)) => output,
            (Ok(()), None) => Err(StoreError::Connection("transaction body never ran".into())),
            // a failing body rolls the transaction back; report its error
            (Err(_), Some(Err(e))) => Err(e),
            (Err(e), _) => Err(e),
        };
        let _ = this.tx.send(result);
    }
}

// ── Database ────────────────────────────────────────────────────────

struct Inner {
    config: DatabaseConfig,
    scheduler: Mutex<Scheduler>,
    shared: Arc<SharedState>,
}

/// A handle to one database. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.config.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// A disconnected database. Requests queue until [`Database::connect`].
    pub fn new(config: DatabaseConfig) -> StoreResult<Self> {
        config.validate()?;
        let schema = config.database_schema()?;
        let scheduler = Scheduler::new(config.name.clone(), config.scheduler.clone(), schema);
        let shared = scheduler.shared();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                scheduler: Mutex::new(scheduler),
                shared,
            }),
        })
    }

    /// Create and connect.
    pub fn open(config: DatabaseConfig) -> StoreResult<Self> {
        let db = Self::new(config)?;
        db.connect()?;
        Ok(db)
    }

    fn lock(&self) -> MutexGuard<'_, Scheduler> {
        self.inner.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refuse_in_transaction(op: &str) -> StoreResult<()> {
        if in_transaction() {
            return Err(StoreError::InvalidArgument(format!(
                "{op} cannot be called inside a running transaction"
            )));
        }
        Ok(())
    }

    /// Open the first available backend and reconcile its schema. Requests
    /// queued so far run once the connection is ready.
    pub fn connect(&self) -> StoreResult<()> {
        Self::refuse_in_transaction("connect")?;
        if !self.lock().begin_open()? {
            return Ok(());
        }
        let opened = backend::open_preferred(&self.inner.config);
        let result = {
            let mut scheduler = self.lock();
            match opened {
                Ok(conn) => scheduler.connection_established(conn),
                Err(e) => {
                    scheduler.connection_failed(&e);
                    Err(e)
                }
            }
        };
        self.pump();
        result
    }

    /// Close the database. Queued and later requests fail with `Closed`.
    pub fn close(&self) -> StoreResult<()> {
        Self::refuse_in_transaction("close")?;
        self.lock().close();
        info!(db = %self.inner.config.name, "database closed");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    /// The schema in effect.
    pub fn schema(&self) -> Arc<DatabaseSchema> {
        self.inner.shared.schema()
    }

    pub fn version(&self) -> Option<u32> {
        self.schema().version()
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Run the queue, unless another thread already holds the scheduler.
    /// The holder re-checks the queue after releasing the lock, so no
    /// request is left behind.
    fn pump(&self) {
        loop {
            let mut scheduler = match self.inner.scheduler.try_lock() {
                Ok(scheduler) => scheduler,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            scheduler.drain();
            drop(scheduler);
            if !self.inner.shared.runnable() {
                return;
            }
        }
    }

    fn submit<T, F>(&self, scope: Vec<String>, mode: RequestMode, body: F) -> Request<T>
    where
        F: FnOnce(&mut dyn RequestExecutor) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = FnJob {
            body: Some(body),
            output: None,
            tx,
        };
        let request = PendingRequest::new(scope, mode, Box::new(job));
        debug!(db = %self.inner.config.name, request = request.id, "submit");
        self.inner.shared.enqueue(request);
        self.pump();
        Request { rx }
    }

    fn check_store(&self, store: &str) -> StoreResult<()> {
        self.schema().require_store(store)?;
        Ok(())
    }

    fn check_query(&self, query: &RangeQuery) -> StoreResult<()> {
        let schema = self.schema();
        let store = schema.require_store(&query.store)?;
        if let Some(index) = &query.index {
            store.require_index(index)?;
        }
        Ok(())
    }

    /// Run `body` in one transaction over `scope`. The transaction commits
    /// when `body` returns `Ok` in read-write mode and rolls back otherwise.
    pub fn transaction<T, F, I, S>(&self, scope: I, mode: TxMode, body: F) -> Request<T>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(&mut dyn RequestExecutor) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let scope: Vec<String> = scope.into_iter().map(Into::into).collect();
        for store in &scope {
            if let Err(e) = self.check_store(store) {
                return Request::ready(Err(e));
            }
        }
        self.submit(scope, RequestMode::Transaction(mode), body)
    }

    fn read<T, F>(&self, store: &str, body: F) -> Request<T>
    where
        F: FnOnce(&mut dyn RequestExecutor) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(vec![store.to_string()], RequestMode::Transaction(TxMode::ReadOnly), body)
    }

    fn write<T, F>(&self, store: &str, body: F) -> Request<T>
    where
        F: FnOnce(&mut dyn RequestExecutor) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(vec![store.to_string()], RequestMode::Transaction(TxMode::ReadWrite), body)
    }

    /// Move to `schema`. Without an explicit newer version the current
    /// version is bumped by one.
    pub fn upgrade(&self, schema: DatabaseSchema) -> Request<()> {
        self.submit(Vec::new(), RequestMode::Upgrade(Arc::new(schema)), |_| Ok(()))
    }

    /// Upgrade to the current schema plus `store`.
    pub fn add_store(&self, store: StoreSchema) -> Request<()> {
        match self.schema().add_store(store) {
            Ok(next) => self.upgrade(next),
            Err(e) => Request::ready(Err(e.into())),
        }
    }

    pub fn get(&self, store: &str, key: impl Into<Key>) -> Request<Option<Value>> {
        if let Err(e) = self.check_store(store) {
            return Request::ready(Err(e));
        }
        let (name, key) = (store.to_string(), key.into());
        self.read(store, move |ex| ex.get_by_id(&name, &key))
    }

    /// The records under each key, in request order.
    pub fn get_all(&self, store: &str, keys: Vec<Key>) -> Request<Vec<Option<Value>>> {
        if let Err(e) = self.check_store(store) {
            return Request::ready(Err(e));
        }
        let name = store.to_string();
        self.read(store, move |ex| ex.list_by_ids(&name, &keys).into_result())
    }

    /// Records matching a store or index range query.
    pub fn get_range(&self, query: RangeQuery) -> Request<Vec<Value>> {
        if let Err(e) = self.check_query(&query) {
            return Request::ready(Err(e));
        }
        let store = query.store.clone();
        self.read(&store, move |ex| {
            if query.index.is_some() {
                ex.list_by_index_key_range(&query)
            } else {
                ex.list_by_key_range(&query)
            }
        })
    }

    /// Primary keys matching a store or index range query.
    pub fn keys(&self, query: RangeQuery) -> Request<Vec<Key>> {
        if let Err(e) = self.check_query(&query) {
            return Request::ready(Err(e));
        }
        let store = query.store.clone();
        self.read(&store, move |ex| {
            if query.index.is_some() {
                ex.keys_by_index_key_range(&query)
            } else {
                ex.keys_by_key_range(&query)
            }
        })
    }

    pub fn entries(&self, query: RangeQuery) -> Request<Vec<(Key, Value)>> {
        if let Err(e) = self.check_query(&query) {
            return Request::ready(Err(e));
        }
        let store = query.store.clone();
        self.read(&store, move |ex| ex.entries_by_key_range(&query))
    }

    /// Insert or overwrite a record.
    pub fn put(&self, store: &str, item: impl Into<WriteItem>) -> Request<Key> {
        if let Err(e) = self.check_store(store) {
            return Request::ready(Err(e));
        }
        let (name, item) = (store.to_string(), item.into());
        self.write(store, move |ex| ex.put_object(&name, &item))
    }

    /// Insert a record that must not exist yet.
    pub fn add(&self, store: &str, item: impl Into<WriteItem>) -> Request<Key> {
        if let Err(e) = self.check_store(store) {
            return Request::ready(Err(e));
        }
        let (name, item) = (store.to_string(), item.into());
        self.write(store, move |ex| ex.add_object(&name, &item))
    }

    /// Put many records in one transaction. Items fail independently.
    pub fn put_all(&self, store: &str, items: Vec<WriteItem>) -> Request<BulkResult<Key>> {
        if let Err(e) = self.check_store(store) {
            return Request::ready(Err(e));
        }
        let name = store.to_string();
        self.write(store, move |ex| Ok(ex.put_objects(&name, &items)))
    }

    /// Add many records in one transaction. Items fail independently.
    pub fn add_all(&self, store: &str, items: Vec<WriteItem>) -> Request<BulkResult<Key>> {
        if let Err(e) = self.check_store(store) {
            return Request::ready(Err(e));
        }
        let name = store.to_string();
        self.write(store, move |ex| Ok(ex.add_objects(&name, &items)))
    }

    pub fn remove(&self, store: &str, key: impl Into<Key>) -> Request<()> {
        if let Err(e) = self.check_store(store) {
            return Request::ready(Err(e));
        }
        let (name, key) = (store.to_string(), key.into());
        self.write(store, move |ex| ex.remove_by_id(&name, &key))
    }

    /// Remove every record with a primary key in `range` (all records when
    /// `None`). Resolves to the number removed.
    pub fn remove_range(&self, store: &str, range: Option<KeyRange>) -> Request<u64> {
        if let Err(e) = self.check_store(store) {
            return Request::ready(Err(e));
        }
        let name = store.to_string();
        self.write(store, move |ex| ex.remove_by_key_range(&name, range.as_ref()))
    }

    /// Remove every record with an index key in `range`.
    pub fn remove_index_range(
        &self,
        store: &str,
        index: &str,
        range: Option<KeyRange>,
    ) -> Request<u64> {
        let query = RangeQuery::new(store).index(index);
        if let Err(e) = self.check_query(&query) {
            return Request::ready(Err(e));
        }
        let (name, index) = (store.to_string(), index.to_string());
        self.write(store, move |ex| {
            ex.remove_by_index_key_range(&name, &index, range.as_ref())
        })
    }

    /// Records (or index entries) matching the query.
    pub fn count(&self, query: RangeQuery) -> Request<u64> {
        if let Err(e) = self.check_query(&query) {
            return Request::ready(Err(e));
        }
        let store = query.store.clone();
        self.read(&store, move |ex| ex.count_key_range(&query))
    }

    /// Record counts of every store, in schema order.
    pub fn count_all(&self) -> Request<Vec<(String, u64)>> {
        let stores = self.store_names();
        self.submit(
            stores.clone(),
            RequestMode::Transaction(TxMode::ReadOnly),
            move |ex| {
                let counts = ex.count_stores(&stores)?;
                Ok(stores.into_iter().zip(counts).collect())
            },
        )
    }

    pub fn clear(&self, store: &str) -> Request<()> {
        if let Err(e) = self.check_store(store) {
            return Request::ready(Err(e));
        }
        let stores = vec![store.to_string()];
        self.write(store, move |ex| ex.clear_by_stores(&stores))
    }

    /// Remove every record of every store.
    pub fn clear_all(&self) -> Request<()> {
        let stores = self.store_names();
        self.submit(
            stores.clone(),
            RequestMode::Transaction(TxMode::ReadWrite),
            move |ex| ex.clear_by_stores(&stores),
        )
    }

    fn store_names(&self) -> Vec<String> {
        self.schema()
            .stores()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }
}
