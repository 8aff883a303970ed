//! Transaction scheduler.
//!
//! One connection runs one transaction at a time. Requests that arrive while
//! the connection is not ready, or while others are waiting, queue in FIFO
//! order. The queue lives in [`SharedState`] so submitters can append to it,
//! and have its capacity enforced, without holding the scheduler. Upgrades
//! run through the same queue and hold the connection in
//! [`ConnectionState::UpgradeInFlight`] for their duration.
//!
//! ```text
//! Disconnected --begin_open--> Connecting --established--> Ready
//!       ^                          |                       |   ^
//!       +-------- failed ----------+            upgrade    v   |
//!                                                   UpgradeInFlight
//! any state --close--> Closed
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tessera_core::DatabaseSchema;
use tracing::{debug, info, warn};

use crate::backend::{BackendKind, Connection};
use crate::config::SchedulerConfig;
use crate::error::{StoreError, StoreResult};
use crate::traits::{RequestExecutor, TxMode};
use crate::upgrade::{next_version, reconcile, Reconcile};

/// Lifecycle of the scheduler's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Ready = 2,
    UpgradeInFlight = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Ready,
            3 => Self::UpgradeInFlight,
            4 => Self::Closed,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::UpgradeInFlight => "upgrade in flight",
            Self::Closed => "closed",
        })
    }
}

/// State, schema and the request queue, shared between the scheduler and
/// its submitters so they can be used without holding the scheduler,
/// including from inside a running transaction.
#[derive(Debug)]
pub struct SharedState {
    name: String,
    state: AtomicU8,
    schema: RwLock<Arc<DatabaseSchema>>,
    capacity: usize,
    queue: Mutex<VecDeque<PendingRequest>>,
}

impl SharedState {
    fn new(name: String, schema: DatabaseSchema, capacity: usize) -> Self {
        Self {
            name,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            schema: RwLock::new(Arc::new(schema)),
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<PendingRequest>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `request` behind everything waiting.
    ///
    /// Once closed the request fails at once. When the queue is full the
    /// oldest waiting request fails with `QueueOverflow`.
    pub fn enqueue(&self, request: PendingRequest) {
        let evicted = {
            let mut queue = self.queue();
            if self.state() == ConnectionState::Closed {
                drop(queue);
                request.fail(StoreError::Closed);
                return;
            }
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(request);
            evicted
        };
        if let Some(oldest) = evicted {
            warn!(
                db = %self.name,
                request = oldest.id,
                capacity = self.capacity,
                "pending queue full, dropping oldest request"
            );
            oldest.fail(StoreError::QueueOverflow(self.capacity));
        }
    }

    fn pop(&self) -> Option<PendingRequest> {
        self.queue().pop_front()
    }

    fn take_all(&self) -> Vec<PendingRequest> {
        self.queue().drain(..).collect()
    }

    /// Requests waiting for the connection.
    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    /// Whether queued requests can make progress: the connection is ready,
    /// or closed and the requests only need failing.
    pub fn runnable(&self) -> bool {
        matches!(self.state(), ConnectionState::Ready | ConnectionState::Closed)
            && !self.queue().is_empty()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The schema in effect. Before the first connect this is the
    /// configured schema.
    pub fn schema(&self) -> Arc<DatabaseSchema> {
        match self.schema.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn set_schema(&self, schema: DatabaseSchema) {
        let schema = Arc::new(schema);
        match self.schema.write() {
            Ok(mut guard) => *guard = schema,
            Err(poisoned) => *poisoned.into_inner() = schema,
        }
    }
}

/// Work carried by a queued request.
pub trait TransactionJob: Send {
    /// Run the requests of the transaction. Return `false` to roll back.
    fn run(&mut self, executor: &mut dyn RequestExecutor) -> bool;

    /// Called exactly once with the outcome of the transaction, or with the
    /// error that kept it from running.
    fn finish(self: Box<Self>, outcome: StoreResult<()>);
}

/// What kind of transaction a request opens.
#[derive(Debug, Clone)]
pub enum RequestMode {
    Transaction(TxMode),
    /// Move to this schema. Its version is assigned when the upgrade runs.
    Upgrade(Arc<DatabaseSchema>),
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A request waiting for the connection.
pub struct PendingRequest {
    pub id: u64,
    pub scope: Vec<String>,
    pub mode: RequestMode,
    pub job: Box<dyn TransactionJob>,
    pub enqueued_at: Instant,
}

impl PendingRequest {
    pub fn new(scope: Vec<String>, mode: RequestMode, job: Box<dyn TransactionJob>) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            scope,
            mode,
            job,
            enqueued_at: Instant::now(),
        }
    }

    fn fail(self, error: StoreError) {
        self.job.finish(Err(error));
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// FIFO scheduler owning the single backend connection.
pub struct Scheduler {
    name: String,
    config: SchedulerConfig,
    configured: DatabaseSchema,
    shared: Arc<SharedState>,
    connection: Option<Connection>,
}

impl Scheduler {
    /// A disconnected scheduler that will reconcile the backend against
    /// `configured` when a connection is established.
    pub fn new(name: impl Into<String>, config: SchedulerConfig, configured: DatabaseSchema) -> Self {
        let name = name.into();
        let shared = SharedState::new(name.clone(), configured.clone(), config.queue_capacity);
        Self {
            name,
            config,
            shared: Arc::new(shared),
            configured,
            connection: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    pub fn backend(&self) -> Option<BackendKind> {
        self.connection.as_ref().map(Connection::kind)
    }

    /// Requests waiting for the connection.
    pub fn pending(&self) -> usize {
        self.shared.pending()
    }

    /// How many queued requests have waited longer than `threshold`.
    pub fn stalled(&self, threshold: Duration) -> usize {
        self.shared
            .queue()
            .iter()
            .filter(|r| r.enqueued_at.elapsed() > threshold)
            .count()
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(db = %self.name, %state, "scheduler state");
        self.shared.set_state(state);
    }

    /// Move to `Connecting`. Returns `false` when a connection is already
    /// open or being opened.
    pub fn begin_open(&mut self) -> StoreResult<bool> {
        match self.state() {
            ConnectionState::Disconnected => {
                self.set_state(ConnectionState::Connecting);
                Ok(true)
            }
            ConnectionState::Closed => Err(StoreError::Closed),
            _ => Ok(false),
        }
    }

    /// Adopt a freshly opened connection: reconcile the persisted schema,
    /// upgrading first when needed, then run every queued request.
    pub fn connection_established(&mut self, mut conn: Connection) -> StoreResult<()> {
        if self.state() == ConnectionState::Closed {
            return Err(StoreError::Closed);
        }
        let result = conn.load_schema().and_then(|stored| {
            match reconcile(stored.clone(), &self.configured)? {
                Reconcile::Adopt(schema) => Ok(schema),
                Reconcile::Upgrade(target) => {
                    self.set_state(ConnectionState::UpgradeInFlight);
                    info!(
                        db = %self.name,
                        from = ?stored.as_ref().and_then(DatabaseSchema::version),
                        to = ?target.version(),
                        "upgrading schema on connect"
                    );
                    conn.upgrade(stored.as_ref(), &target, &mut |_| true)?;
                    Ok(target)
                }
            }
        });
        let schema = match result {
            Ok(schema) => schema,
            Err(e) => {
                self.connection_failed(&e);
                return Err(e);
            }
        };
        info!(
            db = %self.name,
            backend = %conn.kind(),
            version = ?schema.version(),
            "connection ready"
        );
        self.shared.set_schema(schema);
        self.connection = Some(conn);
        self.set_state(ConnectionState::Ready);
        self.drain();
        Ok(())
    }

    /// Opening failed: go back to `Disconnected` and fail every queued
    /// request.
    pub fn connection_failed(&mut self, error: &StoreError) {
        warn!(db = %self.name, %error, "connection failed");
        self.connection = None;
        self.set_state(ConnectionState::Disconnected);
        self.purge(StoreError::Connection(format!("connection failed: {error}")));
    }

    /// Close the connection. Queued requests fail with `Closed`, as does
    /// everything submitted afterwards.
    pub fn close(&mut self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        info!(db = %self.name, pending = self.pending(), "closing");
        self.connection = None;
        self.set_state(ConnectionState::Closed);
        self.purge(StoreError::Closed);
    }

    fn purge(&mut self, error: StoreError) {
        for request in self.shared.take_all() {
            request.fail(error.clone());
        }
    }

    /// Queue `request` and run whatever the connection can run now.
    pub fn submit(&mut self, request: PendingRequest) {
        self.shared.enqueue(request);
        self.drain();
    }

    /// Run queued requests in order while the connection is ready. Once
    /// closed, fail whatever is still queued.
    pub fn drain(&mut self) {
        loop {
            match self.state() {
                ConnectionState::Ready => {
                    let Some(request) = self.shared.pop() else {
                        break;
                    };
                    self.execute(request);
                }
                ConnectionState::Closed => {
                    self.purge(StoreError::Closed);
                    break;
                }
                _ => break,
            }
        }
    }

    fn execute(&mut self, request: PendingRequest) {
        let waited = request.enqueued_at.elapsed();
        if waited > self.config.stall_warning() {
            warn!(
                db = %self.name,
                request = request.id,
                waited_ms = waited.as_millis() as u64,
                "request waited past the stall threshold"
            );
        }
        let PendingRequest {
            id,
            scope,
            mode,
            mut job,
            ..
        } = request;
        let Some(conn) = self.connection.as_mut() else {
            job.finish(Err(StoreError::Connection("no open connection".into())));
            return;
        };
        let current = self.shared.schema();

        let outcome = match mode {
            RequestMode::Transaction(tx_mode) => {
                match scope.iter().find(|s| !current.has_store(s)) {
                    Some(missing) => Err(StoreError::NotFound(format!("store {missing}"))),
                    None => {
                        debug!(db = %self.name, request = id, ?tx_mode, ?scope, "transaction");
                        conn.run(&current, &scope, tx_mode, &mut |ex| job.run(ex))
                    }
                }
            }
            RequestMode::Upgrade(target) => match next_version(&current, &target) {
                Err(e) => Err(e),
                Ok(version) => {
                    let target = (*target).clone().with_version(version);
                    self.shared.set_state(ConnectionState::UpgradeInFlight);
                    info!(db = %self.name, request = id, version, "upgrade");
                    let result = conn.upgrade(Some(&current), &target, &mut |ex| job.run(ex));
                    if result.is_ok() {
                        self.shared.set_schema(target);
                    }
                    self.shared.set_state(ConnectionState::Ready);
                    result
                }
            },
        };
        job.finish(outcome);
    }
}
