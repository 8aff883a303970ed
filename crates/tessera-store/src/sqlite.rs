//! SQLite backend using rusqlite.
//!
//! Stores, indexes and multiEntry tables are laid out by [`crate::sql`].
//! Every logical transaction is one SQLite transaction; each item of a write
//! runs in its own savepoint so a failing item rolls back alone.
//!
//! ```no_run
//! use tessera_core::{DatabaseSchema, StoreSchema};
//! use tessera_store::{SqliteConnection, TxMode, WriteItem};
//! use serde_json::json;
//!
//! let schema = DatabaseSchema::new(vec![StoreSchema::new("people").with_key_path("id")])
//!     .unwrap()
//!     .with_version(1);
//! let mut conn = SqliteConnection::open("people.db").unwrap();
//! conn.upgrade(None, &schema, &mut |_| true).unwrap();
//! conn.run(&schema, &["people".to_string()], TxMode::ReadWrite, &mut |ex| {
//!     ex.put_object("people", &WriteItem::new(json!({"id": 1}))).is_ok()
//! })
//! .unwrap();
//! ```

use std::path::Path;

use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tessera_core::{DatabaseSchema, Key, KeyRange, SchemaConfig, StoreSchema};
use tracing::debug;

use crate::codec::{decode_sql, encode_sql, SqlValue};
use crate::config::SqliteConfig;
use crate::cursor::resolve_key;
use crate::error::{ErrorContext, StoreError, StoreResult};
use crate::sql::{
    compile, create_meta, create_store, drop_store, entry_columns, key_column, quote,
    store_columns, QueryKind, DATA_COLUMN, META_TABLE,
};
use crate::traits::{BulkResult, RangeQuery, RequestExecutor, TransactionBody, TxMode, WriteItem};
use crate::upgrade::UpgradePlan;

const SCHEMA_KEY: &str = "schema";

// ── Error type ──────────────────────────────────────────────────────

/// Error raised while opening or configuring a SQLite database.
#[derive(Debug)]
pub struct SqliteError(rusqlite::Error);

impl std::fmt::Display for SqliteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sqlite error: {}", self.0)
    }
}

impl std::error::Error for SqliteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<rusqlite::Error> for SqliteError {
    fn from(e: rusqlite::Error) -> Self {
        Self(e)
    }
}

impl From<SqliteError> for StoreError {
    fn from(e: SqliteError) -> Self {
        sql_error(&ErrorContext::default(), e.0)
    }
}

/// Constraint failures become constraint errors; everything else is a
/// backend error.
fn sql_error(ctx: &ErrorContext, e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            let message = message.clone().unwrap_or_else(|| e.to_string());
            StoreError::constraint(ctx.clone(), message)
        }
        _ => StoreError::backend(ctx.clone(), SqliteError(e)),
    }
}

fn to_sqlite(value: &SqlValue) -> SqliteValue {
    match value {
        SqlValue::Null => SqliteValue::Null,
        SqlValue::Integer(i) => SqliteValue::Integer(*i),
        SqlValue::Real(f) => SqliteValue::Real(*f),
        SqlValue::Text(s) => SqliteValue::Text(s.clone()),
        SqlValue::Blob(b) => SqliteValue::Blob(b.clone()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

fn decode_record(value: ValueRef<'_>, ctx: &ErrorContext) -> StoreResult<Value> {
    let bytes = match value {
        ValueRef::Text(t) | ValueRef::Blob(t) => t,
        other => {
            return Err(StoreError::data_clone(
                ctx.clone(),
                format!("unexpected {:?} in the record column", other.data_type()),
            ))
        }
    };
    serde_json::from_slice(bytes).map_err(|e| StoreError::data_clone(ctx.clone(), e))
}

// ── Executor ────────────────────────────────────────────────────────

/// [`RequestExecutor`] over one open SQLite transaction.
pub struct SqlExecutor<'t> {
    conn: &'t Connection,
    schema: &'t DatabaseSchema,
    scope: &'t [String],
    mode: TxMode,
}

impl<'t> SqlExecutor<'t> {
    pub fn new(
        conn: &'t Connection,
        schema: &'t DatabaseSchema,
        scope: &'t [String],
        mode: TxMode,
    ) -> Self {
        Self {
            conn,
            schema,
            scope,
            mode,
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

    fn execute(&self, sql: &str, params: &[SqlValue], ctx: &ErrorContext) -> StoreResult<usize> {
        let wrap = |e| sql_error(ctx, e);
        let mut stmt = self.conn.prepare_cached(sql).map_err(wrap)?;
        stmt.execute(params_from_iter(params.iter().map(to_sqlite)))
            .map_err(wrap)
    }

    fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
        ctx: &ErrorContext,
        mut f: impl FnMut(&rusqlite::Row<'_>) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let wrap = |e| sql_error(ctx, e);
        let mut stmt = self.conn.prepare_cached(sql).map_err(wrap)?;
        let mut rows = stmt
            .query(params_from_iter(params.iter().map(to_sqlite)))
            .map_err(wrap)?;
        while let Some(row) = rows.next().map_err(wrap)? {
            f(row)?;
        }
        Ok(())
    }

    fn savepoint<T>(&self, f: impl FnOnce(&Self) -> StoreResult<T>) -> StoreResult<T> {
        let ctx = ErrorContext::op("savepoint");
        let wrap = |e| sql_error(&ctx, e);
        self.conn.execute_batch("SAVEPOINT tessera_item").map_err(wrap)?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("RELEASE tessera_item").map_err(wrap)?;
                Ok(value)
            }
            Err(e) => {
                self.conn
                    .execute_batch("ROLLBACK TO tessera_item; RELEASE tessera_item")
                    .map_err(wrap)?;
                Err(e)
            }
        }
    }

    /// Next key for an auto-increment store: one past both the sequence and
    /// the largest stored key.
    fn next_generated(&self, store: &StoreSchema, ctx: &ErrorContext) -> StoreResult<Key> {
        let key = key_column(store);
        let sql = format!(
            "SELECT MAX(COALESCE((SELECT seq FROM sqlite_sequence WHERE name = ?), 0), \
             COALESCE((SELECT MAX({}) FROM {}), 0)) + 1",
            key.quoted(),
            quote(store.name())
        );
        let mut next = None;
        self.query(&sql, &[SqlValue::Text(store.name().to_string())], ctx, |row| {
            next = Some(row.get::<_, i64>(0).map_err(|e| sql_error(ctx, e))?);
            Ok(())
        })?;
        Ok(Key::Number(next.unwrap_or(1) as f64))
    }

    fn delete_row(&self, store: &StoreSchema, pk: &SqlValue, ctx: &ErrorContext) -> StoreResult<bool> {
        let key = key_column(store);
        for (_, column) in entry_columns(store) {
            let sql = format!("DELETE FROM {} WHERE {} = ?", quote(&column.table), key.quoted());
            self.execute(&sql, std::slice::from_ref(pk), ctx)?;
        }
        let sql = format!("DELETE FROM {} WHERE {} = ?", quote(store.name()), key.quoted());
        Ok(self.execute(&sql, std::slice::from_ref(pk), ctx)? > 0)
    }

    fn write_one(&mut self, store_name: &str, item: &WriteItem, overwrite: bool) -> StoreResult<Key> {
        let op = if overwrite { "put" } else { "add" };
        self.writable(op)?;
        let store = self.store(store_name)?;
        let ctx = ErrorContext::op(op).store(store_name);
        let (key, record, _) = resolve_key(store, item, &ctx, || self.next_generated(store, &ctx))?;
        let ctx = ctx.key(&key);

        let key_col = key_column(store);
        let pk = encode_sql(&key, &key_col.encoding).map_err(|e| e.with_context(&ctx))?;
        let stored = store.project_fixed(&record);
        let data =
            serde_json::to_string(&stored).map_err(|e| StoreError::data_clone(ctx.clone(), e))?;

        let mut columns = vec![key_col.quoted()];
        let mut values = vec![pk.clone()];
        for (index, column) in store_columns(store) {
            columns.push(column.quoted());
            values.push(
                index
                    .extract_key(&stored)
                    .and_then(|k| encode_sql(&k, &column.encoding).ok())
                    .unwrap_or(SqlValue::Null),
            );
        }
        columns.push(quote(DATA_COLUMN));
        values.push(SqlValue::Text(data));
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(store.name()),
            columns.join(", "),
            vec!["?"; values.len()].join(", ")
        );

        self.savepoint(|ex| {
            if overwrite {
                ex.delete_row(store, &pk, &ctx)?;
            }
            ex.execute(&insert, &values, &ctx)?;
            for (index, column) in entry_columns(store) {
                let sql = format!(
                    "INSERT INTO {} ({}, {}) VALUES (?, ?)",
                    quote(&column.table),
                    key_col.quoted(),
                    column.quoted()
                );
                for index_key in index.index_keys(&stored) {
                    if let Ok(value) = encode_sql(&index_key, &column.encoding) {
                        ex.execute(&sql, &[pk.clone(), value], &ctx)?;
                    }
                }
            }
            Ok(())
        })?;
        debug!(store = store_name, key = %key, op, "record written");
        Ok(key)
    }

    fn select_keys(&self, store: &StoreSchema, query: &RangeQuery) -> StoreResult<Vec<Key>> {
        let compiled = compile(store, QueryKind::Keys, query)?;
        let encoding = key_column(store).encoding;
        let ctx = ErrorContext::op("keys").store(store.name());
        let mut out = Vec::new();
        self.query(
            &compiled.to_sql(query.limit, query.offset),
            &compiled.params,
            &ctx,
            |row| {
                let raw = row.get_ref(0).map_err(|e| sql_error(&ctx, e))?;
                out.push(decode_sql(&from_sqlite(raw), &encoding).map_err(|e| e.with_context(&ctx))?);
                Ok(())
            },
        )?;
        Ok(out)
    }

    fn remove_keys(&self, store: &StoreSchema, keys: &[Key]) -> StoreResult<u64> {
        let encoding = key_column(store).encoding;
        let mut removed = 0;
        for key in keys {
            let ctx = ErrorContext::op("remove").store(store.name()).key(key);
            let pk = encode_sql(key, &encoding).map_err(|e| e.with_context(&ctx))?;
            if self.delete_row(store, &pk, &ctx)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn restore_sequence(&self, store: &str, seq: i64) -> StoreResult<()> {
        let ctx = ErrorContext::op("upgrade").store(store);
        let name = SqlValue::Text(store.to_string());
        let updated = self.execute(
            "UPDATE sqlite_sequence SET seq = MAX(seq, ?) WHERE name = ?",
            &[SqlValue::Integer(seq), name.clone()],
            &ctx,
        )?;
        if updated == 0 {
            self.execute(
                "INSERT INTO sqlite_sequence (name, seq) VALUES (?, ?)",
                &[name, SqlValue::Integer(seq)],
                &ctx,
            )?;
        }
        Ok(())
    }

    fn sequence(&self, store: &str) -> StoreResult<Option<i64>> {
        let ctx = ErrorContext::op("upgrade").store(store);
        let mut seq = None;
        self.query(
            "SELECT seq FROM sqlite_sequence WHERE name = ?",
            &[SqlValue::Text(store.to_string())],
            &ctx,
            |row| {
                seq = Some(row.get::<_, i64>(0).map_err(|e| sql_error(&ctx, e))?);
                Ok(())
            },
        )?;
        Ok(seq)
    }
}

impl RequestExecutor for SqlExecutor<'_> {
    fn get_by_id(&mut self, store: &str, key: &Key) -> StoreResult<Option<Value>> {
        let s = self.store(store)?;
        let ctx = ErrorContext::op("get").store(store).key(key);
        let key_col = key_column(s);
        let pk = encode_sql(key, &key_col.encoding).map_err(|e| e.with_context(&ctx))?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            quote(DATA_COLUMN),
            quote(store),
            key_col.quoted()
        );
        let mut found = None;
        self.query(&sql, &[pk], &ctx, |row| {
            let raw = row.get_ref(0).map_err(|e| sql_error(&ctx, e))?;
            found = Some(decode_record(raw, &ctx)?);
            Ok(())
        })?;
        Ok(found)
    }

    fn list_by_ids(&mut self, store: &str, keys: &[Key]) -> BulkResult<Option<Value>> {
        BulkResult::new(keys.iter().map(|k| self.get_by_id(store, k)).collect())
    }

    fn list_by_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<Value>> {
        let store = self.store(&query.store)?;
        let compiled = compile(store, QueryKind::Values, query)?;
        let ctx = ErrorContext::op("list").store(&query.store);
        let mut out = Vec::new();
        self.query(
            &compiled.to_sql(query.limit, query.offset),
            &compiled.params,
            &ctx,
            |row| {
                let raw = row.get_ref(0).map_err(|e| sql_error(&ctx, e))?;
                out.push(decode_record(raw, &ctx)?);
                Ok(())
            },
        )?;
        Ok(out)
    }

    fn list_by_index_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<Value>> {
        if query.index.is_none() {
            return Err(StoreError::InvalidArgument("index query without an index".into()));
        }
        self.list_by_key_range(query)
    }

    fn keys_by_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<Key>> {
        let store = self.store(&query.store)?;
        self.select_keys(store, query)
    }

    fn keys_by_index_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<Key>> {
        if query.index.is_none() {
            return Err(StoreError::InvalidArgument("index query without an index".into()));
        }
        self.keys_by_key_range(query)
    }

    fn entries_by_key_range(&mut self, query: &RangeQuery) -> StoreResult<Vec<(Key, Value)>> {
        let store = self.store(&query.store)?;
        let compiled = compile(store, QueryKind::Entries, query)?;
        let encoding = key_column(store).encoding;
        let ctx = ErrorContext::op("list").store(&query.store);
        let mut out = Vec::new();
        self.query(
            &compiled.to_sql(query.limit, query.offset),
            &compiled.params,
            &ctx,
            |row| {
                let raw_key = row.get_ref(0).map_err(|e| sql_error(&ctx, e))?;
                let key = decode_sql(&from_sqlite(raw_key), &encoding)?;
                let raw = row.get_ref(1).map_err(|e| sql_error(&ctx, e))?;
                out.push((key, decode_record(raw, &ctx)?));
                Ok(())
            },
        )?;
        Ok(out)
    }

    fn count_stores(&mut self, stores: &[String]) -> StoreResult<Vec<u64>> {
        stores
            .iter()
            .map(|name| self.count_key_range(&RangeQuery::new(name.as_str())))
            .collect()
    }

    fn count_key_range(&mut self, query: &RangeQuery) -> StoreResult<u64> {
        let store = self.store(&query.store)?;
        let compiled = compile(store, QueryKind::Count, query)?;
        let ctx = ErrorContext::op("count").store(&query.store);
        let mut count = 0;
        self.query(&compiled.to_sql(None, 0), &compiled.params, &ctx, |row| {
            count = row.get::<_, i64>(0).map_err(|e| sql_error(&ctx, e))?;
            Ok(())
        })?;
        Ok(count.max(0) as u64)
    }

    fn add_object(&mut self, store: &str, item: &WriteItem) -> StoreResult<Key> {
        self.write_one(store, item, false)
    }

    fn add_objects(&mut self, store: &str, items: &[WriteItem]) -> BulkResult<Key> {
        BulkResult::new(items.iter().map(|i| self.write_one(store, i, false)).collect())
    }

    fn put_object(&mut self, store: &str, item: &WriteItem) -> StoreResult<Key> {
        self.write_one(store, item, true)
    }

    fn put_objects(&mut self, store: &str, items: &[WriteItem]) -> BulkResult<Key> {
        BulkResult::new(items.iter().map(|i| self.write_one(store, i, true)).collect())
    }

    fn remove_by_id(&mut self, store: &str, key: &Key) -> StoreResult<()> {
        self.writable("remove")?;
        let s = self.store(store)?;
        self.remove_keys(s, std::slice::from_ref(key))?;
        Ok(())
    }

    fn remove_by_key_range(&mut self, store: &str, range: Option<&KeyRange>) -> StoreResult<u64> {
        self.writable("remove")?;
        let s = self.store(store)?;
        let mut query = RangeQuery::new(store);
        query.range = range.cloned();
        let keys = self.select_keys(s, &query)?;
        self.remove_keys(s, &keys)
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
        let keys = self.select_keys(s, &query)?;
        self.remove_keys(s, &keys)
    }

    fn clear_by_stores(&mut self, stores: &[String]) -> StoreResult<()> {
        self.writable("clear")?;
        for name in stores {
            let s = self.store(name)?;
            let ctx = ErrorContext::op("clear").store(name);
            for (_, column) in entry_columns(s) {
                self.execute(&format!("DELETE FROM {}", quote(&column.table)), &[], &ctx)?;
            }
            self.execute(&format!("DELETE FROM {}", quote(name)), &[], &ctx)?;
        }
        Ok(())
    }
}

// ── Connection ──────────────────────────────────────────────────────

/// One SQLite database used as a tessera backend.
pub struct SqliteConnection {
    conn: Connection,
}

impl SqliteConnection {
    /// Open (or create) a SQLite database at the given path with default config.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SqliteError> {
        Self::open_with_config(path, &SqliteConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: &SqliteConfig,
    ) -> Result<Self, SqliteError> {
        Self::init(Connection::open(path)?, config)
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, SqliteError> {
        Self::open_in_memory_with_config(&SqliteConfig::default())
    }

    pub fn open_in_memory_with_config(config: &SqliteConfig) -> Result<Self, SqliteError> {
        Self::init(Connection::open_in_memory()?, config)
    }

    fn init(conn: Connection, config: &SqliteConfig) -> Result<Self, SqliteError> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA busy_timeout = {};
             PRAGMA page_size = {};
             PRAGMA foreign_keys = ON;
             PRAGMA case_sensitive_like = ON;
             PRAGMA synchronous = NORMAL;",
            config.journal_mode.as_str(),
            config.busy_timeout_ms,
            config.page_size,
        ))?;
        conn.execute_batch(&create_meta())?;
        Ok(Self { conn })
    }

    /// The current journal mode.
    pub fn journal_mode(&self) -> Result<String, SqliteError> {
        let mode: String = self
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        Ok(mode)
    }

    /// The schema persisted by the last successful upgrade.
    pub fn load_schema(&self) -> StoreResult<Option<DatabaseSchema>> {
        let sql = format!(
            "SELECT \"value\" FROM {} WHERE \"key\" = ?1",
            quote(META_TABLE)
        );
        let text: Option<String> = self
            .conn
            .query_row(&sql, [SCHEMA_KEY], |row| row.get(0))
            .optional()
            .map_err(|e| sql_error(&ErrorContext::op("load_schema"), e))?;
        let Some(text) = text else {
            return Ok(None);
        };
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
        let ctx = ErrorContext::op("transaction");
        let behavior = match mode {
            TxMode::ReadOnly => TransactionBehavior::Deferred,
            TxMode::ReadWrite => TransactionBehavior::Immediate,
        };
        let tx = self
            .conn
            .transaction_with_behavior(behavior)
            .map_err(|e| sql_error(&ctx, e))?;
        let commit = {
            let mut executor = SqlExecutor::new(&tx, schema, scope, mode);
            body(&mut executor)
        };
        let done = if commit && mode == TxMode::ReadWrite {
            tx.commit()
        } else {
            tx.rollback()
        };
        done.map_err(|e| sql_error(&ctx, e))
    }

    /// Move the database from `old` to `new` in one transaction, then run
    /// `body` against the new schema before committing.
    pub fn upgrade(
        &mut self,
        old: Option<&DatabaseSchema>,
        new: &DatabaseSchema,
        body: &mut TransactionBody<'_>,
    ) -> StoreResult<()> {
        let ctx = ErrorContext::op("upgrade");
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| sql_error(&ctx, e))?;
        match apply_upgrade(&tx, old, new, body) {
            Ok(true) => tx.commit().map_err(|e| sql_error(&ctx, e)),
            Ok(false) => {
                tx.rollback().map_err(|e| sql_error(&ctx, e))?;
                Err(StoreError::Connection("upgrade transaction was aborted".into()))
            }
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }
}

fn store_names(schema: &DatabaseSchema) -> Vec<String> {
    schema.stores().iter().map(|s| s.name().to_string()).collect()
}

fn apply_upgrade(
    conn: &Connection,
    old: Option<&DatabaseSchema>,
    new: &DatabaseSchema,
    body: &mut TransactionBody<'_>,
) -> StoreResult<bool> {
    let ctx = ErrorContext::op("upgrade");
    let plan = UpgradePlan::between(old, new);
    let mut carried = Vec::new();
    if let Some(old) = old {
        let scope = store_names(old);
        let mut reader = SqlExecutor::new(conn, old, &scope, TxMode::ReadOnly);
        for name in &plan.rebuilt {
            let seq = if old.require_store(name)?.auto_increment() {
                reader.sequence(name)?
            } else {
                None
            };
            let entries = reader.entries_by_key_range(&RangeQuery::new(name.as_str()))?;
            carried.push((name.clone(), entries, seq));
        }
        for name in plan.dropped.iter().chain(&plan.rebuilt) {
            for sql in drop_store(old.require_store(name)?) {
                conn.execute_batch(&sql).map_err(|e| sql_error(&ctx, e))?;
            }
        }
    }
    for name in plan.created.iter().chain(&plan.rebuilt) {
        for sql in create_store(new.require_store(name)?) {
            conn.execute_batch(&sql).map_err(|e| sql_error(&ctx, e))?;
        }
    }

    let scope = store_names(new);
    let mut writer = SqlExecutor::new(conn, new, &scope, TxMode::ReadWrite);
    for (name, entries, seq) in carried {
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
        if let (Some(seq), true) = (seq, store.auto_increment()) {
            writer.restore_sequence(&name, seq)?;
        }
    }
    let config = new.to_config().to_json_string()?;
    writer.execute(
        &format!(
            "INSERT OR REPLACE INTO {} (\"key\", \"value\") VALUES (?, ?)",
            quote(META_TABLE)
        ),
        &[SqlValue::Text(SCHEMA_KEY.into()), SqlValue::Text(config)],
        &ctx,
    )?;
    Ok(body(&mut writer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
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
        ])
        .unwrap()
        .with_version(1)
    }

    fn open() -> (SqliteConnection, DatabaseSchema) {
        let schema = schema();
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.upgrade(None, &schema, &mut |_| true).unwrap();
        (conn, schema)
    }

    fn write<T>(
        conn: &mut SqliteConnection,
        schema: &DatabaseSchema,
        f: impl FnOnce(&mut dyn RequestExecutor) -> T,
    ) -> T {
        let scope = store_names(schema);
        let mut f = Some(f);
        let mut out = None;
        conn.run(schema, &scope, TxMode::ReadWrite, &mut |ex| {
            if let Some(f) = f.take() {
                out = Some(f(ex));
            }
            true
        })
        .unwrap();
        out.unwrap()
    }

    fn table_rows(conn: &SqliteConnection, table: &str) -> i64 {
        conn.conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", quote(table)), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn multi_entry_rows_follow_the_record() {
        let (mut conn, schema) = open();
        write(&mut conn, &schema, |ex| {
            ex.put_object("S", &WriteItem::new(json!({"id": 1, "tags": ["a", "b", "a"]})))
                .unwrap();
        });
        assert_eq!(table_rows(&conn, "__me__S:tags"), 2);
        write(&mut conn, &schema, |ex| {
            ex.put_object("S", &WriteItem::new(json!({"id": 1, "tags": ["c"]}))).unwrap();
        });
        assert_eq!(table_rows(&conn, "__me__S:tags"), 1);
        write(&mut conn, &schema, |ex| ex.remove_by_id("S", &Key::from(1)).unwrap());
        assert_eq!(table_rows(&conn, "__me__S:tags"), 0);
    }

    #[test]
    fn failing_bulk_items_roll_back_alone() {
        let (mut conn, schema) = open();
        let bulk = write(&mut conn, &schema, |ex| {
            ex.add_objects(
                "S",
                &[
                    WriteItem::new(json!({"id": 1, "email": "a@x", "tags": ["t"]})),
                    WriteItem::new(json!({"id": 2, "email": "a@x", "tags": ["u"]})),
                    WriteItem::new(json!({"id": 1})),
                    WriteItem::new(json!({"id": 3})),
                ],
            )
        });
        assert_eq!(bulk.succeeded(), 2);
        let kinds: Vec<_> = bulk
            .results()
            .iter()
            .map(|r| r.as_ref().err().map(StoreError::kind))
            .collect();
        assert_eq!(
            kinds,
            vec![None, Some(ErrorKind::Constraint), Some(ErrorKind::Constraint), None]
        );
        // the rejected second item left no synthetic rows behind
        assert_eq!(table_rows(&conn, "__me__S:tags"), 1);
    }

    #[test]
    fn auto_increment_generates_and_follows_explicit_keys() {
        let (mut conn, schema) = open();
        let keys = write(&mut conn, &schema, |ex| {
            let a = ex.add_object("auto", &WriteItem::new(json!({"v": 1}))).unwrap();
            let b = ex.add_object("auto", &WriteItem::new(json!({"id": 10}))).unwrap();
            let c = ex.add_object("auto", &WriteItem::new(json!({"v": 2}))).unwrap();
            (a, b, c, ex.get_by_id("auto", &Key::from(11)).unwrap())
        });
        assert_eq!(keys.0, Key::from(1));
        assert_eq!(keys.1, Key::from(10));
        assert_eq!(keys.2, Key::from(11));
        assert_eq!(keys.3, Some(json!({"id": 11, "v": 2})));
    }

    #[test]
    fn read_only_transactions_reject_writes() {
        let (mut conn, schema) = open();
        let scope = store_names(&schema);
        let mut kind = None;
        conn.run(&schema, &scope, TxMode::ReadOnly, &mut |ex| {
            kind = ex.put_object("S", &WriteItem::new(json!({"id": 1}))).err().map(|e| e.kind());
            true
        })
        .unwrap();
        assert_eq!(kind, Some(ErrorKind::InvalidArgument));
    }

    #[test]
    fn prefix_queries_are_case_sensitive() {
        let schema = DatabaseSchema::new(vec![StoreSchema::new("t")
            .with_key_path("name")
            .with_key_type(DataType::Text)])
        .unwrap();
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.upgrade(None, &schema, &mut |_| true).unwrap();
        let keys = write(&mut conn, &schema, |ex| {
            for name in ["ab", "Ab", "abc", "b", "a%"] {
                ex.put_object("t", &WriteItem::new(json!({ "name": name }))).unwrap();
            }
            ex.keys_by_key_range(&RangeQuery::new("t").range(KeyRange::starts_with("ab")))
                .unwrap()
        });
        assert_eq!(keys, vec![Key::from("ab"), Key::from("abc")]);
    }

    #[test]
    fn upgrade_rebuilds_and_persists_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        let v1 = schema();
        {
            let mut conn = SqliteConnection::open(&path).unwrap();
            assert_eq!(conn.journal_mode().unwrap(), "wal");
            conn.upgrade(None, &v1, &mut |_| true).unwrap();
            write(&mut conn, &v1, |ex| {
                ex.put_object("S", &WriteItem::new(json!({"id": 1, "name": "ann"}))).unwrap();
            });
        }
        let v2 = DatabaseSchema::new(vec![StoreSchema::new("S")
            .with_key_path("id")
            .with_key_type(DataType::Numeric)
            .with_index(IndexSchema::new("name"))])
        .unwrap()
        .with_version(2);
        let mut conn = SqliteConnection::open(&path).unwrap();
        assert_eq!(conn.load_schema().unwrap(), Some(v1.clone()));
        conn.upgrade(Some(&v1), &v2, &mut |_| true).unwrap();
        assert_eq!(conn.load_schema().unwrap(), Some(v2.clone()));
        let names = write(&mut conn, &v2, |ex| {
            ex.list_by_index_key_range(&RangeQuery::new("S").index("name")).unwrap()
        });
        assert_eq!(names, vec![json!({"id": 1, "name": "ann"})]);
    }
}
