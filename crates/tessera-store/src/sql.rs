//! SQL text for the relational backend: table layout, DDL and range queries.
//!
//! Each store is one table:
//!
//! * the primary key column, named after the key path (or `__key__` for
//!   out-of-line keys);
//! * one column per index that is neither multiEntry nor on the key path;
//! * `__data__`, the record as JSON text.
//!
//! A multiEntry index gets a synthetic table `__me__<store>:<index>` with
//! one row per element, joined back to the store on the primary key.
//!
//! Column names of the store table and of a synthetic table can coincide,
//! so every generated column reference is qualified with its table.

use tessera_core::{IndexSchema, KeyRange, StoreSchema};

use crate::codec::{encode_bound, encode_sql, BoundSide, ColumnEncoding, SqlBound, SqlValue};
use crate::error::{StoreError, StoreResult};
use crate::traits::{Direction, RangeQuery};

/// Column holding the record JSON.
pub const DATA_COLUMN: &str = "__data__";
/// Primary key column of stores without a key path.
pub const KEY_COLUMN: &str = "__key__";
/// Table holding the persisted schema.
pub const META_TABLE: &str = "__meta__";

/// Quote an identifier for SQLite.
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Name of the synthetic table backing a multiEntry index.
pub fn entry_table(store: &str, index: &str) -> String {
    format!("__me__{store}:{index}")
}

fn index_name(store: &str, index: &str) -> String {
    format!("__ix__{store}:{index}")
}

/// A named column and how keys are laid out in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub table: String,
    pub name: String,
    pub encoding: ColumnEncoding,
}

impl Column {
    /// `"table"."column"`.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote(&self.table), quote(&self.name))
    }

    pub fn quoted(&self) -> String {
        quote(&self.name)
    }
}

/// Where the keys of an index live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexColumn {
    /// The index is on the key path; it reuses the primary key column.
    PrimaryKey(Column),
    /// A column of the store table.
    Store(Column),
    /// The value column of a synthetic multiEntry table.
    Entries(Column),
}

impl IndexColumn {
    pub fn column(&self) -> &Column {
        match self {
            Self::PrimaryKey(c) | Self::Store(c) | Self::Entries(c) => c,
        }
    }
}

/// The primary key column of a store.
///
/// Auto-increment stores use an `INTEGER` rowid column so SQLite can
/// generate keys.
pub fn key_column(store: &StoreSchema) -> Column {
    let name = store
        .key_path()
        .map_or_else(|| KEY_COLUMN.to_string(), |kp| kp.text());
    let encoding = if store.auto_increment() {
        ColumnEncoding::Integer
    } else {
        ColumnEncoding::for_key(store.key_path(), store.key_type())
    };
    Column {
        table: store.name().to_string(),
        name,
        encoding,
    }
}

/// Where the keys of `index` are stored.
pub fn index_column(store: &StoreSchema, index: &IndexSchema) -> IndexColumn {
    let path = index.key_path().text();
    if index.multi_entry() {
        return IndexColumn::Entries(Column {
            table: entry_table(store.name(), index.name()),
            name: path,
            encoding: ColumnEncoding::for_entry(index.key_type()),
        });
    }
    let key = key_column(store);
    if store.key_path().is_some() && key.name == path {
        return IndexColumn::PrimaryKey(key);
    }
    IndexColumn::Store(Column {
        table: store.name().to_string(),
        name: path,
        encoding: ColumnEncoding::for_key(Some(index.key_path()), index.key_type()),
    })
}

/// Index columns that live on the store table, paired with their index.
pub fn store_columns(store: &StoreSchema) -> Vec<(&IndexSchema, Column)> {
    store
        .indexes()
        .iter()
        .filter_map(|index| match index_column(store, index) {
            IndexColumn::Store(column) => Some((index, column)),
            _ => None,
        })
        .collect()
}

/// multiEntry indexes of a store, paired with their synthetic value column.
pub fn entry_columns(store: &StoreSchema) -> Vec<(&IndexSchema, Column)> {
    store
        .indexes()
        .iter()
        .filter_map(|index| match index_column(store, index) {
            IndexColumn::Entries(column) => Some((index, column)),
            _ => None,
        })
        .collect()
}

// ── DDL ─────────────────────────────────────────────────────────────

/// `CREATE TABLE` for the schema metadata.
pub fn create_meta() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\"key\" TEXT PRIMARY KEY NOT NULL, \"value\" TEXT NOT NULL)",
        quote(META_TABLE)
    )
}

/// Statements creating a store table, its indexes and synthetic tables.
pub fn create_store(store: &StoreSchema) -> Vec<String> {
    let key = key_column(store);
    let mut columns = Vec::new();
    if store.auto_increment() {
        columns.push(format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", key.quoted()));
    } else {
        columns.push(format!(
            "{} {} PRIMARY KEY NOT NULL",
            key.quoted(),
            key.encoding.sql_type()
        ));
    }
    let mut statements = Vec::new();
    for (index, column) in store_columns(store) {
        let unique = if index.unique() { " UNIQUE" } else { "" };
        columns.push(format!("{} {}{unique}", column.quoted(), column.encoding.sql_type()));
        if !index.unique() {
            statements.push(format!(
                "CREATE INDEX {} ON {} ({})",
                quote(&index_name(store.name(), index.name())),
                quote(store.name()),
                column.quoted()
            ));
        }
    }
    columns.push(format!("{} TEXT NOT NULL", quote(DATA_COLUMN)));
    statements.insert(
        0,
        format!("CREATE TABLE {} ({})", quote(store.name()), columns.join(", ")),
    );

    for (index, column) in entry_columns(store) {
        let table = quote(&column.table);
        statements.push(format!(
            "CREATE TABLE {table} ({pk} {pk_type} NOT NULL REFERENCES {store} ({pk}) ON DELETE CASCADE, \
             {value} {value_type} NOT NULL, PRIMARY KEY ({pk}, {value}))",
            pk = key.quoted(),
            pk_type = key.encoding.sql_type(),
            store = quote(store.name()),
            value = column.quoted(),
            value_type = column.encoding.sql_type(),
        ));
        let (kind, columns) = if index.unique() {
            ("UNIQUE INDEX", column.quoted())
        } else {
            ("INDEX", format!("{}, {}", column.quoted(), key.quoted()))
        };
        statements.push(format!(
            "CREATE {kind} {} ON {table} ({columns})",
            quote(&index_name(store.name(), index.name()))
        ));
    }
    statements
}

/// Statements dropping a store and its synthetic tables.
pub fn drop_store(store: &StoreSchema) -> Vec<String> {
    let mut statements: Vec<String> = entry_columns(store)
        .into_iter()
        .map(|(_, column)| format!("DROP TABLE IF EXISTS {}", quote(&column.table)))
        .collect();
    statements.push(format!("DROP TABLE IF EXISTS {}", quote(store.name())));
    statements
}

// ── Queries ─────────────────────────────────────────────────────────

/// What a compiled query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Primary keys.
    Keys,
    /// Record JSON.
    Values,
    /// Primary key and record JSON.
    Entries,
    /// A single count.
    Count,
}

/// A compiled SELECT, kept in parts so callers can inspect it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub select: String,
    pub from: String,
    pub where_: Vec<String>,
    pub group: Option<String>,
    pub order: Vec<String>,
    pub params: Vec<SqlValue>,
}

impl CompiledQuery {
    /// Full statement text. SQLite needs a `LIMIT` before any `OFFSET`.
    pub fn to_sql(&self, limit: Option<usize>, offset: usize) -> String {
        let mut sql = format!("SELECT {} FROM {}", self.select, self.from);
        if !self.where_.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.where_.join(" AND "));
        }
        if let Some(group) = &self.group {
            sql.push_str(" GROUP BY ");
            sql.push_str(group);
        }
        if !self.order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order.join(", "));
        }
        match (limit, offset) {
            (Some(limit), 0) => sql.push_str(&format!(" LIMIT {limit}")),
            (Some(limit), offset) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (None, 0) => {}
            (None, offset) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
        }
        sql
    }
}

/// Escape `%`, `_` and `\` for `LIKE ... ESCAPE '\'`.
fn like_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

fn range_predicates(
    column: &Column,
    range: &KeyRange,
    where_: &mut Vec<String>,
    params: &mut Vec<SqlValue>,
) -> StoreResult<()> {
    let col = column.qualified();
    if let Some(prefix) = range.as_text_prefix() {
        if column.encoding.is_text() {
            where_.push(format!("{col} LIKE ? ESCAPE '\\'"));
            params.push(SqlValue::Text(like_prefix(prefix)));
            return Ok(());
        }
    }
    if let Some(key) = range.single_key() {
        if column.encoding.accepts(key) {
            where_.push(format!("{col} = ?"));
            params.push(encode_sql(key, &column.encoding)?);
            return Ok(());
        }
    }

    let mut predicates = Vec::new();
    let mut values = Vec::new();
    let sides = [
        (range.lower(), range.lower_open(), BoundSide::Lower),
        (range.upper(), range.upper_open(), BoundSide::Upper),
    ];
    for (key, open, side) in sides {
        let Some(key) = key else { continue };
        match encode_bound(key, open, side, &column.encoding)? {
            SqlBound::Value { value, open } => {
                let op = match (side, open) {
                    (BoundSide::Lower, true) => ">",
                    (BoundSide::Lower, false) => ">=",
                    (BoundSide::Upper, true) => "<",
                    (BoundSide::Upper, false) => "<=",
                };
                predicates.push(format!("{col} {op} ?"));
                values.push(value);
            }
            SqlBound::Unbounded => {}
            SqlBound::Empty => {
                where_.push("0".to_string());
                return Ok(());
            }
        }
    }
    if predicates.is_empty() {
        predicates.push(format!("{col} IS NOT NULL"));
    }
    where_.extend(predicates);
    params.extend(values);
    Ok(())
}

/// Compile a range query over `store`.
pub fn compile(store: &StoreSchema, kind: QueryKind, query: &RangeQuery) -> StoreResult<CompiledQuery> {
    let key = key_column(store);
    let index = match &query.index {
        Some(name) => Some(store.index(name).ok_or_else(|| {
            StoreError::NotFound(format!("index {name} on store {}", store.name()))
        })?),
        None => None,
    };
    let located = index.map(|i| index_column(store, i));
    let effective = located.as_ref().map_or(&key, IndexColumn::column);
    let entries = matches!(located, Some(IndexColumn::Entries(_)));

    let mut from = quote(store.name());
    if entries {
        from.push_str(&format!(
            " INNER JOIN {} ON {}.{} = {}",
            quote(&effective.table),
            quote(&effective.table),
            key.quoted(),
            key.qualified()
        ));
    }

    let mut where_ = Vec::new();
    let mut params = Vec::new();
    match &query.range {
        Some(range) => range_predicates(effective, range, &mut where_, &mut params)?,
        None if index.is_some() => where_.push(format!("{} IS NOT NULL", effective.qualified())),
        None => {}
    }

    let data = format!("{}.{}", quote(store.name()), quote(DATA_COLUMN));
    let select = match kind {
        QueryKind::Keys => key.qualified(),
        QueryKind::Values => data,
        QueryKind::Entries => format!("{}, {data}", key.qualified()),
        QueryKind::Count if query.unique => format!("COUNT(DISTINCT {})", effective.qualified()),
        QueryKind::Count => format!("COUNT({})", effective.qualified()),
    };

    let dir = match query.direction {
        Direction::Forward => "ASC",
        Direction::Reverse => "DESC",
    };
    let mut group = None;
    let mut order = Vec::new();
    if kind != QueryKind::Count {
        if entries && query.unique {
            let agg = match query.direction {
                Direction::Forward => "MIN",
                Direction::Reverse => "MAX",
            };
            group = Some(key.qualified());
            order.push(format!("{agg}({}) {dir}", effective.qualified()));
            order.push(format!("{} {dir}", key.qualified()));
        } else {
            order.push(format!("{} {dir}", effective.qualified()));
            if index.is_some() && effective != &key {
                order.push(format!("{} {dir}", key.qualified()));
            }
        }
    }

    Ok(CompiledQuery {
        select,
        from,
        where_,
        group,
        order,
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{DataType, IndexSchema};

    fn store() -> StoreSchema {
        StoreSchema::new("S")
            .with_key_path("id")
            .with_key_type(DataType::Numeric)
            .with_index(IndexSchema::new("tags").with_multi_entry(true).with_type(DataType::Text))
            .with_index(IndexSchema::new("name").with_type(DataType::Text))
            .with_index(IndexSchema::new("email").with_unique(true))
    }

    #[test]
    fn table_layout() {
        let ddl = create_store(&store());
        assert_eq!(
            ddl[0],
            "CREATE TABLE \"S\" (\"id\" REAL PRIMARY KEY NOT NULL, \"name\" TEXT, \
             \"email\" TEXT UNIQUE, \"__data__\" TEXT NOT NULL)"
        );
        assert!(ddl.contains(&"CREATE INDEX \"__ix__S:name\" ON \"S\" (\"name\")".to_string()));
        assert!(ddl.iter().any(|s| s.starts_with("CREATE TABLE \"__me__S:tags\"")
            && s.contains("ON DELETE CASCADE")));
        assert_eq!(
            drop_store(&store()),
            vec![
                "DROP TABLE IF EXISTS \"__me__S:tags\"".to_string(),
                "DROP TABLE IF EXISTS \"S\"".to_string(),
            ]
        );
    }

    #[test]
    fn auto_increment_uses_rowid() {
        let store = StoreSchema::new("a")
            .with_key_path("id")
            .with_auto_increment(true)
            .with_key_type(DataType::Numeric);
        assert!(create_store(&store)[0].contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        let out_of_line = StoreSchema::new("b");
        assert_eq!(key_column(&out_of_line).name, KEY_COLUMN);
        assert_eq!(key_column(&out_of_line).encoding, ColumnEncoding::Generic);
    }

    #[test]
    fn multi_entry_query_joins_synthetic_table() {
        let q = RangeQuery::new("S").index("tags").range(KeyRange::only("a").unwrap());
        let c = compile(&store(), QueryKind::Values, &q).unwrap();
        assert_eq!(
            c.to_sql(None, 0),
            "SELECT \"S\".\"__data__\" FROM \"S\" INNER JOIN \"__me__S:tags\" \
             ON \"__me__S:tags\".\"id\" = \"S\".\"id\" WHERE \"__me__S:tags\".\"tags\" = ? \
             ORDER BY \"__me__S:tags\".\"tags\" ASC, \"S\".\"id\" ASC"
        );
        assert_eq!(c.params, vec![SqlValue::Text("a".into())]);
    }

    #[test]
    fn unique_multi_entry_groups_by_record() {
        let q = RangeQuery::new("S").index("tags").unique(true).reverse(true);
        let c = compile(&store(), QueryKind::Keys, &q).unwrap();
        assert_eq!(c.group.as_deref(), Some("\"S\".\"id\""));
        assert_eq!(c.order[0], "MAX(\"__me__S:tags\".\"tags\") DESC");
        assert_eq!(c.where_, vec!["\"__me__S:tags\".\"tags\" IS NOT NULL".to_string()]);
        let count = compile(&store(), QueryKind::Count, &q).unwrap();
        assert_eq!(count.select, "COUNT(DISTINCT \"__me__S:tags\".\"tags\")");
        assert!(count.order.is_empty());
    }

    #[test]
    fn prefix_ranges_use_like_only_on_text_columns() {
        let q = RangeQuery::new("S").index("name").range(KeyRange::starts_with("a_b"));
        let c = compile(&store(), QueryKind::Keys, &q).unwrap();
        assert_eq!(c.where_, vec!["\"S\".\"name\" LIKE ? ESCAPE '\\'".to_string()]);
        assert_eq!(c.params, vec![SqlValue::Text("a\\_b%".into())]);

        // untyped column: plain bounds over the generic encoding
        let q = RangeQuery::new("S").index("email").range(KeyRange::starts_with("a"));
        let c = compile(&store(), QueryKind::Keys, &q).unwrap();
        assert_eq!(c.where_.len(), 2);
        assert!(c.where_[0].ends_with(">= ?"));
        assert!(c.where_[1].ends_with("<= ?"));
    }

    #[test]
    fn bounds_limit_and_offset() {
        let q = RangeQuery::new("S").range(KeyRange::bound(1, 5, true, false).unwrap());
        let c = compile(&store(), QueryKind::Count, &q).unwrap();
        assert_eq!(
            c.to_sql(None, 0),
            "SELECT COUNT(\"S\".\"id\") FROM \"S\" WHERE \"S\".\"id\" > ? AND \"S\".\"id\" <= ?"
        );
        assert_eq!(c.params, vec![SqlValue::Real(1.0), SqlValue::Real(5.0)]);
        let keys = compile(&store(), QueryKind::Keys, &q).unwrap();
        assert!(keys.to_sql(Some(2), 1).ends_with("ORDER BY \"S\".\"id\" ASC LIMIT 2 OFFSET 1"));
        assert!(keys.to_sql(None, 3).ends_with("LIMIT -1 OFFSET 3"));
    }

    #[test]
    fn bounds_are_translated_into_the_column_domain() {
        let log = StoreSchema::new("log").with_auto_increment(true);
        let q = RangeQuery::new("log").range(KeyRange::bound(1.5, 3, true, true).unwrap());
        let c = compile(&log, QueryKind::Keys, &q).unwrap();
        assert_eq!(
            c.where_,
            vec![
                "\"log\".\"__key__\" >= ?".to_string(),
                "\"log\".\"__key__\" < ?".to_string(),
            ]
        );
        assert_eq!(c.params, vec![SqlValue::Integer(2), SqlValue::Integer(3)]);

        // text sorts above every number: nothing is at or above it
        let q = RangeQuery::new("S").range(KeyRange::lower_bound("a", false).unwrap());
        let c = compile(&store(), QueryKind::Count, &q).unwrap();
        assert_eq!(c.where_, vec!["0".to_string()]);
        assert!(c.params.is_empty());

        // a number below every name leaves only the text upper bound
        let q = RangeQuery::new("S").index("name").range(KeyRange::bound(1, "m", false, false).unwrap());
        let c = compile(&store(), QueryKind::Keys, &q).unwrap();
        assert_eq!(c.where_, vec!["\"S\".\"name\" <= ?".to_string()]);
        assert_eq!(c.params, vec![SqlValue::Text("m".into())]);

        let q = RangeQuery::new("S").index("name").range(KeyRange::lower_bound(1, true).unwrap());
        let c = compile(&store(), QueryKind::Keys, &q).unwrap();
        assert_eq!(c.where_, vec!["\"S\".\"name\" IS NOT NULL".to_string()]);
    }

    #[test]
    fn unknown_index_is_not_found() {
        let q = RangeQuery::new("S").index("missing");
        let err = compile(&store(), QueryKind::Keys, &q).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
