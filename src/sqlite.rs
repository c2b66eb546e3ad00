//! # SQLite Driver
//!
//! [`SqliteDriver`] implements [`Driver`] on top of a single `rusqlite`
//! connection.
//!
//! ## Schema Discovery
//!
//! Table schemas come from `PRAGMA table_info`:
//!
//! | Declared type contains | Column type |
//! |------------------------|-------------|
//! | `INT` | int |
//! | `REAL`, `FLOA`, `DOUB`, `DECIMAL`, `NUMERIC` | float |
//! | `DATETIME`, `TIMESTAMP` | time |
//! | anything else | string |
//!
//! Columns declared `DEFAULT CURRENT_TIMESTAMP` are auto-mtime columns. The
//! first primary key column is the shard column.
//!
//! ## Statements
//!
//! The SQL text for each table's fixed statements is built once and kept in
//! an LRU cache keyed by table name. Statements are then prepared through
//! rusqlite's own prepared-statement cache.
//!
//! ## Errors
//!
//! Primary key and unique constraint violations become a `"duplicate key"`
//! rejection. Busy, locked, I/O and allocation failures become driver faults
//! so the processor can retry them. Every other SQL error is a rejection
//! carrying the SQLite message.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use lru::LruCache;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{ffi, params_from_iter, Connection, ErrorCode, Params};
use tracing::info;

use crate::codec::{current_datetime, encode_row};
use crate::condition::Condition;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::schema::{ColumnType, TableSchema};
use crate::types::{DbReply, IncrByData, MultiRequestData, ReplyData};

/// Number of tables whose statement text is kept.
pub const STATEMENT_CACHE_SIZE: usize = 64;

// =============================================================================
// Statements
// =============================================================================

/// Fixed SQL text for one table.
#[derive(Debug)]
struct Statements {
    table: String,
    key_where: String,
    select_single: String,
    select_multi: String,
    delete_single: String,
    delete_multi: String,
}

impl Statements {
    fn new(schema: &TableSchema) -> Self {
        let table = quote(schema.name());
        let column_list = schema
            .columns()
            .iter()
            .map(|c| quote(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let key_where = format!(
            " WHERE {}",
            schema
                .key_column_indexes()
                .iter()
                .map(|&i| format!("{} = ?", quote(&schema.column(i).name)))
                .collect::<Vec<_>>()
                .join(" AND ")
        );
        let shard_where = format!(" WHERE {} = ?", quote(schema.shard_key()));

        Self {
            select_single: format!("SELECT {} FROM {}{}", column_list, table, key_where),
            select_multi: format!("SELECT {} FROM {}{}", column_list, table, shard_where),
            delete_single: format!("DELETE FROM {}{}", table, key_where),
            delete_multi: format!("DELETE FROM {}{}", table, shard_where),
            table,
            key_where,
        }
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

// =============================================================================
// Driver
// =============================================================================

/// A [`Driver`] over one SQLite connection.
pub struct SqliteDriver {
    conn: Connection,
    statements: LruCache<String, Arc<Statements>>,
}

impl SqliteDriver {
    /// Opens (or creates) a database file in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        let capacity = NonZeroUsize::new(STATEMENT_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            conn,
            statements: LruCache::new(capacity),
        }
    }

    /// The underlying connection, for setup and inspection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn statements(&mut self, schema: &TableSchema) -> Arc<Statements> {
        if let Some(statements) = self.statements.get(schema.name()) {
            return Arc::clone(statements);
        }

        let statements = Arc::new(Statements::new(schema));
        self.statements
            .put(schema.name().to_string(), Arc::clone(&statements));
        statements
    }

    fn exec<P: Params>(&self, sql: &str, params: P) -> DbReply {
        match self.conn.prepare_cached(sql).and_then(|mut stmt| stmt.execute(params)) {
            Ok(n) => DbReply::affected(n as i64),
            Err(e) => reply_for_error(e),
        }
    }

    fn incr_checked(
        &mut self,
        schema: &TableSchema,
        statements: &Statements,
        condition: &Condition<'_>,
        keys: &[String],
        update_sql: &str,
        params: Vec<Value>,
    ) -> rusqlite::Result<usize> {
        let tx = self.conn.transaction()?;

        let rows = query_values(&tx, &statements.select_single, params_from_iter(keys), schema.num_columns())?;
        let matches = rows
            .first()
            .and_then(|values| encode_row(schema, values))
            .is_some_and(|row| condition.check(&row));
        if !matches {
            return Ok(0);
        }

        let n = tx.prepare_cached(update_sql)?.execute(params_from_iter(params))?;
        tx.commit()?;
        Ok(n)
    }

    fn delete_matching(
        &mut self,
        schema: &TableSchema,
        statements: &Statements,
        shard: &str,
        condition: &Condition<'_>,
    ) -> rusqlite::Result<usize> {
        let key_indexes = schema.key_column_indexes();
        let tx = self.conn.transaction()?;

        let rows = query_values(&tx, &statements.select_multi, [shard], schema.num_columns())?;
        let mut n = 0;
        {
            let mut delete = tx.prepare_cached(&statements.delete_single)?;
            for values in &rows {
                let Some(row) = encode_row(schema, values) else {
                    continue;
                };
                if !condition.check(&row) {
                    continue;
                }
                let keys = key_indexes.iter().map(|&i| values[i].as_str());
                n += delete.execute(params_from_iter(keys))?;
            }
        }

        tx.commit()?;
        Ok(n)
    }
}

impl Driver for SqliteDriver {
    fn load_table_schema(&mut self, name: &str) -> Result<TableSchema> {
        struct ColumnInfo {
            name: String,
            declared: String,
            default_value: Option<String>,
            pk: i64,
        }

        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({})", quote(name)))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    declared: row.get(2)?,
                    default_value: row.get(4)?,
                    pk: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        if columns.is_empty() {
            return Err(Error::Schema(format!("table '{}' not found", name)));
        }

        let mut builder = TableSchema::builder(name);
        let mut keys: Vec<(i64, &str)> = Vec::new();
        for column in &columns {
            let default_value = column.default_value.as_deref().map(unquote).unwrap_or("");
            if default_value.eq_ignore_ascii_case("CURRENT_TIMESTAMP") {
                builder = builder
                    .column(column.name.as_str(), column_type(&column.declared))
                    .auto_mtime(column.name.as_str());
            } else {
                builder = builder.column_with_default(
                    column.name.as_str(),
                    column_type(&column.declared),
                    default_value,
                );
            }

            if column.pk > 0 {
                keys.push((column.pk, column.name.as_str()));
            }
        }
        keys.sort_by_key(|&(ordinal, _)| ordinal);
        let keys: Vec<&str> = keys.into_iter().map(|(_, name)| name).collect();

        let schema = builder.primary_key(&keys).build()?;
        self.statements.pop(name);

        info!(
            table = name,
            columns = schema.num_columns(),
            primary_keys = schema.num_primary_keys(),
            "loaded table schema from sqlite"
        );
        Ok(schema)
    }

    fn insert(&mut self, schema: &TableSchema, _shard: &str, fields: &[String]) -> DbReply {
        if fields.len() % 2 == 1 {
            return DbReply::rejected(0, "invalid fields");
        }

        let mut names = Vec::with_capacity(fields.len() / 2);
        let mut values = Vec::with_capacity(fields.len() / 2);
        for pair in fields.chunks_exact(2) {
            let Some(column) = schema.column_by_name(&pair[0]) else {
                return DbReply::rejected(0, "invalid field");
            };
            if column.is_number && pair[1].is_empty() {
                continue;
            }
            names.push(quote(&column.name));
            values.push(pair[1].as_str());
        }

        if names.is_empty() {
            return DbReply::rejected(0, "invalid fields");
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(schema.name()),
            names.join(", "),
            vec!["?"; values.len()].join(", ")
        );
        self.exec(&sql, params_from_iter(values))
    }

    fn delete_single(&mut self, schema: &TableSchema, _shard: &str, keys: &[String]) -> DbReply {
        if keys.len() != schema.num_primary_keys() {
            return DbReply::rejected(0, "invalid primary keys");
        }

        let statements = self.statements(schema);
        self.exec(&statements.delete_single, params_from_iter(keys))
    }

    fn update_single(
        &mut self,
        schema: &TableSchema,
        _shard: &str,
        keys: &[String],
        fields: &[String],
    ) -> DbReply {
        if fields.is_empty() || fields.len() % 2 == 1 {
            return DbReply::rejected(0, "invalid fields");
        }
        if keys.len() != schema.num_primary_keys() {
            return DbReply::rejected(0, "invalid primary keys");
        }

        let now = current_datetime();
        let mut assigned = vec![false; schema.num_columns()];
        let mut assignments = Vec::with_capacity(fields.len() / 2);
        let mut params = Vec::with_capacity(fields.len() / 2 + keys.len());
        for pair in fields.chunks_exact(2) {
            match schema.column_by_name(&pair[0]) {
                Some(column) if !column.is_primary_key => {
                    assigned[column.index] = true;
                    assignments.push(format!("{} = ?", quote(&column.name)));
                    params.push(pair[1].as_str());
                }
                _ => return DbReply::rejected(0, "invalid field"),
            }
        }
        for &idx in schema.auto_mtime_fields() {
            if !assigned[idx] {
                assignments.push(format!("{} = ?", quote(&schema.column(idx).name)));
                params.push(now.as_str());
            }
        }
        params.extend(keys.iter().map(String::as_str));

        let statements = self.statements(schema);
        let sql = format!(
            "UPDATE {} SET {}{}",
            statements.table,
            assignments.join(", "),
            statements.key_where
        );
        self.exec(&sql, params_from_iter(params))
    }

    fn incr_by_single(
        &mut self,
        schema: &TableSchema,
        shard: &str,
        keys: &[String],
        data: &IncrByData,
    ) -> DbReply {
        if keys.len() != schema.num_primary_keys() {
            return DbReply::rejected(0, "invalid primary keys");
        }

        let column = match schema.column_by_name(&data.column) {
            Some(c) if !c.is_primary_key && c.is_number => quote(&c.name),
            _ => return DbReply::rejected(0, "invalid field"),
        };

        let condition = match Condition::compile::<&str>(schema, shard, &data.where_clause, &[]) {
            Ok(condition) => condition,
            Err(e) => return DbReply::rejected(0, e.to_string()),
        };

        let statements = self.statements(schema);
        let now = current_datetime();
        let mut assignments = vec![format!("{} = {} + ?", column, column)];
        let mut params = Vec::with_capacity(keys.len() + 2);
        params.push(Value::Integer(data.delta));
        for &idx in schema.auto_mtime_fields() {
            assignments.push(format!("{} = ?", quote(&schema.column(idx).name)));
            params.push(Value::Text(now.clone()));
        }
        let sql = format!(
            "UPDATE {} SET {}{}",
            statements.table,
            assignments.join(", "),
            statements.key_where
        );
        params.extend(keys.iter().map(|k| Value::Text(k.clone())));

        match condition {
            None => self.exec(&sql, params_from_iter(params)),
            Some(condition) => {
                match self.incr_checked(schema, &statements, &condition, keys, &sql, params) {
                    Ok(n) => DbReply::affected(n as i64),
                    Err(e) => reply_for_error(e),
                }
            }
        }
    }

    fn select_single(&mut self, schema: &TableSchema, _shard: &str, keys: &[String]) -> DbReply {
        if keys.len() != schema.num_primary_keys() {
            return DbReply {
                data: ReplyData::Row(None),
                err: None,
                msg: "invalid primary keys".to_string(),
            };
        }

        let statements = self.statements(schema);
        let rows = match query_values(
            &self.conn,
            &statements.select_single,
            params_from_iter(keys),
            schema.num_columns(),
        ) {
            Ok(rows) => rows,
            Err(e) => return reply_for_error(e),
        };

        let mut encoded = None;
        for values in &rows {
            match encode_row(schema, values) {
                Some(row) => encoded = Some(row),
                None => return inconsistent_columns(),
            }
        }

        let msg = if rows.len() > 1 {
            "multiple row returned".to_string()
        } else {
            String::new()
        };
        DbReply {
            data: ReplyData::Row(encoded),
            err: None,
            msg,
        }
    }

    fn select_multi(&mut self, schema: &TableSchema, shard: &str) -> DbReply {
        let statements = self.statements(schema);
        let rows = match query_values(&self.conn, &statements.select_multi, [shard], schema.num_columns()) {
            Ok(rows) => rows,
            Err(e) => return reply_for_error(e),
        };

        let mut encoded = Vec::with_capacity(rows.len());
        for values in &rows {
            match encode_row(schema, values) {
                Some(row) => encoded.push(row),
                None => return inconsistent_columns(),
            }
        }
        DbReply::rows(encoded)
    }

    fn delete_multi(&mut self, schema: &TableSchema, shard: &str, data: &MultiRequestData) -> DbReply {
        let condition = match Condition::compile(schema, shard, &data.where_clause, &data.params) {
            Ok(condition) => condition,
            Err(e) => return DbReply::rejected(0, e.to_string()),
        };

        let statements = self.statements(schema);
        let result = match condition {
            None => self
                .conn
                .prepare_cached(&statements.delete_multi)
                .and_then(|mut stmt| stmt.execute([shard])),
            Some(condition) => self.delete_matching(schema, &statements, shard, &condition),
        };

        match result {
            Ok(n) => DbReply::affected(n as i64),
            Err(e) => reply_for_error(e),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn column_type(declared: &str) -> ColumnType {
    let declared = declared.to_ascii_uppercase();
    let has = |needle: &str| declared.contains(needle);

    if has("DATETIME") || has("TIMESTAMP") {
        ColumnType::Time
    } else if has("INT") {
        ColumnType::Int
    } else if has("REAL") || has("FLOA") || has("DOUB") || has("DECIMAL") || has("NUMERIC") {
        ColumnType::Float
    } else {
        ColumnType::String
    }
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    for quote in ['\'', '"'] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

fn value_to_string(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Runs a query and returns each row as one string per column.
fn query_values<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    n_columns: usize,
) -> rusqlite::Result<Vec<Vec<String>>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, |row| {
        (0..n_columns)
            .map(|i| row.get_ref(i).map(value_to_string))
            .collect::<rusqlite::Result<Vec<String>>>()
    })?;
    rows.collect()
}

fn inconsistent_columns() -> DbReply {
    DbReply::rejected(0, "inconsistent columns returned, check table schema")
}

/// Maps a SQLite error onto the reply contract.
fn reply_for_error(err: rusqlite::Error) -> DbReply {
    let (code, extended) = match &err {
        rusqlite::Error::SqliteFailure(e, _) => (Some(e.code), e.extended_code),
        _ => (None, 0),
    };

    match code {
        Some(ErrorCode::ConstraintViolation)
            if extended == ffi::SQLITE_CONSTRAINT_PRIMARYKEY || extended == ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            DbReply::rejected(0, "duplicate key")
        }
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::CannotOpen
            | ErrorCode::OutOfMemory,
        ) => DbReply::fault(Error::Sqlite(err)),
        _ => DbReply::rejected(0, err.to_string()),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value_at;

    const CREATE_BAG: &str = "
        CREATE TABLE bag (
            uid INTEGER NOT NULL,
            slot INTEGER NOT NULL,
            name TEXT DEFAULT 'none',
            count INTEGER DEFAULT 0,
            weight REAL,
            mtime DATETIME DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (uid, slot)
        )";

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn driver_with_bag() -> (SqliteDriver, TableSchema) {
        let mut driver = SqliteDriver::open_in_memory().unwrap();
        driver.connection().execute_batch(CREATE_BAG).unwrap();
        let schema = driver.load_table_schema("bag").unwrap();
        (driver, schema)
    }

    fn insert(driver: &mut SqliteDriver, schema: &TableSchema, uid: &str, slot: &str, count: &str) -> DbReply {
        driver.insert(
            schema,
            uid,
            &strings(&["uid", uid, "slot", slot, "name", "item", "count", count]),
        )
    }

    fn select_row(driver: &mut SqliteDriver, schema: &TableSchema, uid: &str, slot: &str) -> Option<Vec<u8>> {
        match driver.select_single(schema, uid, &strings(&[uid, slot])).data {
            ReplyData::Row(row) => row,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_load_table_schema() {
        let (_, schema) = driver_with_bag();
        assert_eq!(schema.num_columns(), 6);
        assert_eq!(schema.num_primary_keys(), 2);
        assert_eq!(schema.shard_key(), "uid");
        assert_eq!(schema.column(0).column_type, ColumnType::Int);
        assert_eq!(schema.column(2).column_type, ColumnType::String);
        assert_eq!(schema.column(2).default_value, "none");
        assert_eq!(schema.column(4).column_type, ColumnType::Float);
        assert_eq!(schema.column(5).column_type, ColumnType::Time);
        assert_eq!(schema.auto_mtime_fields(), &[5]);
    }

    #[test]
    fn test_missing_table() {
        let mut driver = SqliteDriver::open_in_memory().unwrap();
        assert!(matches!(driver.load_table_schema("ghost"), Err(Error::Schema(_))));
    }

    #[test]
    fn test_insert_and_select() {
        let (mut driver, schema) = driver_with_bag();
        assert_eq!(insert(&mut driver, &schema, "1", "2", "5").affected_rows(), Some(1));

        let row = select_row(&mut driver, &schema, "1", "2").unwrap();
        assert_eq!(value_at(&schema, &row, 2), "item");
        assert_eq!(value_at(&schema, &row, 3), "5");
        assert_eq!(value_at(&schema, &row, 4), "");
        assert_eq!(value_at(&schema, &row, 5).len(), 19);

        assert!(select_row(&mut driver, &schema, "1", "3").is_none());
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let (mut driver, schema) = driver_with_bag();
        insert(&mut driver, &schema, "1", "1", "5");
        let reply = insert(&mut driver, &schema, "1", "1", "6");
        assert!(!reply.is_fault());
        assert_eq!(reply.msg, "duplicate key");
        assert_eq!(reply.affected_rows(), Some(0));
    }

    #[test]
    fn test_invalid_requests_are_rejected() {
        let (mut driver, schema) = driver_with_bag();
        assert_eq!(driver.insert(&schema, "1", &strings(&["bogus", "1"])).msg, "invalid field");
        assert_eq!(driver.insert(&schema, "1", &strings(&["uid"])).msg, "invalid fields");
        assert_eq!(driver.delete_single(&schema, "1", &strings(&["1"])).msg, "invalid primary keys");

        let update = driver.update_single(&schema, "1", &strings(&["1", "1"]), &strings(&["uid", "2"]));
        assert_eq!(update.msg, "invalid field");

        let incr = driver.incr_by_single(&schema, "1", &strings(&["1", "1"]), &IncrByData::new("name", 1));
        assert_eq!(incr.msg, "invalid field");
    }

    #[test]
    fn test_update_and_incr() {
        let (mut driver, schema) = driver_with_bag();
        insert(&mut driver, &schema, "1", "1", "5");
        let keys = strings(&["1", "1"]);

        let reply = driver.update_single(&schema, "1", &keys, &strings(&["name", "shield", "weight", "2.5"]));
        assert_eq!(reply.affected_rows(), Some(1));

        let reply = driver.incr_by_single(&schema, "1", &keys, &IncrByData::new("count", -2));
        assert_eq!(reply.affected_rows(), Some(1));

        let row = select_row(&mut driver, &schema, "1", "1").unwrap();
        assert_eq!(value_at(&schema, &row, 2), "shield");
        assert_eq!(value_at(&schema, &row, 3), "3");
        assert_eq!(value_at(&schema, &row, 4), "2.5");

        let missing = driver.update_single(&schema, "1", &strings(&["9", "9"]), &strings(&["name", "x"]));
        assert_eq!(missing.affected_rows(), Some(0));
    }

    #[test]
    fn test_incr_with_where_clause() {
        let (mut driver, schema) = driver_with_bag();
        insert(&mut driver, &schema, "1", "1", "5");
        let keys = strings(&["1", "1"]);

        let blocked = IncrByData::new("count", 10).with_where("count > 100");
        assert_eq!(driver.incr_by_single(&schema, "1", &keys, &blocked).affected_rows(), Some(0));

        let allowed = IncrByData::new("count", 10).with_where("uid = 1 AND count >= 5");
        assert_eq!(driver.incr_by_single(&schema, "1", &keys, &allowed).affected_rows(), Some(1));

        let row = select_row(&mut driver, &schema, "1", "1").unwrap();
        assert_eq!(value_at(&schema, &row, 3), "15");

        let wrong_shard = IncrByData::new("count", 1).with_where("uid = 2");
        let reply = driver.incr_by_single(&schema, "1", &keys, &wrong_shard);
        assert_eq!(reply.affected_rows(), Some(0));
        assert!(!reply.msg.is_empty());
    }

    #[test]
    fn test_select_and_delete_multi() {
        let (mut driver, schema) = driver_with_bag();
        for (uid, slot, count) in [("1", "1", "1"), ("1", "2", "2"), ("1", "3", "3"), ("2", "1", "4")] {
            insert(&mut driver, &schema, uid, slot, count);
        }

        match driver.select_multi(&schema, "1").data {
            ReplyData::Rows(rows) => assert_eq!(rows.len(), 3),
            other => panic!("unexpected reply {:?}", other),
        }

        let filtered = MultiRequestData {
            where_clause: "count >= ?".to_string(),
            params: strings(&["2"]),
        };
        assert_eq!(driver.delete_multi(&schema, "1", &filtered).affected_rows(), Some(2));

        let all = MultiRequestData::default();
        assert_eq!(driver.delete_multi(&schema, "1", &all).affected_rows(), Some(1));
        assert!(select_row(&mut driver, &schema, "2", "1").is_some());

        let bad = MultiRequestData {
            where_clause: "count >= ?".to_string(),
            params: Vec::new(),
        };
        assert!(!driver.delete_multi(&schema, "2", &bad).msg.is_empty());
    }

    #[test]
    fn test_error_mapping() {
        let busy = rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_BUSY), None);
        assert!(reply_for_error(busy).is_fault());

        let duplicate = rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_CONSTRAINT_PRIMARYKEY), None);
        assert_eq!(reply_for_error(duplicate).msg, "duplicate key");

        let other = reply_for_error(rusqlite::Error::InvalidQuery);
        assert!(!other.is_fault());
        assert!(!other.msg.is_empty());
    }

    #[test]
    fn test_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        {
            let mut driver = SqliteDriver::open(&path).unwrap();
            driver.connection().execute_batch(CREATE_BAG).unwrap();
            let schema = driver.load_table_schema("bag").unwrap();
            insert(&mut driver, &schema, "4", "1", "9");
        }

        let mut driver = SqliteDriver::open(&path).unwrap();
        let schema = driver.load_table_schema("bag").unwrap();
        let row = select_row(&mut driver, &schema, "4", "1").unwrap();
        assert_eq!(value_at(&schema, &row, 3), "9");
    }
}
