//! # Backing Store Drivers
//!
//! The [`Driver`] trait is the whole boundary between the caching core and a
//! backing store. Every call is synchronous: the accessor thread blocks for one
//! backend round trip per dispatched group.
//!
//! ## Reply Contract
//!
//! | Outcome | `DbReply` | Processor response |
//! |---------|-----------|--------------------|
//! | Success | `data` set | Broadcast to the group |
//! | Rejection | `msg` set, `err` empty | Terminal, broadcast |
//! | Fault | `err` set | Retried unless `sync`/`pre_req` |
//!
//! [`MemoryDriver`] keeps tables in hash maps. It can replay queued fake
//! replies and records every call it receives, which is what the processor
//! and accessor tests assert against.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::codec::{
    assemble_key_from_list, current_datetime, decode_row_to_field_list, encode_row_from_field_list, row_key,
    shard_key_of,
};
use crate::condition::Condition;
use crate::error::{Error, Result};
use crate::schema::TableSchema;
use crate::types::{DbCommand, DbReply, IncrByData, MultiRequestData, RequestData};

// =============================================================================
// Driver Trait
// =============================================================================

/// A backing store the processor dispatches row operations to.
///
/// `fields` arguments are flat `[name, value, ...]` lists; `keys` are primary
/// key values in key order; `shard` is the shard column value.
pub trait Driver {
    fn load_table_schema(&mut self, name: &str) -> Result<TableSchema>;

    fn insert(&mut self, schema: &TableSchema, shard: &str, fields: &[String]) -> DbReply;

    fn delete_single(&mut self, schema: &TableSchema, shard: &str, keys: &[String]) -> DbReply;

    fn update_single(
        &mut self,
        schema: &TableSchema,
        shard: &str,
        keys: &[String],
        fields: &[String],
    ) -> DbReply;

    fn incr_by_single(
        &mut self,
        schema: &TableSchema,
        shard: &str,
        keys: &[String],
        data: &IncrByData,
    ) -> DbReply;

    fn select_single(&mut self, schema: &TableSchema, shard: &str, keys: &[String]) -> DbReply;

    fn select_multi(&mut self, schema: &TableSchema, shard: &str) -> DbReply;

    fn delete_multi(&mut self, schema: &TableSchema, shard: &str, data: &MultiRequestData) -> DbReply;
}

// =============================================================================
// Memory Driver
// =============================================================================

/// One call received by a [`MemoryDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCall {
    pub table: String,
    pub command: DbCommand,
    pub shard: String,
    pub keys: Vec<String>,
    pub payload: RequestData,
}

/// In-memory driver backed by `table -> row key -> encoded row` maps.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    schemas: HashMap<String, TableSchema>,
    tables: HashMap<String, HashMap<String, Vec<u8>>>,
    fake_replies: VecDeque<DbReply>,
    calls: Vec<DriverCall>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `schema` available to [`Driver::load_table_schema`].
    pub fn register_schema(&mut self, schema: TableSchema) {
        self.schemas.insert(schema.name().to_string(), schema);
    }

    /// Queues a reply returned verbatim by the next data call.
    pub fn push_fake_reply(&mut self, reply: DbReply) {
        self.fake_replies.push_back(reply);
    }

    pub fn calls(&self) -> &[DriverCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<DriverCall> {
        std::mem::take(&mut self.calls)
    }

    /// Number of stored rows in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, HashMap::len)
    }

    /// The encoded row stored under `key`.
    pub fn row(&self, table: &str, key: &str) -> Option<&[u8]> {
        self.tables.get(table)?.get(key).map(Vec::as_slice)
    }

    /// Stores an encoded row directly, bypassing the call log.
    pub fn put_row(&mut self, schema: &TableSchema, row: Vec<u8>) -> Result<()> {
        let key = row_key(schema, &row)
            .ok_or_else(|| Error::InvalidRow(format!("no key in row of '{}'", schema.name())))?
            .into_owned();
        self.tables
            .entry(schema.name().to_string())
            .or_default()
            .insert(key, row);
        Ok(())
    }

    fn record(&mut self, schema: &TableSchema, shard: &str, keys: &[String], payload: RequestData) -> Option<DbReply> {
        debug!(table = schema.name(), command = %payload.command(), shard, "memory driver call");
        self.calls.push(DriverCall {
            table: schema.name().to_string(),
            command: payload.command(),
            shard: shard.to_string(),
            keys: keys.to_vec(),
            payload,
        });
        self.fake_replies.pop_front()
    }

    fn table_mut(&mut self, name: &str) -> Option<&mut HashMap<String, Vec<u8>>> {
        self.tables.get_mut(name)
    }

    /// Decodes the stored row into an owned field list, applies `f` and
    /// re-encodes it. Auto-mtime columns not in `assigned` get the current time.
    fn rewrite_row(
        schema: &TableSchema,
        row: &[u8],
        assigned: &[&str],
        f: impl FnOnce(&mut Vec<String>) -> std::result::Result<(), &'static str>,
    ) -> std::result::Result<Vec<u8>, &'static str> {
        let mut fields: Vec<String> = decode_row_to_field_list(schema, row)
            .ok_or("invalid row data")?
            .into_iter()
            .map(str::to_string)
            .collect();
        f(&mut fields)?;

        let now = current_datetime();
        for &idx in schema.auto_mtime_fields() {
            let name = &schema.column(idx).name;
            if !assigned.iter().any(|a| *a == name.as_str()) {
                set_field(&mut fields, name, now.clone());
            }
        }
        encode_row_from_field_list(schema, &fields).ok_or("invalid fields")
    }
}

fn set_field(fields: &mut [String], name: &str, value: String) -> bool {
    match fields.chunks_exact_mut(2).find(|pair| pair[0] == name) {
        Some(pair) => {
            pair[1] = value;
            true
        }
        None => false,
    }
}

impl Driver for MemoryDriver {
    fn load_table_schema(&mut self, name: &str) -> Result<TableSchema> {
        self.schemas
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Schema(format!("table '{}' not found", name)))
    }

    fn insert(&mut self, schema: &TableSchema, shard: &str, fields: &[String]) -> DbReply {
        if let Some(reply) = self.record(schema, shard, &[], RequestData::Insert(fields.to_vec())) {
            return reply;
        }

        let Some(row) = encode_row_from_field_list(schema, fields) else {
            return DbReply::rejected(0, "invalid fields");
        };
        let Some(key) = row_key(schema, &row).map(|k| k.into_owned()) else {
            return DbReply::rejected(0, "invalid fields");
        };

        let table = self.tables.entry(schema.name().to_string()).or_default();
        if table.contains_key(&key) {
            return DbReply::rejected(0, "duplicate key");
        }

        table.insert(key, row);
        DbReply::affected(1)
    }

    fn delete_single(&mut self, schema: &TableSchema, shard: &str, keys: &[String]) -> DbReply {
        if let Some(reply) = self.record(schema, shard, keys, RequestData::DeleteSingle) {
            return reply;
        }

        let Some(key) = assemble_key_from_list(schema, keys) else {
            return DbReply::rejected(0, "invalid primary keys");
        };

        match self.table_mut(schema.name()).and_then(|t| t.remove(&key)) {
            Some(_) => DbReply::affected(1),
            None => DbReply::affected(0),
        }
    }

    fn update_single(
        &mut self,
        schema: &TableSchema,
        shard: &str,
        keys: &[String],
        fields: &[String],
    ) -> DbReply {
        if let Some(reply) = self.record(schema, shard, keys, RequestData::UpdateSingle(fields.to_vec())) {
            return reply;
        }

        let Some(key) = assemble_key_from_list(schema, keys) else {
            return DbReply::rejected(0, "invalid primary keys");
        };
        if fields.len() % 2 == 1 {
            return DbReply::rejected(0, "invalid fields");
        }

        let Some(row) = self.table_mut(schema.name()).and_then(|t| t.get_mut(&key)) else {
            return DbReply::affected(0);
        };

        let assigned: Vec<&str> = fields.iter().step_by(2).map(String::as_str).collect();
        let updated = Self::rewrite_row(schema, row, &assigned, |current| {
            for pair in fields.chunks_exact(2) {
                if !set_field(current, &pair[0], pair[1].clone()) {
                    return Err("invalid fields");
                }
            }
            Ok(())
        });

        match updated {
            Ok(new_row) => {
                *row = new_row;
                DbReply::affected(1)
            }
            Err(msg) => DbReply::rejected(0, msg),
        }
    }

    fn incr_by_single(
        &mut self,
        schema: &TableSchema,
        shard: &str,
        keys: &[String],
        data: &IncrByData,
    ) -> DbReply {
        if let Some(reply) = self.record(schema, shard, keys, RequestData::IncrBySingle(data.clone())) {
            return reply;
        }

        let Some(key) = assemble_key_from_list(schema, keys) else {
            return DbReply::rejected(0, "invalid primary keys");
        };

        let condition = match Condition::compile::<&str>(schema, shard, &data.where_clause, &[]) {
            Ok(condition) => condition,
            Err(e) => return DbReply::rejected(0, e.to_string()),
        };

        let Some(row) = self.table_mut(schema.name()).and_then(|t| t.get_mut(&key)) else {
            return DbReply::affected(0);
        };

        if let Some(condition) = &condition {
            if !condition.check(row) {
                return DbReply::affected(0);
            }
        }

        let updated = Self::rewrite_row(schema, row, &[], |current| {
            let value = current
                .chunks_exact(2)
                .find(|pair| pair[0] == data.column)
                .ok_or("invalid field")?[1]
                .parse::<i64>()
                .map_err(|_| "invalid field")?;
            set_field(current, &data.column, (value + data.delta).to_string());
            Ok(())
        });

        match updated {
            Ok(new_row) => {
                *row = new_row;
                DbReply::affected(1)
            }
            Err(msg) => DbReply::rejected(0, msg),
        }
    }

    fn select_single(&mut self, schema: &TableSchema, shard: &str, keys: &[String]) -> DbReply {
        if let Some(reply) = self.record(schema, shard, keys, RequestData::SelectSingle) {
            return reply;
        }

        let Some(key) = assemble_key_from_list(schema, keys) else {
            return DbReply::rejected(0, "invalid primary keys");
        };

        DbReply::row(self.row(schema.name(), &key).map(<[u8]>::to_vec))
    }

    fn select_multi(&mut self, schema: &TableSchema, shard: &str) -> DbReply {
        if let Some(reply) = self.record(schema, shard, &[], RequestData::SelectMulti) {
            return reply;
        }

        let rows = self
            .tables
            .get(schema.name())
            .map(|table| {
                table
                    .values()
                    .filter(|row| shard_key_of(schema, row) == shard)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        DbReply::rows(rows)
    }

    fn delete_multi(&mut self, schema: &TableSchema, shard: &str, data: &MultiRequestData) -> DbReply {
        if let Some(reply) = self.record(schema, shard, &[], RequestData::DeleteMulti(data.clone())) {
            return reply;
        }

        let condition = match Condition::compile(schema, shard, &data.where_clause, &data.params) {
            Ok(condition) => condition,
            Err(e) => return DbReply::rejected(0, e.to_string()),
        };

        let Some(table) = self.tables.get_mut(schema.name()) else {
            return DbReply::affected(0);
        };

        let before = table.len();
        table.retain(|_, row| {
            shard_key_of(schema, row) != shard
                || !condition.as_ref().map_or(true, |c| c.check(row))
        });

        DbReply::affected((before - table.len()) as i64)
    }
}

// =============================================================================
// Tests
// =============================================================================
