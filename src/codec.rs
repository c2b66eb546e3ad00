//! # Row Encoding and Decoding
//!
//! Rows are cached and exchanged with drivers in a compact binary form that
//! supports random access to any column without parsing the others.
//!
//! ## Row Format
//!
//! ```text
//! [control: u8][end_0: u32 LE][end_1: u32 LE]...[end_n-1: u32 LE][data...]
//!
//! control = 0  normal row
//! control = 9  key-only buffer: the whole buffer is a row key
//! end_i        offset one past the last byte of column i
//! data         column values in order; primary key values are prefixed
//!              with one separator byte (9)
//! ```
//!
//! Column `i` starts at `end_{i-1}` (or at the end of the header for column 0),
//! so every lookup is two header reads and a slice.
//!
//! ## Row Keys
//!
//! A row key is the concatenation of the primary key values, each prefixed by
//! the separator byte. For prefix keys this is exactly the contiguous data span
//! of the key columns, so [`row_key`] borrows it straight out of the buffer.
//!
//! ## Borrowing
//!
//! Decoders return `&str` views into the row buffer (or into the schema for
//! default values). Callers copy only when they need to keep or mutate a value.

use std::borrow::Cow;
use std::collections::HashMap;

use chrono::{NaiveDateTime, Utc};

use crate::schema::TableSchema;

// =============================================================================
// Constants
// =============================================================================

/// Separator prefixed to every primary key value (ASCII HT).
pub const PRIMARY_KEY_SEPARATOR: u8 = 9;

/// Control byte of a normal encoded row.
pub const ROW_MARKER: u8 = 0;

/// Format of time columns and auto-maintained modification times.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const OFFSET_SIZE: usize = 4;

// =============================================================================
// Time Helpers
// =============================================================================

/// Current UTC time in [`DATETIME_FORMAT`].
pub fn current_datetime() -> String {
    Utc::now().format(DATETIME_FORMAT).to_string()
}

/// Parses a [`DATETIME_FORMAT`] string (UTC) into a unix timestamp.
pub fn parse_datetime(value: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(value, DATETIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

// =============================================================================
// Encoding
// =============================================================================

/// Encodes one value per column into a row buffer.
///
/// An empty value means "not set". Returns `None` when the number of values
/// differs from the column count, when every value is empty, or when the row
/// would not fit 32-bit offsets.
pub fn encode_row<T: AsRef<[u8]>>(schema: &TableSchema, fields: &[T]) -> Option<Vec<u8>> {
    let columns = schema.columns();
    let n_column = fields.len();
    if n_column == 0 || n_column != columns.len() {
        return None;
    }

    let n_data: usize = fields.iter().map(|f| f.as_ref().len()).sum();
    if n_data == 0 {
        return None;
    }

    let n_header = header_len(n_column);
    let total = n_header + schema.num_primary_keys() + n_data;
    if total > u32::MAX as usize {
        return None;
    }

    let mut row = vec![0u8; n_header];
    row.reserve(total - n_header);
    row[0] = ROW_MARKER;

    for (i, (field, column)) in fields.iter().zip(columns.iter()).enumerate() {
        if column.is_primary_key {
            row.push(PRIMARY_KEY_SEPARATOR);
        }
        row.extend_from_slice(field.as_ref());

        let end = row.len() as u32;
        let header_start = 1 + i * OFFSET_SIZE;
        row[header_start..header_start + OFFSET_SIZE].copy_from_slice(&end.to_le_bytes());
    }

    Some(row)
}

/// Encodes a row from `name -> value` pairs.
///
/// Auto-maintained time columns that are not supplied get the current time.
/// Returns `None` on an unknown column name.
pub fn encode_row_from_map<K, V>(schema: &TableSchema, fields: &HashMap<K, V>) -> Option<Vec<u8>>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    if fields.len() > schema.num_columns() {
        return None;
    }

    let mut values: Vec<Option<&[u8]>> = vec![None; schema.num_columns()];
    for (name, value) in fields {
        let column = schema.column_by_name(name.as_ref())?;
        values[column.index] = Some(value.as_ref().as_bytes());
    }

    encode_with_mtime(schema, values)
}

/// Encodes a row from a flat `[name, value, name, value, ...]` list.
///
/// Returns `None` on an odd-length list, a list longer than the schema, or an
/// unknown column name.
pub fn encode_row_from_field_list<S: AsRef<str>>(schema: &TableSchema, fields: &[S]) -> Option<Vec<u8>> {
    if fields.len() % 2 == 1 || fields.len() / 2 > schema.num_columns() {
        return None;
    }

    let mut values: Vec<Option<&[u8]>> = vec![None; schema.num_columns()];
    for pair in fields.chunks_exact(2) {
        let column = schema.column_by_name(pair[0].as_ref())?;
        values[column.index] = Some(pair[1].as_ref().as_bytes());
    }

    encode_with_mtime(schema, values)
}

fn encode_with_mtime(schema: &TableSchema, values: Vec<Option<&[u8]>>) -> Option<Vec<u8>> {
    let now = current_datetime();
    let mut values: Vec<Option<&[u8]>> = values;
    for &idx in schema.auto_mtime_fields() {
        if values[idx].is_none() {
            values[idx] = Some(now.as_bytes());
        }
    }

    let fields: Vec<&[u8]> = values.into_iter().map(|v| v.unwrap_or_default()).collect();
    encode_row(schema, &fields)
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes a row into `name -> value`, substituting defaults for empty values.
///
/// Returns `None` for key-only buffers and malformed rows.
pub fn decode_row_to_map<'a>(schema: &'a TableSchema, row: &'a [u8]) -> Option<HashMap<&'a str, &'a str>> {
    let values = decode_values(schema, row)?;
    Some(
        schema
            .columns()
            .iter()
            .zip(values)
            .map(|(column, value)| (column.name.as_str(), value))
            .collect(),
    )
}

/// Decodes a row into a flat `[name, value, ...]` list in column order.
pub fn decode_row_to_field_list<'a>(schema: &'a TableSchema, row: &'a [u8]) -> Option<Vec<&'a str>> {
    let values = decode_values(schema, row)?;
    let mut list = Vec::with_capacity(values.len() * 2);
    for (column, value) in schema.columns().iter().zip(values) {
        list.push(column.name.as_str());
        list.push(value);
    }
    Some(list)
}

fn decode_values<'a>(schema: &'a TableSchema, row: &'a [u8]) -> Option<Vec<&'a str>> {
    if row.len() < 2 || row[0] != ROW_MARKER {
        return None;
    }

    let columns = schema.columns();
    let mut start = header_len(columns.len());
    if row.len() < start {
        return None;
    }

    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let end = read_offset(row, i)?;
        let data_start = if column.is_primary_key { start + 1 } else { start };
        if data_start > end || end > row.len() {
            return None;
        }

        let value = std::str::from_utf8(&row[data_start..end]).ok()?;
        values.push(if value.is_empty() {
            column.default_value.as_str()
        } else {
            value
        });
        start = end;
    }

    Some(values)
}

// =============================================================================
// Keys
// =============================================================================

/// Returns true when `row` holds only a row key (no field data).
pub fn is_key_only(row: &[u8]) -> bool {
    row.first() == Some(&PRIMARY_KEY_SEPARATOR)
}

/// Extracts the row key of an encoded row.
///
/// Key-only buffers are returned verbatim. Prefix keys are borrowed from the
/// buffer; explicit keys are assembled in key order.
pub fn row_key<'a>(schema: &TableSchema, row: &'a [u8]) -> Option<Cow<'a, str>> {
    if row.len() < 2 {
        return None;
    }

    if is_key_only(row) {
        return std::str::from_utf8(row).ok().map(Cow::Borrowed);
    }

    if row[0] != ROW_MARKER {
        return None;
    }

    match schema.primary_key_indexes() {
        None => {
            let data_start = header_len(schema.num_columns());
            let end = read_offset(row, schema.num_primary_keys() - 1)?;
            if data_start > end || end > row.len() {
                return None;
            }
            std::str::from_utf8(&row[data_start..end])
                .ok()
                .map(Cow::Borrowed)
        }
        Some(indexes) => {
            let mut key = String::new();
            for &idx in indexes {
                key.push(PRIMARY_KEY_SEPARATOR as char);
                key.push_str(raw_value_at(schema, row, idx)?);
            }
            Some(Cow::Owned(key))
        }
    }
}

/// Builds a row key from primary key values given in key order.
pub fn assemble_key_from_list<S: AsRef<str>>(schema: &TableSchema, keys: &[S]) -> Option<String> {
    if keys.len() != schema.num_primary_keys() {
        return None;
    }

    let len = keys.iter().map(|k| k.as_ref().len() + 1).sum();
    let mut key = String::with_capacity(len);
    for value in keys {
        key.push(PRIMARY_KEY_SEPARATOR as char);
        key.push_str(value.as_ref());
    }
    Some(key)
}

/// Builds a row key from `key column name -> value` pairs.
///
/// Returns `None` unless the map names exactly the primary key columns.
pub fn assemble_key_from_map<K, V>(schema: &TableSchema, keys: &HashMap<K, V>) -> Option<String>
where
    K: AsRef<str> + std::hash::Hash + Eq + std::borrow::Borrow<str>,
    V: AsRef<str>,
{
    if keys.len() != schema.num_primary_keys() {
        return None;
    }

    let mut key = String::new();
    for idx in schema.key_column_indexes() {
        let value = keys.get(schema.column(idx).name.as_str())?;
        key.push(PRIMARY_KEY_SEPARATOR as char);
        key.push_str(value.as_ref());
    }
    Some(key)
}

// =============================================================================
// Random Access
// =============================================================================

/// Value of column `index`, with the column default substituted when empty.
///
/// Key-only and malformed buffers yield `""`. Panics if `index` is not a
/// column of `schema`.
pub fn value_at<'a>(schema: &'a TableSchema, row: &'a [u8], index: usize) -> &'a str {
    let column = schema.column(index);
    match raw_value_at(schema, row, index) {
        Some("") => column.default_value.as_str(),
        Some(value) => value,
        None => "",
    }
}

/// Value of the shard column.
pub fn shard_key_of<'a>(schema: &'a TableSchema, row: &'a [u8]) -> &'a str {
    value_at(schema, row, schema.shard_index())
}

fn raw_value_at<'a>(schema: &TableSchema, row: &'a [u8], index: usize) -> Option<&'a str> {
    if row.len() < 2 || row[0] != ROW_MARKER {
        return None;
    }

    let end = read_offset(row, index)?;
    let mut start = if index > 0 {
        read_offset(row, index - 1)?
    } else {
        header_len(schema.num_columns())
    };
    if schema.column(index).is_primary_key {
        start += 1;
    }

    if start > end || end > row.len() {
        return None;
    }
    std::str::from_utf8(&row[start..end]).ok()
}

// =============================================================================
// Validation
// =============================================================================

/// Checks that `fields` is a `[name, value, ...]` list naming known columns.
pub fn validate_field_names<S: AsRef<str>>(schema: &TableSchema, fields: &[S]) -> bool {
    if fields.len() % 2 == 1 || fields.len() / 2 > schema.num_columns() {
        return false;
    }

    fields
        .chunks_exact(2)
        .all(|pair| schema.column_by_name(pair[0].as_ref()).is_some())
}

// =============================================================================
// Helpers
// =============================================================================

fn header_len(n_column: usize) -> usize {
    n_column * OFFSET_SIZE + 1
}

fn read_offset(row: &[u8], column: usize) -> Option<usize> {
    let start = 1 + column * OFFSET_SIZE;
    let bytes: [u8; OFFSET_SIZE] = row.get(start..start + OFFSET_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes) as usize)
}

// =============================================================================
// Tests
// =============================================================================
