//! # Table Schemas
//!
//! A [`TableSchema`] describes the column layout of one backing-store table:
//! column order, semantic types, defaults, which columns form the primary key
//! and which column partitions the table into shards. Every other module reads
//! it; nothing mutates it once built.
//!
//! ## Primary Key Layouts
//!
//! ```text
//! prefix keys:     [ pk0 | pk1 | col2 | col3 ]      primary_key_indexes = None
//! explicit keys:   [ col0 | pk  | col2 | pk  ]      primary_key_indexes = Some([1, 3])
//! ```
//!
//! Prefix keys let the codec read a row key straight out of the encoded buffer
//! (one header lookup); explicit keys are concatenated column by column.
//!
//! ## Schema Manager
//!
//! [`TableSchemaManager`] caches loaded schemas behind a `RwLock` so many
//! readers can resolve schemas while a reload is in progress.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::info;

use crate::driver::Driver;
use crate::error::{Error, Result};

// =============================================================================
// Column Types
// =============================================================================

/// Semantic type of a column, used when comparing values in conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// Compared lexicographically.
    String,
    /// Parsed as `i64`.
    Int,
    /// Parsed as `f64`.
    Float,
    /// Parsed from `YYYY-MM-DD HH:MM:SS` into a unix timestamp.
    Time,
}

impl ColumnType {
    /// Returns true for types stored as plain numbers.
    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Int | ColumnType::Float)
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    /// Column name as declared by the backing store.
    pub name: String,
    /// Semantic type.
    pub column_type: ColumnType,
    /// Whether the column is part of the primary key.
    pub is_primary_key: bool,
    /// Whether values are numbers (int or float).
    pub is_number: bool,
    /// Position in [`TableSchema::columns`].
    pub index: usize,
    /// Value reported when the stored value is empty.
    pub default_value: String,
}

impl ColumnSchema {
    /// Compares the parts of two columns that affect encoding and decoding.
    pub fn same_definition(&self, other: &ColumnSchema) -> bool {
        self.column_type == other.column_type
            && self.is_primary_key == other.is_primary_key
            && self.name == other.name
            && self.default_value == other.default_value
    }
}

// =============================================================================
// Table Schema
// =============================================================================

/// Immutable layout of one table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    name: String,
    shard_key: String,
    shard_index: usize,
    columns: Vec<ColumnSchema>,
    num_primary_keys: usize,
    primary_key_indexes: Option<Vec<usize>>,
    auto_mtime_fields: Vec<usize>,
    by_name: HashMap<String, usize>,
}

impl TableSchema {
    /// Starts building a schema for table `name`.
    pub fn builder(name: impl Into<String>) -> TableSchemaBuilder {
        TableSchemaBuilder {
            name: name.into(),
            columns: Vec::new(),
            primary_keys: Vec::new(),
            shard_key: None,
            auto_mtime: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the column that partitions multi-row operations.
    pub fn shard_key(&self) -> &str {
        &self.shard_key
    }

    /// Index of the shard column.
    pub fn shard_index(&self) -> usize {
        self.shard_index
    }

    pub fn is_string_shard_key(&self) -> bool {
        self.columns[self.shard_index].column_type == ColumnType::String
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    /// Column at `index`. Panics when out of range.
    pub fn column(&self, index: usize) -> &ColumnSchema {
        &self.columns[index]
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_primary_keys(&self) -> usize {
        self.num_primary_keys
    }

    /// Explicit primary key column indexes, or `None` when the keys are the
    /// leading columns in declared order.
    pub fn primary_key_indexes(&self) -> Option<&[usize]> {
        self.primary_key_indexes.as_deref()
    }

    /// Primary key column indexes in key order, whichever layout is used.
    pub fn key_column_indexes(&self) -> Vec<usize> {
        match &self.primary_key_indexes {
            Some(indexes) => indexes.clone(),
            None => (0..self.num_primary_keys).collect(),
        }
    }

    /// Columns whose value is refreshed with the current time on every write.
    pub fn auto_mtime_fields(&self) -> &[usize] {
        &self.auto_mtime_fields
    }

    /// Looks up a column by name.
    pub fn column_by_name(&self, name: &str) -> Option<&ColumnSchema> {
        self.by_name.get(name).map(|&i| &self.columns[i])
    }

    /// Returns true when both schemas encode rows identically.
    pub fn same_layout(&self, other: &TableSchema) -> bool {
        self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(other.columns.iter())
                .all(|(a, b)| a.same_definition(b))
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`TableSchema`]; validates the layout invariants in `build`.
#[derive(Debug, Clone)]
pub struct TableSchemaBuilder {
    name: String,
    columns: Vec<(String, ColumnType, String)>,
    primary_keys: Vec<String>,
    shard_key: Option<String>,
    auto_mtime: Vec<String>,
}

impl TableSchemaBuilder {
    /// Appends a column with an empty default value.
    pub fn column(self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.column_with_default(name, column_type, "")
    }

    /// Appends a column with a default value.
    pub fn column_with_default(
        mut self,
        name: impl Into<String>,
        column_type: ColumnType,
        default_value: impl Into<String>,
    ) -> Self {
        self.columns
            .push((name.into(), column_type, default_value.into()));
        self
    }

    /// Sets the primary key columns, in key order.
    pub fn primary_key<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.primary_keys = names.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Sets the shard column. Defaults to the first primary key.
    pub fn shard_key(mut self, name: impl Into<String>) -> Self {
        self.shard_key = Some(name.into());
        self
    }

    /// Marks a column as maintained with the last write time.
    pub fn auto_mtime(mut self, name: impl Into<String>) -> Self {
        self.auto_mtime.push(name.into());
        self
    }

    pub fn build(self) -> Result<TableSchema> {
        let name = self.name;
        if self.columns.is_empty() {
            return Err(Error::Schema(format!("table '{}' has no columns", name)));
        }

        let mut by_name = HashMap::with_capacity(self.columns.len());
        let mut columns = Vec::with_capacity(self.columns.len());
        for (index, (col_name, column_type, default_value)) in self.columns.into_iter().enumerate() {
            if by_name.insert(col_name.clone(), index).is_some() {
                return Err(Error::Schema(format!(
                    "table '{}' declares column '{}' twice",
                    name, col_name
                )));
            }

            columns.push(ColumnSchema {
                name: col_name,
                column_type,
                is_primary_key: false,
                is_number: column_type.is_numeric(),
                index,
                default_value,
            });
        }

        if self.primary_keys.is_empty() {
            return Err(Error::Schema(format!("table '{}' has no primary key", name)));
        }

        let mut key_indexes = Vec::with_capacity(self.primary_keys.len());
        for key in &self.primary_keys {
            let index = *by_name.get(key.as_str()).ok_or_else(|| {
                Error::Schema(format!("table '{}' has no key column '{}'", name, key))
            })?;
            if columns[index].is_primary_key {
                return Err(Error::Schema(format!(
                    "table '{}' lists key column '{}' twice",
                    name, key
                )));
            }
            columns[index].is_primary_key = true;
            key_indexes.push(index);
        }

        let num_primary_keys = key_indexes.len();
        let is_prefix = key_indexes.iter().enumerate().all(|(i, &idx)| i == idx);

        let shard_index = match &self.shard_key {
            Some(shard) => {
                let index = *by_name.get(shard.as_str()).ok_or_else(|| {
                    Error::Schema(format!("table '{}' has no shard column '{}'", name, shard))
                })?;
                if !columns[index].is_primary_key {
                    return Err(Error::Schema(format!(
                        "shard column '{}' of table '{}' is not a primary key",
                        shard, name
                    )));
                }
                index
            }
            None => key_indexes[0],
        };

        let mut auto_mtime_fields = Vec::with_capacity(self.auto_mtime.len());
        for field in &self.auto_mtime {
            let index = *by_name.get(field.as_str()).ok_or_else(|| {
                Error::Schema(format!("table '{}' has no column '{}'", name, field))
            })?;
            if columns[index].is_primary_key {
                return Err(Error::Schema(format!(
                    "key column '{}' of table '{}' cannot be auto-maintained",
                    field, name
                )));
            }
            auto_mtime_fields.push(index);
        }

        Ok(TableSchema {
            shard_key: columns[shard_index].name.clone(),
            name,
            shard_index,
            columns,
            num_primary_keys,
            primary_key_indexes: if is_prefix { None } else { Some(key_indexes) },
            auto_mtime_fields,
            by_name,
        })
    }
}

// =============================================================================
// Schema Manager
// =============================================================================

/// Process-local registry of loaded schemas, backed by a driver.
pub struct TableSchemaManager<D> {
    schemas: RwLock<HashMap<String, Arc<TableSchema>>>,
    driver: Mutex<D>,
}

impl<D: Driver> TableSchemaManager<D> {
    pub fn new(driver: D) -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            driver: Mutex::new(driver),
        }
    }

    /// Returns the cached schema for `name`, loading it on first use.
    pub fn load_schema(&self, name: &str) -> Result<Arc<TableSchema>> {
        {
            let schemas = self.schemas.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(schema) = schemas.get(name) {
                return Ok(Arc::clone(schema));
            }
        }

        let mut schemas = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(schema) = schemas.get(name) {
            return Ok(Arc::clone(schema));
        }

        let schema = Arc::new(self.with_driver(|d| d.load_table_schema(name))?);
        info!(table = name, columns = schema.num_columns(), "loaded table schema");
        schemas.insert(name.to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Reloads the schema of an already loaded table.
    ///
    /// Returns `Ok(None)` when the layout is unchanged and `force` is false.
    /// Changing the number of primary keys is rejected.
    pub fn reload_schema(&self, name: &str, force: bool) -> Result<Option<Arc<TableSchema>>> {
        let mut schemas = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        let current = schemas.get(name).cloned().ok_or_else(|| {
            Error::Schema(format!(
                "table '{}' is not loaded, no need to reload a new table",
                name
            ))
        })?;

        let fresh = self.with_driver(|d| d.load_table_schema(name))?;
        if current.num_primary_keys() != fresh.num_primary_keys() {
            return Err(Error::Schema(format!(
                "table '{}' cannot alter its primary key",
                name
            )));
        }

        if !force && current.same_layout(&fresh) {
            return Ok(None);
        }

        let fresh = Arc::new(fresh);
        info!(table = name, force, "reloaded table schema");
        schemas.insert(name.to_string(), Arc::clone(&fresh));
        Ok(Some(fresh))
    }

    /// Runs `f` with exclusive access to the driver.
    pub fn with_driver<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut driver)
    }
}

// =============================================================================
// Tests
// =============================================================================
