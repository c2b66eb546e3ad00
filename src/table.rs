//! # Table Row Cache
//!
//! Per-table cache of rows ([`TableRow`]) and shard indexes ([`TableRowIndex`])
//! with time-based LRU recycling.
//!
//! ## Arena Layout
//!
//! Both kinds of entry live in growable arenas and are linked into a ring by
//! slot index. Slot 0 is a permanent sentinel:
//!
//! ```text
//!        slots[0].next                               slots[0].prev
//!             │                                            │
//!             ▼                                            ▼
//!  [0] ⇄ [ LRU ] ⇄ [ ... ] ⇄ [ ... ] ⇄ [ ... ] ⇄ [ MRU ] ⇄ [0]
//! ```
//!
//! A hit moves the entry to the MRU end and stamps it with the current time,
//! so the ring is ordered by last-hit time and recycling can walk from the LRU
//! end and stop at the first entry that has not expired.
//!
//! ## Growth
//!
//! When an arena is full, expired entries are recycled first; only if nothing
//! could be evicted does the arena grow by about half.
//!
//! ## Busy Entries
//!
//! Entries with backend requests in flight, and rows still owned by a shard
//! index, are never evicted. Recycling stops at the first such entry.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::DateTime;
use tracing::{debug, info};

use crate::codec::{
    current_datetime, decode_row_to_field_list, decode_row_to_map, encode_row, is_key_only,
    unix_now, value_at, DATETIME_FORMAT,
};
use crate::error::{Error, Result};
use crate::schema::TableSchema;
use crate::types::RowContext;

// =============================================================================
// Configuration
// =============================================================================

/// Default row arena size, sentinel included.
pub const DEFAULT_INIT_ROW_NUM: usize = 1024;

/// Default time-to-live of a cache entry, in seconds.
pub const DEFAULT_TTL_SECS: i64 = 600;

const MIN_SHARD_INDEX_NUM: usize = 64;

/// Sizing and expiry of one table cache.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Initial arena size. Values below 2 are raised to 2.
    pub init_row_num: usize,
    /// Seconds since the last hit after which an entry may be recycled.
    pub ttl: i64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            init_row_num: DEFAULT_INIT_ROW_NUM,
            ttl: DEFAULT_TTL_SECS,
        }
    }
}

// =============================================================================
// Entries
// =============================================================================

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowState {
    /// Slot unused.
    #[default]
    None,
    /// Allocated; backend state unknown.
    Init,
    /// Known not to exist in the backing store.
    NotExist,
    /// Holds the backing store's current data.
    Valid,
}

impl RowState {
    pub fn as_str(self) -> &'static str {
        match self {
            RowState::None => "None",
            RowState::Init => "Init",
            RowState::NotExist => "NotExist",
            RowState::Valid => "Valid",
        }
    }
}

/// One cached row.
#[derive(Debug, Default)]
pub struct TableRow {
    pub state: RowState,
    /// Member of a shard index.
    pub has_shard_index: bool,
    pub has_shard_pending: bool,
    pub num_db_req: u32,
    pub num_db_sync_req: u32,
    pub last_hit_time: i64,
    /// Encoded row, or the row key while the row is not loaded.
    pub data: Vec<u8>,
    pub row_context: Option<Arc<RowContext>>,
    key: String,
    prev: u32,
    next: u32,
}

impl TableRow {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether backend requests against this row are still outstanding.
    pub fn is_busy(&self) -> bool {
        self.num_db_req > 0 || self.num_db_sync_req > 0
    }

    /// Overwrites non-key fields from a `[name, value, ...]` list and
    /// refreshes auto-maintained time columns.
    pub fn apply_update<S: AsRef<str>>(&mut self, schema: &TableSchema, fields: &[S]) -> Result<()> {
        if fields.len() % 2 == 1 {
            return Err(Error::InvalidRow("invalid fields".to_string()));
        }

        let mut values = self.owned_values(schema)?;
        for pair in fields.chunks_exact(2) {
            let name = pair[0].as_ref();
            let column = schema
                .column_by_name(name)
                .filter(|c| !c.is_primary_key)
                .ok_or_else(|| Error::InvalidRow(format!("invalid field '{}'", name)))?;
            values[column.index] = pair[1].as_ref().to_string();
        }

        self.store(schema, values)
    }

    /// Adds `delta` to the integer column at `index` and returns the new value.
    pub fn apply_incr_by(&mut self, schema: &TableSchema, index: usize, delta: i64) -> Result<i64> {
        let current: i64 = value_at(schema, &self.data, index)
            .parse()
            .map_err(|e| Error::InvalidRow(format!("column {} is not an integer: {}", index, e)))?;

        let mut values = self.owned_values(schema)?;
        let updated = current + delta;
        values[index] = updated.to_string();
        self.store(schema, values)?;
        Ok(updated)
    }

    /// One-line description of the row for diagnostics.
    pub fn debug_info(&self, schema: &TableSchema) -> String {
        let mut info = format!(
            "State:{}; NumDBReq:{}; NumDBSyncReq:{}; HasSI:{}",
            self.state.as_str(),
            self.num_db_req,
            self.num_db_sync_req,
            self.has_shard_index
        );

        if self.data.is_empty() {
            info.push_str(", Data:nil");
        } else if is_key_only(&self.data) {
            info.push_str(", Data:key");
        } else if let Some(fields) = decode_row_to_map(schema, &self.data) {
            info.push_str(", Data:{");
            for (i, column) in schema.columns().iter().enumerate() {
                let value = fields.get(column.name.as_str()).copied().unwrap_or_default();
                let sep = if i == 0 { "" } else { ", " };
                if column.is_number {
                    let _ = write!(info, "{}{}:{}", sep, column.name, value);
                } else {
                    let _ = write!(info, "{}{}:\"{}\"", sep, column.name, value);
                }
            }
            info.push('}');
        }

        let hit = DateTime::from_timestamp(self.last_hit_time, 0)
            .map(|t| t.format(DATETIME_FORMAT).to_string())
            .unwrap_or_default();
        let _ = write!(info, "; LastHitTime:\"{}\"", hit);
        info.push_str(if self.row_context.is_some() {
            "; DBContext:NotNil"
        } else {
            "; DBContext:nil"
        });
        info
    }

    fn owned_values(&self, schema: &TableSchema) -> Result<Vec<String>> {
        let list = decode_row_to_field_list(schema, &self.data)
            .ok_or_else(|| Error::InvalidRow("invalid row data".to_string()))?;
        Ok(list.iter().skip(1).step_by(2).map(|v| v.to_string()).collect())
    }

    fn store(&mut self, schema: &TableSchema, mut values: Vec<String>) -> Result<()> {
        if !schema.auto_mtime_fields().is_empty() {
            let now = current_datetime();
            for &idx in schema.auto_mtime_fields() {
                values[idx].clone_from(&now);
            }
        }

        self.data = encode_row(schema, &values)
            .ok_or_else(|| Error::InvalidRow("row cannot be encoded".to_string()))?;
        Ok(())
    }

    fn reset(&mut self) {
        let (prev, next) = (self.prev, self.next);
        *self = TableRow::default();
        self.prev = prev;
        self.next = next;
    }
}

/// The set of cached rows belonging to one shard value.
#[derive(Debug, Default)]
pub struct TableRowIndex {
    pub state: RowState,
    pub num_db_req: u32,
    pub num_db_sync_req: u32,
    pub num_pending_insert: u32,
    pub row_context: Option<Arc<RowContext>>,
    pub last_hit_time: i64,
    pub shard_key: String,
    rows: Vec<u32>,
    prev: u32,
    next: u32,
}

impl TableRowIndex {
    /// Slots of the member rows.
    pub fn rows(&self) -> &[u32] {
        &self.rows
    }

    pub fn is_busy(&self) -> bool {
        self.num_db_req > 0 || self.num_db_sync_req > 0
    }

    /// Drops all members, clearing their membership flags.
    pub fn expire(&mut self, rows: &mut [TableRow]) {
        for &idx in &self.rows {
            if let Some(row) = rows.get_mut(idx as usize) {
                row.has_shard_index = false;
            }
        }
        self.rows.clear();
        self.state = RowState::None;
    }

    fn reset(&mut self, rows: &mut [TableRow]) {
        self.expire(rows);
        let (prev, next) = (self.prev, self.next);
        *self = TableRowIndex::default();
        self.prev = prev;
        self.next = next;
    }
}

// =============================================================================
// Ring Helpers
// =============================================================================

trait RingLinks {
    fn prev(&self) -> u32;
    fn next(&self) -> u32;
    fn set_prev(&mut self, idx: u32);
    fn set_next(&mut self, idx: u32);
}

macro_rules! impl_ring_links {
    ($t:ty) => {
        impl RingLinks for $t {
            fn prev(&self) -> u32 {
                self.prev
            }
            fn next(&self) -> u32 {
                self.next
            }
            fn set_prev(&mut self, idx: u32) {
                self.prev = idx;
            }
            fn set_next(&mut self, idx: u32) {
                self.next = idx;
            }
        }
    };
}

impl_ring_links!(TableRow);
impl_ring_links!(TableRowIndex);

fn unlink<T: RingLinks>(slots: &mut [T], idx: u32) {
    let (prev, next) = (slots[idx as usize].prev(), slots[idx as usize].next());
    slots[prev as usize].set_next(next);
    slots[next as usize].set_prev(prev);
}

/// Links `idx` at the MRU end, right before the sentinel.
fn link_mru<T: RingLinks>(slots: &mut [T], idx: u32) {
    let last = slots[0].prev();
    slots[idx as usize].set_prev(last);
    slots[idx as usize].set_next(0);
    slots[last as usize].set_next(idx);
    slots[0].set_prev(idx);
}

fn touch<T: RingLinks>(slots: &mut [T], idx: u32) {
    if slots[0].prev() != idx {
        unlink(slots, idx);
        link_mru(slots, idx);
    }
}

// =============================================================================
// Arena
// =============================================================================

#[derive(Debug)]
struct Arena<T> {
    slots: Vec<T>,
    live: usize,
    /// Highest slot ever handed out.
    high_water: usize,
    free: Vec<u32>,
    map: HashMap<String, u32>,
}

impl<T: RingLinks + Default> Arena<T> {
    fn with_capacity(n: usize) -> Self {
        let n = n.max(2);
        let mut slots = Vec::with_capacity(n);
        slots.resize_with(n, T::default);
        Self {
            slots,
            live: 0,
            high_water: 0,
            free: Vec::new(),
            map: HashMap::with_capacity(n),
        }
    }

    fn empty() -> Self {
        Self {
            slots: Vec::new(),
            live: 0,
            high_water: 0,
            free: Vec::new(),
            map: HashMap::new(),
        }
    }

    fn is_allocated(&self) -> bool {
        !self.slots.is_empty()
    }

    fn is_full(&self) -> bool {
        self.live + 1 >= self.slots.len()
    }

    fn grow(&mut self) {
        let extra = (self.live + 1) / 2;
        let len = self.slots.len() + extra.max(1);
        self.slots.resize_with(len, T::default);
    }

    /// Takes a free slot and links it at the MRU end. The arena must not be full.
    fn allocate(&mut self, key: String) -> u32 {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.high_water += 1;
                self.high_water as u32
            }
        };
        self.live += 1;
        link_mru(&mut self.slots, idx);
        self.map.insert(key, idx);
        idx
    }

    fn release(&mut self, idx: u32, key: &str) {
        self.map.remove(key);
        unlink(&mut self.slots, idx);
        self.free.push(idx);
        self.live -= 1;
    }

    fn lru(&self) -> u32 {
        self.slots.first().map_or(0, RingLinks::next)
    }
}

// =============================================================================
// Table
// =============================================================================

/// Outcome of [`Table::reload_schema`].
#[derive(Debug)]
pub enum Reloaded {
    /// The table was idle and has been reset in place; carries the number of
    /// rows dropped.
    InPlace(usize),
    /// The table was busy and is now outdated; use the replacement.
    Replaced(Table),
}

/// Cache of one table's rows and shard indexes.
///
/// Not thread-safe; owned by a single accessor.
#[derive(Debug)]
pub struct Table {
    /// Multi-row backend requests in flight.
    pub num_db_multi_req: u32,
    /// Single-row backend requests in flight.
    pub num_db_req: u32,
    id: usize,
    schema: Arc<TableSchema>,
    rows: Arena<TableRow>,
    shard_indexes: Arena<TableRowIndex>,
    last_hit: i64,
    outdated: bool,
    config: TableConfig,
}

impl Table {
    pub fn new(id: usize, schema: Arc<TableSchema>, config: TableConfig) -> Self {
        Self {
            num_db_multi_req: 0,
            num_db_req: 0,
            id,
            schema,
            rows: Arena::with_capacity(config.init_row_num),
            shard_indexes: Arena::empty(),
            last_hit: unix_now(),
            outdated: false,
            config,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn is_outdated(&self) -> bool {
        self.outdated
    }

    /// Number of live rows.
    pub fn num_rows(&self) -> usize {
        self.rows.live
    }

    /// Number of live shard indexes.
    pub fn num_shard_indexes(&self) -> usize {
        self.shard_indexes.live
    }

    /// Row arena size, sentinel included.
    pub fn row_capacity(&self) -> usize {
        self.rows.slots.len()
    }

    fn is_busy(&self) -> bool {
        self.num_db_req > 0 || self.num_db_multi_req > 0
    }

    // =========================================================================
    // Rows
    // =========================================================================

    /// Looks up `key`, creating the entry on a miss, and marks it most
    /// recently used.
    pub fn hit_row(&mut self, key: &str) -> (u32, &mut TableRow) {
        self.hit_row_at(key, unix_now())
    }

    /// [`hit_row`](Self::hit_row) with an explicit clock.
    pub fn hit_row_at(&mut self, key: &str, now: i64) -> (u32, &mut TableRow) {
        self.last_hit = now;

        if let Some(&idx) = self.rows.map.get(key) {
            self.touch_row(idx, now);
            return (idx, &mut self.rows.slots[idx as usize]);
        }

        if !self.rows.is_allocated() {
            self.rows = Arena::with_capacity(self.config.init_row_num);
        } else if self.rows.is_full() {
            self.recycle(0, now - self.config.ttl);
            if self.rows.is_full() {
                self.rows.grow();
                debug!(table = self.schema.name(), slots = self.rows.slots.len(), "grew row arena");
            }
        }

        let idx = self.rows.allocate(key.to_string());
        let row = &mut self.rows.slots[idx as usize];
        row.key = key.to_string();
        row.data = key.as_bytes().to_vec();
        row.last_hit_time = now;
        row.state = RowState::None;
        (idx, row)
    }

    /// Existing row by key, without touching it.
    pub fn row(&self, key: &str) -> Option<&TableRow> {
        self.rows.map.get(key).map(|&idx| &self.rows.slots[idx as usize])
    }

    /// Row by slot. Panics on an out-of-range slot.
    pub fn row_by_idx(&self, idx: u32) -> &TableRow {
        &self.rows.slots[idx as usize]
    }

    pub fn row_by_idx_mut(&mut self, idx: u32) -> &mut TableRow {
        &mut self.rows.slots[idx as usize]
    }

    /// Describes the cached row under `key`.
    pub fn row_debug_info(&self, key: &str) -> Option<String> {
        self.row(key).map(|row| row.debug_info(&self.schema))
    }

    fn touch_row(&mut self, idx: u32, now: i64) {
        self.rows.slots[idx as usize].last_hit_time = now;
        touch(&mut self.rows.slots, idx);
    }

    // =========================================================================
    // Shard Indexes
    // =========================================================================

    /// Looks up the shard index of `shard_key`, creating it on a miss, and
    /// touches it together with all member rows.
    ///
    /// Returns the slot, the entry, and how many members have sync and any
    /// backend requests in flight.
    pub fn hit_multi_row(&mut self, shard_key: &str) -> (u32, &mut TableRowIndex, usize, usize) {
        self.hit_multi_row_at(shard_key, unix_now())
    }

    /// [`hit_multi_row`](Self::hit_multi_row) with an explicit clock.
    pub fn hit_multi_row_at(&mut self, shard_key: &str, now: i64) -> (u32, &mut TableRowIndex, usize, usize) {
        self.last_hit = now;
        self.ensure_shard_arena();

        if let Some(&idx) = self.shard_indexes.map.get(shard_key) {
            let (mut n_sync, mut n_req) = (0, 0);
            let members = std::mem::take(&mut self.shard_indexes.slots[idx as usize].rows);
            for &row_idx in &members {
                self.touch_row(row_idx, now);
                let row = &self.rows.slots[row_idx as usize];
                if row.num_db_sync_req > 0 {
                    n_sync += 1;
                }
                if row.num_db_req > 0 {
                    n_req += 1;
                }
            }

            let si = &mut self.shard_indexes.slots[idx as usize];
            si.rows = members;
            si.last_hit_time = now;
            touch(&mut self.shard_indexes.slots, idx);
            return (idx, &mut self.shard_indexes.slots[idx as usize], n_sync, n_req);
        }

        if self.shard_indexes.is_full() {
            self.recycle(0, now - self.config.ttl);
            self.ensure_shard_arena();
            if self.shard_indexes.is_full() {
                self.shard_indexes.grow();
                debug!(
                    table = self.schema.name(),
                    slots = self.shard_indexes.slots.len(),
                    "grew shard index arena"
                );
            }
        }

        let idx = self.shard_indexes.allocate(shard_key.to_string());
        let si = &mut self.shard_indexes.slots[idx as usize];
        si.shard_key = shard_key.to_string();
        si.last_hit_time = now;
        (idx, si, 0, 0)
    }

    /// Adds the row at `row_idx` to the shard index of `shard_key`.
    ///
    /// Fails when the index does not exist, is not valid, or the row already
    /// belongs to an index. An index known not to exist becomes valid.
    pub fn insert_row_index(&mut self, shard_key: &str, row_idx: u32) -> bool {
        let Some(&si_idx) = self.shard_indexes.map.get(shard_key) else {
            return false;
        };
        if row_idx == 0 || row_idx as usize >= self.rows.slots.len() {
            return false;
        }

        let si = &mut self.shard_indexes.slots[si_idx as usize];
        let row = &mut self.rows.slots[row_idx as usize];

        if si.state == RowState::NotExist {
            si.state = RowState::Valid;
        }
        if row.has_shard_index || si.state != RowState::Valid {
            return false;
        }

        si.rows.push(row_idx);
        row.has_shard_index = true;
        true
    }

    pub fn shard_index(&self, shard_key: &str) -> Option<&TableRowIndex> {
        self.shard_indexes
            .map
            .get(shard_key)
            .map(|&idx| &self.shard_indexes.slots[idx as usize])
    }

    pub fn shard_index_mut(&mut self, shard_key: &str) -> Option<&mut TableRowIndex> {
        let idx = *self.shard_indexes.map.get(shard_key)?;
        Some(&mut self.shard_indexes.slots[idx as usize])
    }

    /// Shard index by slot. Panics on an out-of-range slot.
    pub fn shard_index_by_idx(&self, idx: u32) -> &TableRowIndex {
        &self.shard_indexes.slots[idx as usize]
    }

    /// Sync and total backend requests in flight for `shard_key`.
    pub fn shard_db_req_num(&self, shard_key: &str) -> (u32, u32) {
        self.shard_index(shard_key)
            .map_or((0, 0), |si| (si.num_db_sync_req, si.num_db_req))
    }

    /// Drops the members of the shard index of `shard_key`.
    pub fn expire_shard_index(&mut self, shard_key: &str) -> bool {
        let Some(&idx) = self.shard_indexes.map.get(shard_key) else {
            return false;
        };
        self.shard_indexes.slots[idx as usize].expire(&mut self.rows.slots);
        true
    }

    fn ensure_shard_arena(&mut self) {
        if !self.shard_indexes.is_allocated() {
            let n = (self.config.init_row_num / 4).max(MIN_SHARD_INDEX_NUM);
            self.shard_indexes = Arena::with_capacity(n);
        }
    }

    // =========================================================================
    // Recycling
    // =========================================================================

    /// Evicts up to `num` entries (all when `num` is 0) whose last hit is at
    /// or before `expire`, least recently used first.
    ///
    /// A table idle since before `expire` is reset as a whole. Returns the
    /// number of rows evicted.
    pub fn recycle(&mut self, num: usize, expire: i64) -> usize {
        if self.outdated {
            return 0;
        }

        if self.last_hit < expire {
            if let Ok(n) = self.reset() {
                return n;
            }
        }

        self.recycle_shard_indexes(num, expire);

        let limit = if num == 0 || num > self.rows.live {
            self.rows.live
        } else {
            num
        };

        let mut n = 0;
        while n < limit {
            let idx = self.rows.lru();
            if idx == 0 {
                break;
            }

            let row = &self.rows.slots[idx as usize];
            if row.last_hit_time > expire || row.is_busy() || row.has_shard_index {
                break;
            }

            let key = std::mem::take(&mut self.rows.slots[idx as usize].key);
            self.rows.release(idx, &key);
            self.rows.slots[idx as usize].reset();
            n += 1;
        }

        if n > 0 {
            debug!(table = self.schema.name(), evicted = n, "recycled rows");
        }
        n
    }

    fn recycle_shard_indexes(&mut self, num: usize, expire: i64) -> usize {
        if self.shard_indexes.live == 0 {
            return 0;
        }

        let limit = if num == 0 || num > self.shard_indexes.live {
            self.shard_indexes.live
        } else {
            num
        };

        let mut n = 0;
        while n < limit {
            let idx = self.shard_indexes.lru();
            if idx == 0 {
                break;
            }

            let si = &self.shard_indexes.slots[idx as usize];
            if si.last_hit_time > expire || si.is_busy() {
                break;
            }

            let key = std::mem::take(&mut self.shard_indexes.slots[idx as usize].shard_key);
            self.shard_indexes.release(idx, &key);
            self.shard_indexes.slots[idx as usize].reset(&mut self.rows.slots);
            n += 1;
        }
        n
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Drops every cached entry. Fails while backend requests are in flight.
    ///
    /// Returns the number of rows dropped.
    pub fn reset(&mut self) -> Result<usize> {
        if self.is_busy() {
            return Err(Error::TableBusy {
                table: self.schema.name().to_string(),
            });
        }

        let n = self.rows.live;
        if n == 0 && self.shard_indexes.live == 0 {
            return Ok(0);
        }

        self.rows = Arena::with_capacity(self.config.init_row_num);
        self.shard_indexes = Arena::empty();
        self.last_hit = unix_now();
        Ok(n)
    }

    /// Switches to `schema`, resetting in place when idle; otherwise marks this
    /// table outdated and returns a fresh replacement.
    pub fn reload_schema(&mut self, schema: Arc<TableSchema>) -> Reloaded {
        match self.reset() {
            Ok(n) => {
                info!(table = schema.name(), rows = n, "reloaded table in place");
                self.schema = schema;
                Reloaded::InPlace(n)
            }
            Err(_) => {
                info!(
                    table = schema.name(),
                    rows = self.rows.live,
                    "table busy, replacing with a fresh instance"
                );
                self.outdated = true;
                Reloaded::Replaced(Table::new(self.id, schema, self.config.clone()))
            }
        }
    }

    /// Frees the memory of an outdated table once it is idle, or at once when
    /// `force` is set. Returns true when the table was cleared.
    pub fn check_and_clear(&mut self, force: bool) -> bool {
        if !self.outdated || self.last_hit == 0 {
            return false;
        }
        if !force && self.is_busy() {
            return false;
        }

        self.num_db_req = 0;
        self.num_db_multi_req = 0;
        self.rows = Arena::empty();
        self.shard_indexes = Arena::empty();
        self.last_hit = 0;
        true
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{assemble_key_from_list, encode_row};
    use crate::schema::ColumnType;

    const TTL: i64 = 10;

    fn schema() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::builder("bag")
                .column("uid", ColumnType::Int)
                .column("slot", ColumnType::Int)
                .column("count", ColumnType::Int)
                .column("mtime", ColumnType::Time)
                .primary_key(&["uid", "slot"])
                .auto_mtime("mtime")
                .build()
                .unwrap(),
        )
    }

    /// Table with room for `n` rows.
    fn table(n: usize) -> Table {
        Table::new(
            1,
            schema(),
            TableConfig {
                init_row_num: n + 1,
                ttl: TTL,
            },
        )
    }

    fn key(uid: u32, slot: u32) -> String {
        assemble_key_from_list(&schema(), &[uid.to_string(), slot.to_string()]).unwrap()
    }

    #[test]
    fn test_new_row_holds_its_key() {
        let mut t = table(4);
        let k = key(1, 1);
        let (idx, row) = t.hit_row_at(&k, 100);
        assert_eq!(idx, 1);
        assert_eq!(row.data, k.as_bytes());
        assert_eq!(row.state, RowState::None);
        assert_eq!(t.num_rows(), 1);

        let (again, _) = t.hit_row_at(&k, 101);
        assert_eq!(again, idx);
        assert_eq!(t.row(&k).unwrap().last_hit_time, 101);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut t = table(3);
        t.hit_row_at(&key(1, 1), 100);
        t.hit_row_at(&key(1, 2), 101);
        t.hit_row_at(&key(1, 3), 102);

        t.hit_row_at(&key(1, 4), 110);
        assert!(t.row(&key(1, 1)).is_none());
        assert!(t.row(&key(1, 2)).is_some());
        assert!(t.row(&key(1, 4)).is_some());
        assert_eq!(t.num_rows(), 3);
        assert_eq!(t.row_capacity(), 4);
    }

    #[test]
    fn test_retouched_row_is_not_the_victim() {
        let mut t = table(3);
        t.hit_row_at(&key(1, 1), 100);
        t.hit_row_at(&key(1, 2), 101);
        t.hit_row_at(&key(1, 3), 102);
        t.hit_row_at(&key(1, 1), 105);

        t.hit_row_at(&key(1, 4), 111);
        assert!(t.row(&key(1, 1)).is_some());
        assert!(t.row(&key(1, 2)).is_none());
        assert!(t.row(&key(1, 3)).is_some());
    }

    #[test]
    fn test_grows_when_nothing_expired() {
        let mut t = table(2);
        t.hit_row_at(&key(1, 1), 100);
        t.hit_row_at(&key(1, 2), 100);
        t.hit_row_at(&key(1, 3), 101);

        assert_eq!(t.num_rows(), 3);
        assert!(t.row_capacity() > 3);
        assert!(t.row(&key(1, 1)).is_some());
    }

    #[test]
    fn test_busy_rows_stop_recycling() {
        let mut t = table(3);
        let (idx, _) = t.hit_row_at(&key(1, 1), 100);
        t.hit_row_at(&key(1, 2), 101);
        t.hit_row_at(&key(1, 3), 300);
        t.row_by_idx_mut(idx).num_db_req = 1;

        assert_eq!(t.recycle(0, 200), 0);
        assert_eq!(t.num_rows(), 3);

        t.row_by_idx_mut(idx).num_db_req = 0;
        assert_eq!(t.recycle(1, 200), 1);
        assert!(t.row(&key(1, 1)).is_none());
    }

    #[test]
    fn test_shard_index_membership() {
        let mut t = table(8);
        let (r1, _) = t.hit_row_at(&key(1, 1), 100);
        let (r2, _) = t.hit_row_at(&key(1, 2), 100);

        let (_, si, n_sync, n_req) = t.hit_multi_row_at("1", 100);
        assert_eq!((n_sync, n_req), (0, 0));
        si.state = RowState::NotExist;

        assert!(t.insert_row_index("1", r1));
        assert!(!t.insert_row_index("1", r1));
        assert!(t.insert_row_index("1", r2));
        assert!(!t.insert_row_index("2", r2));
        assert_eq!(t.shard_index("1").unwrap().state, RowState::Valid);
        assert!(t.row_by_idx(r1).has_shard_index);

        t.row_by_idx_mut(r2).num_db_sync_req = 1;
        t.row_by_idx_mut(r2).num_db_req = 1;
        let (_, si, n_sync, n_req) = t.hit_multi_row_at("1", 105);
        assert_eq!(si.rows().len(), 2);
        assert_eq!((n_sync, n_req), (1, 1));
        assert_eq!(t.row_by_idx(r1).last_hit_time, 105);

        t.shard_index_mut("1").unwrap().num_db_req = 2;
        assert_eq!(t.shard_db_req_num("1"), (0, 2));
        assert_eq!(t.shard_db_req_num("9"), (0, 0));

        assert!(t.expire_shard_index("1"));
        assert!(!t.row_by_idx(r1).has_shard_index);
        assert!(t.shard_index("1").unwrap().rows().is_empty());
    }

    #[test]
    fn test_recycling_shard_index_clears_member_flags() {
        let mut t = table(8);
        let (r1, _) = t.hit_row_at(&key(1, 1), 100);
        let (_, si, _, _) = t.hit_multi_row_at("1", 100);
        si.state = RowState::Valid;
        assert!(t.insert_row_index("1", r1));
        t.hit_row_at(&key(2, 1), 150);

        assert_eq!(t.recycle(0, 120), 1);
        assert!(t.shard_index("1").is_none());
        assert!(t.row(&key(1, 1)).is_none());
        assert!(t.row(&key(2, 1)).is_some());
    }

    #[test]
    fn test_reset_and_reload() {
        let mut t = table(4);
        t.hit_row_at(&key(1, 1), 100);
        t.num_db_req = 1;
        assert!(matches!(t.reset(), Err(Error::TableBusy { .. })));

        match t.reload_schema(schema()) {
            Reloaded::Replaced(fresh) => {
                assert_eq!(fresh.num_rows(), 0);
                assert_eq!(fresh.id(), 1);
            }
            Reloaded::InPlace(_) => panic!("busy table reloaded in place"),
        }
        assert!(t.is_outdated());
        assert_eq!(t.recycle(0, i64::MAX), 0);

        assert!(!t.check_and_clear(false));
        assert!(t.check_and_clear(true));
        assert_eq!(t.num_rows(), 0);

        let mut idle = table(4);
        idle.hit_row_at(&key(1, 1), 100);
        assert!(matches!(idle.reload_schema(schema()), Reloaded::InPlace(1)));
        assert_eq!(idle.num_rows(), 0);
        assert!(!idle.is_outdated());
    }

    #[test]
    fn test_idle_table_is_reset_by_recycle() {
        let mut t = table(4);
        t.hit_row_at(&key(1, 1), 100);
        t.hit_row_at(&key(1, 2), 100);
        assert_eq!(t.recycle(1, 200), 2);
        assert_eq!(t.num_rows(), 0);
    }

    #[test]
    fn test_row_updates() {
        let schema = schema();
        let mut t = table(4);
        let k = key(1, 1);
        let (_, row) = t.hit_row_at(&k, 100);
        row.data = encode_row(&schema, &["1", "1", "5", ""]).unwrap();
        row.state = RowState::Valid;

        row.apply_update(&schema, &["count", "7"]).unwrap();
        assert_eq!(value_at(&schema, &row.data, 2), "7");
        assert!(!value_at(&schema, &row.data, 3).is_empty());

        assert_eq!(row.apply_incr_by(&schema, 2, 3).unwrap(), 10);
        assert!(row.apply_update(&schema, &["uid", "2"]).is_err());
        assert!(row.apply_update(&schema, &["count"]).is_err());

        let info = t.row_debug_info(&k).unwrap();
        assert!(info.starts_with("State:Valid"));
        assert!(info.contains("count:10"));
        assert!(info.contains("DBContext:nil"));
    }

    #[test]
    fn test_updates_reject_key_only_rows() {
        let schema = schema();
        let mut t = table(4);
        let (_, row) = t.hit_row_at(&key(1, 1), 100);
        assert!(row.apply_update(&schema, &["count", "1"]).is_err());
        assert!(row.apply_incr_by(&schema, 2, 1).is_err());
        assert!(row.debug_info(&schema).contains("Data:key"));
    }
}
