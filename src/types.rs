//! # Request and Reply Types
//!
//! These types model one logical row operation travelling through the
//! [`Processor`](crate::processor::Processor): the request a caller builds,
//! the payload each command carries, and the reply a driver produces.
//!
//! ## Lifecycle
//!
//! ```text
//! caller builds DbRequest ──► append_request ──► (merged into a group)
//!                                   │
//!                                   ▼
//!                               execute ──► Driver ──► DbReply
//!                                   │
//!                                   ▼
//!                     detached request returned with `reply` set
//! ```
//!
//! ## Payloads as a Sum Type
//!
//! [`RequestData`] has one variant per command carrying exactly what that
//! command needs, so the command of a request is derived from its payload and
//! dispatch never has to guess a payload shape.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Error;
use crate::schema::TableSchema;

// =============================================================================
// Commands
// =============================================================================

/// Kind of row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbCommand {
    /// No backend work; completes with an empty reply.
    None,
    Insert,
    DeleteSingle,
    UpdateSingle,
    IncrBySingle,
    SelectSingle,
    SelectMulti,
    DeleteMulti,
    CountMulti,
}

impl DbCommand {
    /// Returns true for commands addressed by shard value instead of row key.
    pub fn is_multi(self) -> bool {
        matches!(
            self,
            DbCommand::SelectMulti | DbCommand::DeleteMulti | DbCommand::CountMulti
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DbCommand::None => "none",
            DbCommand::Insert => "insert",
            DbCommand::DeleteSingle => "delete_single",
            DbCommand::UpdateSingle => "update_single",
            DbCommand::IncrBySingle => "incr_by_single",
            DbCommand::SelectSingle => "select_single",
            DbCommand::SelectMulti => "select_multi",
            DbCommand::DeleteMulti => "delete_multi",
            DbCommand::CountMulti => "count_multi",
        }
    }
}

impl fmt::Display for DbCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Payload of an increment: add `delta` to `column` if `where_clause` holds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IncrByData {
    pub column: String,
    pub delta: i64,
    /// Optional WHERE clause checked against the current row. Empty means none.
    pub where_clause: String,
}

impl IncrByData {
    pub fn new(column: impl Into<String>, delta: i64) -> Self {
        Self {
            column: column.into(),
            delta,
            where_clause: String::new(),
        }
    }

    pub fn with_where(mut self, where_clause: impl Into<String>) -> Self {
        self.where_clause = where_clause.into();
        self
    }
}

/// Payload of a multi-row operation: an optional WHERE clause and its `?`
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MultiRequestData {
    pub where_clause: String,
    pub params: Vec<String>,
}

/// Command-specific payload of a [`DbRequest`].
///
/// Field lists are flat `[name, value, name, value, ...]` vectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestData {
    None,
    Insert(Vec<String>),
    DeleteSingle,
    UpdateSingle(Vec<String>),
    IncrBySingle(IncrByData),
    SelectSingle,
    SelectMulti,
    DeleteMulti(MultiRequestData),
    CountMulti,
}

impl RequestData {
    /// The command this payload belongs to.
    pub fn command(&self) -> DbCommand {
        match self {
            RequestData::None => DbCommand::None,
            RequestData::Insert(_) => DbCommand::Insert,
            RequestData::DeleteSingle => DbCommand::DeleteSingle,
            RequestData::UpdateSingle(_) => DbCommand::UpdateSingle,
            RequestData::IncrBySingle(_) => DbCommand::IncrBySingle,
            RequestData::SelectSingle => DbCommand::SelectSingle,
            RequestData::SelectMulti => DbCommand::SelectMulti,
            RequestData::DeleteMulti(_) => DbCommand::DeleteMulti,
            RequestData::CountMulti => DbCommand::CountMulti,
        }
    }
}

// =============================================================================
// Replies
// =============================================================================

/// Result payload of a driver call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReplyData {
    #[default]
    None,
    /// Number of rows written or deleted.
    Affected(i64),
    /// One encoded row, or `None` when the key does not exist.
    Row(Option<Vec<u8>>),
    /// Encoded rows of one shard.
    Rows(Vec<Vec<u8>>),
}

/// Outcome of one driver call.
///
/// `err` is a backing-store fault and makes the processor retry the request
/// unless it is `sync` or `pre_req`. `msg` is a terminal rejection such as
/// `"duplicate key"`.
#[derive(Debug, Default)]
pub struct DbReply {
    pub data: ReplyData,
    pub err: Option<Error>,
    pub msg: String,
}

impl DbReply {
    pub fn affected(n: i64) -> Self {
        Self {
            data: ReplyData::Affected(n),
            ..Default::default()
        }
    }

    /// A terminal rejection carrying `n` affected rows and a message.
    pub fn rejected(n: i64, msg: impl Into<String>) -> Self {
        Self {
            data: ReplyData::Affected(n),
            err: None,
            msg: msg.into(),
        }
    }

    /// A driver fault.
    pub fn fault(err: Error) -> Self {
        Self {
            err: Some(err),
            ..Default::default()
        }
    }

    pub fn row(row: Option<Vec<u8>>) -> Self {
        Self {
            data: ReplyData::Row(row),
            ..Default::default()
        }
    }

    pub fn rows(rows: Vec<Vec<u8>>) -> Self {
        Self {
            data: ReplyData::Rows(rows),
            ..Default::default()
        }
    }

    pub fn is_fault(&self) -> bool {
        self.err.is_some()
    }

    /// Affected row count, if this reply carries one.
    pub fn affected_rows(&self) -> Option<i64> {
        match self.data {
            ReplyData::Affected(n) => Some(n),
            _ => None,
        }
    }
}

// =============================================================================
// Row Context
// =============================================================================

/// Per-row state shared between a cache entry and the requests targeting it.
///
/// Holds the processor ticket of the most recently appended request against
/// the row (0 when none), which is how a new request finds the request it may
/// merge into.
///
/// Tickets are numbered per [`Processor`](crate::processor::Processor), so a
/// context must only be used with requests sent to a single accessor. Sharing
/// one across accessors makes a request merge into an unrelated ticket.
#[derive(Debug, Default)]
pub struct RowContext {
    last_req: AtomicU64,
}

impl RowContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ticket of the last appended request, if any.
    pub fn last_ticket(&self) -> Option<u64> {
        match self.last_req.load(Ordering::Acquire) {
            0 => None,
            ticket => Some(ticket),
        }
    }

    pub fn reset(&self) {
        self.last_req.store(0, Ordering::Release);
    }

    /// Records `ticket` as the latest request and returns the previous one.
    /// Both belong to the processor that owns this context.
    pub(crate) fn swap_last(&self, ticket: u64) -> Option<u64> {
        match self.last_req.swap(ticket, Ordering::AcqRel) {
            0 => None,
            prev => Some(prev),
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// One pending row operation.
///
/// For single-row commands `keys` holds the primary key values in key order;
/// for multi-row commands it holds the shard value alone. `shard_id` indexes
/// `keys`.
#[derive(Debug)]
pub struct DbRequest {
    pub schema: Arc<TableSchema>,
    pub shard_id: usize,
    pub keys: Vec<String>,
    pub data: RequestData,
    pub row_context: Option<Arc<RowContext>>,
    /// May be folded into the previous request against the same row.
    pub can_merge: bool,
    /// The caller is blocked on this request; driver faults are not retried.
    pub sync: bool,
    /// A precondition for the next queued request.
    pub pre_req: bool,
    /// Set when the request piggybacked on another request's execution.
    pub processed: bool,
    /// Opaque caller value carried through unchanged.
    pub tag: u64,
    pub reply: Option<Arc<DbReply>>,
}

impl DbRequest {
    /// Builds a single-row request from primary key values in key order.
    pub fn single(schema: Arc<TableSchema>, keys: Vec<String>, data: RequestData) -> Self {
        let shard_index = schema.shard_index();
        let shard_id = schema
            .key_column_indexes()
            .iter()
            .position(|&idx| idx == shard_index)
            .unwrap_or(0);

        Self::with_shard(schema, shard_id, keys, data)
    }

    /// Builds a multi-row request addressed by shard value.
    pub fn multi(schema: Arc<TableSchema>, shard: impl Into<String>, data: RequestData) -> Self {
        Self::with_shard(schema, 0, vec![shard.into()], data)
    }

    fn with_shard(schema: Arc<TableSchema>, shard_id: usize, keys: Vec<String>, data: RequestData) -> Self {
        Self {
            schema,
            shard_id,
            keys,
            data,
            row_context: None,
            can_merge: false,
            sync: false,
            pre_req: false,
            processed: false,
            tag: 0,
            reply: None,
        }
    }

    pub fn with_row_context(mut self, context: Arc<RowContext>) -> Self {
        self.row_context = Some(context);
        self
    }

    pub fn mergeable(mut self) -> Self {
        self.can_merge = true;
        self
    }

    pub fn synchronous(mut self) -> Self {
        self.sync = true;
        self
    }

    pub fn as_pre_req(mut self) -> Self {
        self.pre_req = true;
        self
    }

    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    pub fn command(&self) -> DbCommand {
        self.data.command()
    }

    /// The shard value. Panics if `shard_id` is out of range.
    pub fn shard(&self) -> &str {
        &self.keys[self.shard_id]
    }

    /// Clears flags, payload and reply so the request can be reused.
    pub fn reset(&mut self) {
        self.shard_id = 0;
        self.keys.clear();
        self.data = RequestData::None;
        self.row_context = None;
        self.can_merge = false;
        self.sync = false;
        self.pre_req = false;
        self.processed = false;
        self.tag = 0;
        self.reply = None;
    }
}

// =============================================================================
// Tests
// =============================================================================
