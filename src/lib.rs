//! # rowcache - Row Cache and Request Batching Layer
//!
//! rowcache sits between a game or application server and a relational
//! backing store. It provides:
//!
//! - **Compact row encoding**: one buffer per row with O(1) column access
//! - **WHERE clause evaluation**: a small condition language checked in process
//! - **Request batching**: consecutive operations on one row folded into one
//!   backend call
//! - **Row caching**: per-table LRU caches with time-based recycling
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Callers (async tasks)                       │
//! │              build DbRequest, submit, await completion          │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ tokio::sync::mpsc
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Accessor                                │
//! │              (dedicated thread, owns the processor)             │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │   Request   │  │    Merge    │  │  Retry / pre-request    │ │
//! │  │    FIFO     │  │  strategies │  │  failure propagation    │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ Driver trait
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                SQLite / in-memory backing store                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Per-row ordering**: requests against one row reach the backend in
//!    submission order
//! 2. **One reply per request**: every submitted request completes exactly
//!    once, merged or not
//! 3. **Shard scoping**: a multi-row condition can never reach outside its
//!    shard
//! 4. **Busy entries stay**: cache entries with backend requests in flight are
//!    never recycled
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum for all failure modes
//! - [`schema`]: Table schemas and the schema manager
//! - [`codec`]: Row encoding, decoding and row keys
//! - [`condition`]: WHERE clause compiler and evaluator
//! - [`types`]: Requests, payloads and replies
//! - [`driver`]: The backing-store trait and an in-memory driver
//! - [`sqlite`]: SQLite driver
//! - [`processor`]: Request queue with merging
//! - [`accessor`]: Threaded, channel-driven processor loop
//! - [`table`]: Per-table row cache

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for rowcache operations.
pub mod error;

/// Table schemas.
///
/// A [`TableSchema`](schema::TableSchema) describes column names, types,
/// defaults and primary keys. The manager loads schemas through a driver and
/// shares them as `Arc`s.
pub mod schema;

/// Row encoding and decoding.
///
/// Rows are a control byte, one end offset per column, then the column data.
/// Decoders borrow from the buffer.
pub mod codec;

/// WHERE clause compilation and evaluation.
pub mod condition;

/// Request, payload and reply types.
pub mod types;

/// The backing-store boundary.
pub mod driver;

/// SQLite implementation of [`Driver`](driver::Driver).
pub mod sqlite;

/// Request queue in front of a driver.
///
/// Folds requests against the same row into groups and dispatches one group
/// at a time, with retry and pre-request failure handling.
pub mod processor;

/// Processor loop on a dedicated thread.
///
/// Callers talk to it over Tokio channels; see
/// [`spawn_accessor`](accessor::spawn_accessor).
pub mod accessor;

/// Per-table row cache with LRU recycling.
pub mod table;

// =============================================================================
// Re-exports
// =============================================================================

pub use accessor::{spawn_accessor, AccessorConfig, AccessorHandle, AccessorReceiver, AccessorSender};
pub use condition::Condition;
pub use driver::{Driver, MemoryDriver};
pub use error::{Error, Result};
pub use processor::Processor;
pub use schema::{ColumnSchema, ColumnType, TableSchema, TableSchemaManager};
pub use sqlite::SqliteDriver;
pub use table::{Table, TableConfig, TableRow, TableRowIndex};

pub use types::{
    DbCommand, DbReply, DbRequest, IncrByData, MultiRequestData, ReplyData, RequestData,
    RowContext,
};
