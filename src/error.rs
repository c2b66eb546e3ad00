//! # Error Handling for rowcache
//!
//! A single error enum ([`Error`]) covers every failure mode the crate reports
//! through `Result`. Most codec entry points do not use it: malformed rows and
//! field lists are signalled with `None`/`false` so hot paths stay allocation
//! free, and callers turn that into a [`DbReply`](crate::types::DbReply)
//! message.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Input | Bad WHERE clause, unknown column | Reject the request |
//! | Schema | Missing primary key, key count changed | Fix the table definition |
//! | Busy | Table reset while requests are in flight | Retry after drain |
//! | Driver | SQLite busy, I/O error | Retried by the processor |

use thiserror::Error;

/// Every error rowcache reports through `Result`.
#[derive(Error, Debug)]
pub enum Error {
    /// A WHERE clause failed to compile.
    ///
    /// Covers tokenizer failures (unmatched quote or parenthesis), unknown
    /// columns, parameter count mismatches and shard-consistency violations.
    #[error("invalid condition: {0}")]
    Condition(String),

    /// A table schema is missing or violates a structural invariant.
    #[error("schema error: {0}")]
    Schema(String),

    /// Encoded row data could not be decoded or updated.
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// The table still has backend requests outstanding.
    #[error("table '{table}' has DB requests pending")]
    TableBusy { table: String },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Spawning the accessor thread or its runtime failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A backing-store fault. Retried unless the request is sync or a
    /// precondition.
    #[error("driver error: {0}")]
    Driver(String),

    /// Raised inside [`SqliteDriver`](crate::sqlite::SqliteDriver); faults
    /// keep this variant, rejections are flattened into reply messages.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let busy = Error::TableBusy {
            table: "users".to_string(),
        };
        assert_eq!(busy.to_string(), "table 'users' has DB requests pending");

        let cond = Error::Condition("sign '`' mismatched".to_string());
        assert_eq!(cond.to_string(), "invalid condition: sign '`' mismatched");

        let closed = Error::ChannelClosed("accessor requests");
        assert_eq!(closed.to_string(), "channel closed: accessor requests");
    }

    #[test]
    fn test_missing_table_surfaces_as_sqlite_error() {
        fn count_rows() -> Result<i64> {
            let conn = rusqlite::Connection::open_in_memory()?;
            let n = conn.query_row("SELECT COUNT(*) FROM bag", [], |row| row.get(0))?;
            Ok(n)
        }

        let err = count_rows().unwrap_err();
        assert!(matches!(err, Error::Sqlite(_)));
        assert!(err.to_string().contains("no such table: bag"));
    }

    #[test]
    fn test_thread_spawn_failure_is_io() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::WouldBlock, "no threads").into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "I/O error: no threads");
    }
}
