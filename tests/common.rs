#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rowcache::{ColumnType, Driver, SqliteDriver, TableSchema};

pub const CREATE_BAG: &str = "
    CREATE TABLE bag (
        uid INTEGER NOT NULL,
        slot INTEGER NOT NULL,
        item TEXT DEFAULT '',
        count INTEGER DEFAULT 0,
        mtime DATETIME DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (uid, slot)
    )";

pub fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// `user(uid, name, gold, level)` keyed and sharded by `uid`.
pub fn user_schema() -> Arc<TableSchema> {
    Arc::new(
        TableSchema::builder("user")
            .column("uid", ColumnType::Int)
            .column("name", ColumnType::String)
            .column("gold", ColumnType::Int)
            .column("level", ColumnType::Int)
            .primary_key(&["uid"])
            .build()
            .expect("build user schema"),
    )
}

/// `bag(uid, slot, item, count, mtime)` keyed by `(uid, slot)`, sharded by `uid`.
pub fn bag_schema() -> Arc<TableSchema> {
    Arc::new(
        TableSchema::builder("bag")
            .column("uid", ColumnType::Int)
            .column("slot", ColumnType::Int)
            .column("item", ColumnType::String)
            .column("count", ColumnType::Int)
            .column("mtime", ColumnType::Time)
            .primary_key(&["uid", "slot"])
            .auto_mtime("mtime")
            .build()
            .expect("build bag schema"),
    )
}

/// SQLite database in a temp dir with the `bag` table created.
pub fn create_temp_bag_db(name: &str) -> (tempfile::TempDir, PathBuf, SqliteDriver, Arc<TableSchema>) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let mut driver = SqliteDriver::open(&path).expect("open database");
    driver
        .connection()
        .execute_batch(CREATE_BAG)
        .expect("create bag table");
    let schema = Arc::new(driver.load_table_schema("bag").expect("load bag schema"));
    (dir, path, driver, schema)
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
