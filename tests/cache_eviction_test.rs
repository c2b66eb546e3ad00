//! Table Cache Tests
//!
//! Tests the LRU and lifecycle invariants of the per-table cache:
//! - Recycling evicts least recently hit rows first and only expired ones
//! - Rows with backend requests in flight survive recycling
//! - Shard indexes touch their member rows and release them when recycled
//! - Schema reloads reset idle tables and replace busy ones

mod common;

use std::sync::Arc;

use common::bag_schema;
use rowcache::codec::{assemble_key_from_list, encode_row_from_field_list, shard_key_of};
use rowcache::table::{Reloaded, RowState};
use rowcache::{Error, Table, TableConfig};

const TTL: i64 = 60;

fn table(rows: usize) -> Table {
    Table::new(
        7,
        bag_schema(),
        TableConfig {
            init_row_num: rows + 1,
            ttl: TTL,
        },
    )
}

fn key(uid: u32, slot: u32) -> String {
    assemble_key_from_list(&bag_schema(), &[uid.to_string(), slot.to_string()]).unwrap()
}

#[test]
fn eviction_follows_hit_order() {
    let mut t = table(4);
    t.hit_row_at(&key(1, 1), 1_000);
    t.hit_row_at(&key(1, 2), 1_010);
    t.hit_row_at(&key(1, 3), 1_020);
    t.hit_row_at(&key(1, 4), 1_030);
    t.hit_row_at(&key(1, 1), 1_040);

    // expire = 1_070 - 60 = 1_010: only the oldest row qualifies
    t.hit_row_at(&key(2, 1), 1_070);
    assert!(t.row(&key(1, 2)).is_none());
    assert!(t.row(&key(1, 1)).is_some());
    assert_eq!(t.num_rows(), 4);

    assert_eq!(t.recycle(2, 1_040), 2);
    assert!(t.row(&key(1, 3)).is_none());
    assert!(t.row(&key(1, 4)).is_none());
    assert!(t.row(&key(1, 1)).is_some());
    assert!(t.row(&key(2, 1)).is_some());
}

#[test]
fn unexpired_rows_force_growth() {
    let mut t = table(2);
    t.hit_row_at(&key(1, 1), 1_000);
    t.hit_row_at(&key(1, 2), 1_001);
    t.hit_row_at(&key(1, 3), 1_002);
    t.hit_row_at(&key(1, 4), 1_003);

    assert_eq!(t.num_rows(), 4);
    assert!(t.row_capacity() >= 5);
    for slot in 1..=4 {
        assert!(t.row(&key(1, slot)).is_some());
    }
}

#[test]
fn busy_rows_are_never_recycled() {
    let mut t = table(4);
    let (busy, _) = t.hit_row_at(&key(1, 1), 1_000);
    t.hit_row_at(&key(1, 2), 1_001);
    t.hit_row_at(&key(3, 3), 5_000);
    t.row_by_idx_mut(busy).num_db_sync_req = 1;

    assert_eq!(t.recycle(0, 2_000), 0);
    assert_eq!(t.num_rows(), 3);

    t.row_by_idx_mut(busy).num_db_sync_req = 0;
    assert_eq!(t.recycle(0, 2_000), 2);
    assert_eq!(t.num_rows(), 1);
}

#[test]
fn shard_index_tracks_member_rows() {
    let schema = bag_schema();
    let mut t = table(8);

    let mut members = Vec::new();
    for slot in 1..=3u32 {
        let fields = vec![
            "uid".to_string(),
            "5".to_string(),
            "slot".to_string(),
            slot.to_string(),
            "count".to_string(),
            "1".to_string(),
        ];
        let row = encode_row_from_field_list(&schema, &fields).unwrap();
        assert_eq!(shard_key_of(&schema, &row), "5");

        let (idx, entry) = t.hit_row_at(&key(5, slot), 1_000);
        entry.data = row;
        entry.state = RowState::Valid;
        members.push(idx);
    }

    let (_, si, _, _) = t.hit_multi_row_at("5", 1_000);
    si.state = RowState::NotExist;
    for &idx in &members {
        assert!(t.insert_row_index("5", idx));
    }
    assert_eq!(t.shard_index("5").unwrap().state, RowState::Valid);
    assert_eq!(t.num_shard_indexes(), 1);

    t.row_by_idx_mut(members[1]).num_db_req = 1;
    let (_, si, n_sync, n_req) = t.hit_multi_row_at("5", 2_000);
    assert_eq!(si.rows().len(), 3);
    assert_eq!((n_sync, n_req), (0, 1));
    for &idx in &members {
        assert_eq!(t.row_by_idx(idx).last_hit_time, 2_000);
    }

    t.row_by_idx_mut(members[1]).num_db_req = 0;
    t.hit_row_at(&key(9, 9), 9_000);
    assert_eq!(t.recycle(0, 3_000), 3);
    assert!(t.shard_index("5").is_none());
    assert_eq!(t.num_rows(), 1);
}

#[test]
fn reload_resets_idle_and_replaces_busy_tables() {
    let mut idle = table(4);
    idle.hit_row_at(&key(1, 1), 1_000);
    match idle.reload_schema(bag_schema()) {
        Reloaded::InPlace(n) => assert_eq!(n, 1),
        Reloaded::Replaced(_) => panic!("idle table was replaced"),
    }
    assert_eq!(idle.num_rows(), 0);

    let mut busy = table(4);
    busy.hit_row_at(&key(1, 1), 1_000);
    busy.num_db_multi_req = 1;
    assert!(matches!(busy.reset(), Err(Error::TableBusy { .. })));

    let fresh = match busy.reload_schema(Arc::new((*bag_schema()).clone())) {
        Reloaded::Replaced(fresh) => fresh,
        Reloaded::InPlace(_) => panic!("busy table was reset"),
    };
    assert!(busy.is_outdated());
    assert!(!fresh.is_outdated());
    assert_eq!(fresh.id(), 7);

    assert!(!busy.check_and_clear(false));
    busy.num_db_multi_req = 0;
    assert!(busy.check_and_clear(false));
    assert!(!busy.check_and_clear(true));
}

#[test]
fn cached_writes_update_row_data() {
    let schema = bag_schema();
    let mut t = table(4);
    let k = key(2, 1);
    let (_, row) = t.hit_row_at(&k, 1_000);
    row.data = encode_row_from_field_list(&schema, &["uid", "2", "slot", "1", "item", "bow", "count", "4"]).unwrap();
    row.state = RowState::Valid;

    row.apply_update(&schema, &["item", "axe"]).unwrap();
    assert_eq!(row.apply_incr_by(&schema, 3, 6).unwrap(), 10);

    let info = t.row_debug_info(&k).unwrap();
    assert!(info.contains("item:\"axe\""));
    assert!(info.contains("count:10"));
}

#[test]
fn cleared_table_accepts_new_hits() {
    let mut t = table(4);
    t.hit_row_at(&key(1, 1), 1_000);
    t.num_db_multi_req = 1;
    assert!(matches!(t.reload_schema(bag_schema()), Reloaded::Replaced(_)));

    t.num_db_multi_req = 0;
    assert!(t.check_and_clear(false));
    assert_eq!(t.num_rows(), 0);

    let (_, row) = t.hit_row_at(&key(2, 2), 1_000);
    assert_eq!(row.state, RowState::None);
    assert_eq!(t.num_rows(), 1);
    assert!(t.row(&key(2, 2)).is_some());
    assert!(t.row_capacity() >= 2);
}
