//! Request Merging Tests
//!
//! Tests the invariants of the processor queue:
//! - Same-row updates fold into one backend call with last-write-wins fields
//! - Increments sum only when they target one column without a WHERE clause
//! - Every member of a group completes exactly once
//! - A failed precondition completes its dependent request without a backend call

mod common;

use std::sync::Arc;

use common::{strings, user_schema};
use rowcache::codec::{assemble_key_from_list, decode_row_to_map};
use rowcache::{
    DbCommand, DbReply, DbRequest, Driver, Error, IncrByData, MemoryDriver, Processor, ReplyData,
    RequestData, RowContext,
};

fn seeded(uids: &[&str]) -> Processor<MemoryDriver> {
    let schema = user_schema();
    let mut driver = MemoryDriver::new();
    for uid in uids {
        let fields = strings(&["uid", uid, "name", "bob", "gold", "100", "level", "1"]);
        driver.insert(&schema, uid, &fields);
    }
    driver.take_calls();
    Processor::new(driver)
}

fn row_request(ctx: &Arc<RowContext>, uid: &str, data: RequestData) -> DbRequest {
    DbRequest::single(user_schema(), strings(&[uid]), data)
        .with_row_context(Arc::clone(ctx))
        .mergeable()
}

fn drain(processor: &mut Processor<MemoryDriver>) -> Vec<DbRequest> {
    std::iter::from_fn(|| processor.execute()).collect()
}

fn stored_field(processor: &Processor<MemoryDriver>, uid: &str, field: &str) -> String {
    let schema = user_schema();
    let key = assemble_key_from_list(&schema, &[uid]).unwrap();
    let row = processor.driver().row("user", &key).unwrap();
    decode_row_to_map(&schema, row).unwrap()[field].to_string()
}

#[test]
fn updates_to_one_row_share_a_backend_call() {
    let mut processor = seeded(&["1"]);
    let ctx = RowContext::new();

    for (field, value) in [("name", "amy"), ("gold", "5"), ("name", "eve"), ("level", "9")] {
        processor.append_request(row_request(&ctx, "1", RequestData::UpdateSingle(strings(&[field, value]))));
    }
    assert_eq!(processor.pending_req_num(), 1);
    assert_eq!(processor.queued_num(), 4);

    let done = drain(&mut processor);
    assert_eq!(done.len(), 4);
    let leader_reply = done[0].reply.as_ref().unwrap();
    assert_eq!(leader_reply.affected_rows(), Some(1));
    for req in &done[1..] {
        assert!(Arc::ptr_eq(leader_reply, req.reply.as_ref().unwrap()));
    }

    let calls = processor.driver().calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].payload,
        RequestData::UpdateSingle(strings(&["name", "eve", "gold", "5", "level", "9"]))
    );
    assert_eq!(stored_field(&processor, "1", "name"), "eve");
    assert_eq!(stored_field(&processor, "1", "gold"), "5");
}

#[test]
fn increments_sum_into_one_call() {
    let mut processor = seeded(&["1"]);
    let ctx = RowContext::new();

    for delta in [1, 2, 3, -1] {
        processor.append_request(row_request(
            &ctx,
            "1",
            RequestData::IncrBySingle(IncrByData::new("gold", delta)),
        ));
    }
    assert_eq!(processor.pending_req_num(), 1);

    let done = drain(&mut processor);
    assert_eq!(done.len(), 4);
    assert_eq!(processor.driver().calls().len(), 1);
    assert_eq!(
        processor.driver().calls()[0].payload,
        RequestData::IncrBySingle(IncrByData::new("gold", 5))
    );
    assert_eq!(stored_field(&processor, "1", "gold"), "105");
}

#[test]
fn increments_with_where_or_other_column_do_not_merge() {
    let mut processor = seeded(&["1"]);
    let ctx = RowContext::new();

    processor.append_request(row_request(&ctx, "1", RequestData::IncrBySingle(IncrByData::new("gold", 1))));
    processor.append_request(row_request(&ctx, "1", RequestData::IncrBySingle(IncrByData::new("level", 1))));
    processor.append_request(row_request(
        &ctx,
        "1",
        RequestData::IncrBySingle(IncrByData::new("level", 1).with_where("gold > 0")),
    ));
    assert_eq!(processor.pending_req_num(), 3);

    drain(&mut processor);
    assert_eq!(processor.driver().calls().len(), 3);
    assert_eq!(stored_field(&processor, "1", "gold"), "101");
    assert_eq!(stored_field(&processor, "1", "level"), "3");
}

#[test]
fn requests_for_different_rows_keep_their_own_groups() {
    let mut processor = seeded(&["1", "2"]);
    let (a, b) = (RowContext::new(), RowContext::new());

    processor.append_request(row_request(&a, "1", RequestData::SelectSingle));
    processor.append_request(row_request(&b, "2", RequestData::SelectSingle));
    processor.append_request(row_request(&a, "1", RequestData::SelectSingle));
    assert_eq!(processor.pending_req_num(), 2);

    let done = drain(&mut processor);
    assert_eq!(done.len(), 3);
    assert!(done[2].processed);
    assert!(Arc::ptr_eq(done[0].reply.as_ref().unwrap(), done[2].reply.as_ref().unwrap()));
    let selects = processor
        .driver()
        .calls()
        .iter()
        .filter(|c| c.command == DbCommand::SelectSingle)
        .count();
    assert_eq!(selects, 2);
}

#[test]
fn merged_inserts_report_duplicate_key() {
    let mut processor = seeded(&[]);
    let ctx = RowContext::new();
    let fields = strings(&["uid", "5", "name", "x"]);

    processor.append_request(row_request(&ctx, "5", RequestData::Insert(fields.clone())));
    processor.append_request(row_request(&ctx, "5", RequestData::Insert(fields)));

    let done = drain(&mut processor);
    assert_eq!(done[0].reply.as_ref().unwrap().affected_rows(), Some(1));
    let brother = done[1].reply.as_ref().unwrap();
    assert_eq!(brother.affected_rows(), Some(0));
    assert_eq!(brother.msg, "duplicate key");
}

#[test]
fn failed_precondition_skips_dependent_request() {
    let mut processor = seeded(&[]);
    processor
        .driver_mut()
        .push_fake_reply(DbReply::fault(Error::Driver("connection reset".to_string())));
    let ctx = RowContext::new();

    let load = DbRequest::single(user_schema(), strings(&["8"]), RequestData::SelectSingle)
        .with_row_context(Arc::clone(&ctx))
        .as_pre_req();
    let update = row_request(&ctx, "8", RequestData::UpdateSingle(strings(&["gold", "1"])));
    processor.append_request(load);
    processor.append_request(update);

    let done = drain(&mut processor);
    assert_eq!(done.len(), 2);
    assert!(done.iter().all(|r| r.reply.as_ref().unwrap().is_fault()));
    assert_eq!(processor.driver().calls().len(), 1);
    assert!(processor.is_empty());
}

#[test]
fn async_fault_is_retried_until_success() {
    let mut processor = seeded(&["1"]);
    processor
        .driver_mut()
        .push_fake_reply(DbReply::fault(Error::Driver("busy".to_string())));
    let ctx = RowContext::new();
    processor.append_request(row_request(&ctx, "1", RequestData::SelectSingle));

    assert!(processor.execute().is_none());
    assert_eq!(processor.queued_num(), 1);

    let done = processor.execute().unwrap();
    assert!(matches!(done.reply.as_ref().unwrap().data, ReplyData::Row(Some(_))));
    assert_eq!(processor.driver().calls().len(), 2);
}
