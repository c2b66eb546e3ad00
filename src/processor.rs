//! # Request Processor
//!
//! The processor keeps a FIFO of pending row operations, folds consecutive
//! requests against the same row into one backend call, and dispatches groups
//! to the [`Driver`] one at a time.
//!
//! ## Queue and Groups
//!
//! ```text
//!  ticket:   5          6          7          8
//!          ┌──────┐   ┌──────┐   ┌──────┐   ┌──────┐
//!  queue:  │ upd A│   │ sel B│   │ upd A│   │ upd A│
//!          │leader│   │leader│   │  ↳ 5 │   │  ↳ 5 │
//!          └──────┘   └──────┘   └──────┘   └──────┘
//!  group 5: merged payload = union of fields from 5, 7, 8
//! ```
//!
//! Every appended request gets a ticket. A request's [`RowContext`] remembers
//! the ticket of the previous request against the same row, and a new request
//! may join that request's group. The group leader carries the merged payload
//! and the list of its members ("brothers").
//!
//! ## Merge Strategies
//!
//! | Strategy | Commands | Merged payload |
//! |----------|----------|----------------|
//! | Piggyback | insert, delete, selects, multi ops | leader's payload |
//! | UpdateFields | update | last write wins per field |
//! | SumDelta | increment | deltas summed, same column, no WHERE |
//!
//! ## Failure Handling
//!
//! A driver fault (`reply.err`) leaves the head queued for a retry unless the
//! request is `sync` or `pre_req`. A failed `pre_req` also completes its
//! immediate successor (and that successor's group) with the same reply, so a
//! dependent operation never reaches the driver.
//!
//! [`RowContext`]: crate::types::RowContext

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::driver::Driver;
use crate::types::{DbCommand, DbReply, DbRequest, RequestData};

// =============================================================================
// Merge Strategies
// =============================================================================

/// How a request folds into the group of the previous request on its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Shares the group's single execution unchanged.
    Piggyback,
    /// Unions field lists, later values overwriting earlier ones.
    UpdateFields,
    /// Sums increment deltas.
    SumDelta,
}

/// The merge strategy used for `command`.
pub fn merge_strategy(command: DbCommand) -> MergeStrategy {
    match command {
        DbCommand::UpdateSingle => MergeStrategy::UpdateFields,
        DbCommand::IncrBySingle => MergeStrategy::SumDelta,
        DbCommand::None
        | DbCommand::Insert
        | DbCommand::DeleteSingle
        | DbCommand::SelectSingle
        | DbCommand::SelectMulti
        | DbCommand::DeleteMulti
        | DbCommand::CountMulti => MergeStrategy::Piggyback,
    }
}

fn merge_fields(merged: &mut RequestData, incoming: &RequestData) -> bool {
    let (RequestData::UpdateSingle(fields), RequestData::UpdateSingle(update)) = (merged, incoming) else {
        return false;
    };

    for pair in update.chunks_exact(2) {
        match fields.chunks_exact_mut(2).find(|f| f[0] == pair[0]) {
            Some(existing) => existing[1].clone_from(&pair[1]),
            None => fields.extend_from_slice(pair),
        }
    }
    true
}

fn merge_delta(merged: &mut RequestData, incoming: &RequestData) -> bool {
    let (RequestData::IncrBySingle(sum), RequestData::IncrBySingle(incr)) = (merged, incoming) else {
        return false;
    };

    if sum.column != incr.column || !sum.where_clause.is_empty() || !incr.where_clause.is_empty() {
        return false;
    }

    sum.delta += incr.delta;
    true
}

// =============================================================================
// Queue Nodes
// =============================================================================

struct Node {
    req: DbRequest,
    /// Ticket of the group leader; equals the node's own ticket for leaders.
    group: u64,
    /// Merged payload, only on leaders that absorbed at least one request.
    merged: Option<RequestData>,
    /// Member tickets, only on leaders.
    brothers: Vec<u64>,
}

// =============================================================================
// Processor
// =============================================================================

/// FIFO of pending requests in front of a driver.
pub struct Processor<D> {
    driver: D,
    queue: VecDeque<Node>,
    head_ticket: u64,
    pending_groups: usize,
}

impl<D: Driver> Processor<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            queue: VecDeque::new(),
            head_ticket: 1,
            pending_groups: 0,
        }
    }

    /// Number of dispatchable groups still queued.
    pub fn pending_req_num(&self) -> usize {
        self.pending_groups
    }

    /// Number of queued requests, merged or not.
    pub fn queued_num(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Appends `req` and merges it into its row predecessor's group when
    /// allowed. Returns the number of pending groups.
    pub fn append_request(&mut self, req: DbRequest) -> usize {
        let ticket = self.head_ticket + self.queue.len() as u64;
        let prev = req.row_context.as_ref().and_then(|ctx| ctx.swap_last(ticket));

        self.queue.push_back(Node {
            req,
            group: ticket,
            merged: None,
            brothers: Vec::new(),
        });

        if !self.try_merge(prev, ticket) {
            self.pending_groups += 1;
        }
        self.pending_groups
    }

    /// Completes the head of the queue.
    ///
    /// Returns the detached request with its reply set, or `None` when the
    /// queue is empty or the head must be retried later.
    pub fn execute(&mut self) -> Option<DbRequest> {
        let head = self.queue.front_mut()?;

        if head.req.reply.is_none() {
            let data = head.merged.as_ref().unwrap_or(&head.req.data);
            let reply = Arc::new(dispatch(&mut self.driver, &head.req, data));
            let (sync, pre_req) = (head.req.sync, head.req.pre_req);

            if reply.is_fault() {
                if pre_req {
                    self.fail_successor(&reply);
                }

                if !sync && !pre_req {
                    warn!(
                        table = self.queue[0].req.schema.name(),
                        command = %self.queue[0].req.command(),
                        error = ?reply.err,
                        "driver fault, request will be retried"
                    );
                    return None;
                }
            }

            self.complete_head(reply);
        }

        self.pop_head()
    }

    /// Completes the head (and its group) with `reply` without dispatching it.
    ///
    /// Used to drop a request whose dispatch cannot succeed.
    pub fn fail_head(&mut self, reply: DbReply) -> Option<DbRequest> {
        let head = self.queue.front()?;
        if head.req.reply.is_none() {
            self.complete_head(Arc::new(reply));
        }
        self.pop_head()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn node(&self, ticket: u64) -> Option<&Node> {
        let offset = ticket.checked_sub(self.head_ticket)?;
        self.queue.get(offset as usize)
    }

    fn node_mut(&mut self, ticket: u64) -> Option<&mut Node> {
        let offset = ticket.checked_sub(self.head_ticket)?;
        self.queue.get_mut(offset as usize)
    }

    fn try_merge(&mut self, prev: Option<u64>, ticket: u64) -> bool {
        let Some(prev) = prev else {
            return false;
        };
        let Some(incoming) = self.queue.back() else {
            return false;
        };
        if !incoming.req.can_merge {
            return false;
        }

        let command = incoming.req.command();
        let sync = incoming.req.sync;
        let payload = match merge_strategy(command) {
            MergeStrategy::Piggyback => None,
            _ => Some(incoming.req.data.clone()),
        };

        let leader_ticket = match self.node(prev) {
            Some(p) if p.req.reply.is_none() && p.req.command() == command && p.req.sync == sync => p.group,
            _ => return false,
        };

        let Some(leader) = self.node_mut(leader_ticket) else {
            return false;
        };
        if leader.req.reply.is_some() {
            return false;
        }

        let Node { req, merged, .. } = &mut *leader;
        let merged = merged.get_or_insert_with(|| req.data.clone());
        let accepted = match (merge_strategy(command), &payload) {
            (MergeStrategy::Piggyback, _) => true,
            (MergeStrategy::UpdateFields, Some(data)) => merge_fields(merged, data),
            (MergeStrategy::SumDelta, Some(data)) => merge_delta(merged, data),
            _ => false,
        };
        if !accepted {
            return false;
        }

        leader.brothers.push(ticket);
        debug!(
            table = leader.req.schema.name(),
            command = %command,
            leader = leader_ticket,
            ticket,
            "merged request"
        );

        if let Some(node) = self.queue.back_mut() {
            node.group = leader_ticket;
            if merge_strategy(command) == MergeStrategy::Piggyback {
                node.req.processed = true;
            }
        }
        true
    }

    /// Completes the request right behind a failed `pre_req` head.
    fn fail_successor(&mut self, reply: &Arc<DbReply>) {
        let succ_ticket = self.head_ticket + 1;
        let Some(succ) = self.queue.get(1) else {
            return;
        };
        if succ.req.reply.is_some() {
            return;
        }

        warn!(
            table = succ.req.schema.name(),
            command = %succ.req.command(),
            "precondition failed, completing dependent request"
        );

        let group = succ.group;
        if group == succ_ticket {
            let brothers = std::mem::take(&mut self.queue[1].brothers);
            self.queue[1].merged = None;
            self.queue[1].req.reply = Some(Arc::clone(reply));
            for ticket in brothers {
                if let Some(node) = self.node_mut(ticket) {
                    node.req.reply = Some(Arc::clone(reply));
                    node.group = ticket;
                }
            }
            self.pending_groups = self.pending_groups.saturating_sub(1);
        } else if group != self.head_ticket {
            if let Some(leader) = self.node_mut(group) {
                leader.brothers.retain(|&t| t != succ_ticket);
            }
            self.queue[1].group = succ_ticket;
            self.queue[1].req.reply = Some(Arc::clone(reply));
        }
        // A brother of the head's own group receives the head's reply below.
    }

    fn complete_head(&mut self, reply: Arc<DbReply>) {
        let Some(head) = self.queue.front_mut() else {
            return;
        };

        let command = head.req.command();
        head.req.reply = Some(Arc::clone(&reply));
        head.merged = None;
        let brothers = std::mem::take(&mut head.brothers);

        self.pending_groups = self.pending_groups.saturating_sub(1);

        if brothers.is_empty() {
            return;
        }

        let brother_reply = if reply.is_fault() {
            reply
        } else {
            match command {
                DbCommand::Insert => Arc::new(DbReply::rejected(0, "duplicate key")),
                DbCommand::DeleteSingle => Arc::new(DbReply::affected(0)),
                _ => reply,
            }
        };

        for ticket in brothers {
            if let Some(node) = self.node_mut(ticket) {
                node.req.reply = Some(Arc::clone(&brother_reply));
                node.group = ticket;
            }
        }
    }

    fn pop_head(&mut self) -> Option<DbRequest> {
        let node = self.queue.pop_front()?;
        self.head_ticket += 1;
        Some(node.req)
    }
}

/// Sends one group to the driver.
fn dispatch<D: Driver>(driver: &mut D, req: &DbRequest, data: &RequestData) -> DbReply {
    let schema = req.schema.as_ref();
    match data {
        RequestData::None => DbReply::default(),
        RequestData::Insert(fields) => driver.insert(schema, req.shard(), fields),
        RequestData::DeleteSingle => driver.delete_single(schema, req.shard(), &req.keys),
        RequestData::UpdateSingle(fields) => driver.update_single(schema, req.shard(), &req.keys, fields),
        RequestData::IncrBySingle(incr) => driver.incr_by_single(schema, req.shard(), &req.keys, incr),
        RequestData::SelectSingle => driver.select_single(schema, req.shard(), &req.keys),
        RequestData::SelectMulti | RequestData::CountMulti => driver.select_multi(schema, req.shard()),
        RequestData::DeleteMulti(multi) => driver.delete_multi(schema, req.shard(), multi),
    }
}

// =============================================================================
// Tests
// =============================================================================
