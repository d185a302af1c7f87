//! The replica store: one op log per open document.
//!
//! The log is append-only and unordered; [`merge`](crate::crdt::merge) turns
//! it into a document. The store's job is admission: idempotent apply,
//! parking operations whose dependencies have not arrived yet, and minting
//! new operations for local edits through the Lamport clock.
//!
//! A store is owned by exactly one task (the sync controller client-side,
//! the per-document mutex server-side), so none of this is internally
//! synchronized.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crdt::merge::{self, DocOrder};
use crate::crdt::op::{AppliedResult, OpKind, Operation};
use crate::crdt::tree::ContentTree;
use crate::crdt::types::{Frontier, OpClock, OpId, ReplicaId};

/// A local edit that does not fit the current document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EditError {
    #[error("position {pos} is out of bounds for a document of {len} characters")]
    OutOfBounds { pos: usize, len: usize },
    #[error("format range is empty")]
    EmptyRange,
}

pub struct Replica {
    clock: OpClock,
    log: HashMap<OpId, Operation>,
    /// Applied counters per origin replica, for frontier and gap queries.
    columns: BTreeMap<ReplicaId, BTreeSet<u64>>,
    /// Operations waiting for dependencies, by their own id.
    parked: HashMap<OpId, Operation>,
    /// Missing dependency id -> parked operations waiting on it.
    waiting: HashMap<OpId, Vec<OpId>>,
    /// The previous operation this replica minted, threaded into the next
    /// one's dependencies so per-origin order is causal order.
    prev_local: Option<OpId>,
}

impl Replica {
    pub fn new(replica: ReplicaId) -> Self {
        Replica {
            clock: OpClock::new(replica),
            log: HashMap::new(),
            columns: BTreeMap::new(),
            parked: HashMap::new(),
            waiting: HashMap::new(),
            prev_local: None,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.clock.replica()
    }

    pub fn contains(&self, id: OpId) -> bool {
        self.log.contains_key(&id)
    }

    pub fn op_count(&self) -> usize {
        self.log.len()
    }

    /// Operations currently parked for missing dependencies.
    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Offer an operation to the log. Safe to call with duplicates and in
    /// any delivery order; see [`AppliedResult`] for the outcomes.
    pub fn apply(&mut self, op: Operation) -> AppliedResult {
        if self.log.contains_key(&op.id) {
            return AppliedResult::AlreadyApplied;
        }
        if self.parked.contains_key(&op.id) {
            return AppliedResult::Buffered;
        }
        if let Err(reason) = op.validate() {
            warn!("rejected operation {}: {}", op.id, reason);
            return AppliedResult::Rejected(reason);
        }

        let missing = self.missing_requires(&op);
        if !missing.is_empty() {
            debug!(
                "buffering operation {} ({} missing dependencies)",
                op.id,
                missing.len()
            );
            for dep in missing {
                self.waiting.entry(dep).or_default().push(op.id);
            }
            self.parked.insert(op.id, op);
            return AppliedResult::Buffered;
        }

        self.commit(op);
        AppliedResult::Applied
    }

    /// Project the log into the visible document.
    pub fn materialize(&self) -> ContentTree {
        merge::materialize(&self.log)
    }

    /// Plain text of the visible document.
    pub fn text(&self) -> String {
        self.materialize().text()
    }

    /// Insert `ch` so it becomes the character at visible position `pos`.
    pub fn insert_at(&mut self, pos: usize, ch: char) -> Result<Operation, EditError> {
        let order = self.order();
        let len = order.visible_len();
        let anchor = if pos == 0 {
            OpId::root()
        } else {
            order
                .visible_id_at(pos - 1)
                .ok_or(EditError::OutOfBounds { pos, len })?
        };
        Ok(self.mint(OpKind::Insert { anchor, ch }))
    }

    /// Tombstone the character at visible position `pos`.
    pub fn delete_at(&mut self, pos: usize) -> Result<Operation, EditError> {
        let order = self.order();
        let len = order.visible_len();
        let target = order
            .visible_id_at(pos)
            .ok_or(EditError::OutOfBounds { pos, len })?;
        Ok(self.mint(OpKind::Delete { target }))
    }

    /// Set (or clear, with a `null` value) one attribute over a half-open
    /// range of visible positions.
    pub fn format_range(
        &mut self,
        range: Range<usize>,
        attr: &str,
        value: Value,
    ) -> Result<Operation, EditError> {
        if range.start >= range.end {
            return Err(EditError::EmptyRange);
        }
        let order = self.order();
        let len = order.visible_len();
        let start = order
            .visible_id_at(range.start)
            .ok_or(EditError::OutOfBounds {
                pos: range.start,
                len,
            })?;
        let end = order
            .visible_id_at(range.end - 1)
            .ok_or(EditError::OutOfBounds {
                pos: range.end - 1,
                len,
            })?;
        Ok(self.mint(OpKind::Format {
            start,
            end,
            attr: attr.to_string(),
            value,
        }))
    }

    /// Latest applied counter per known replica.
    pub fn frontier(&self) -> Frontier {
        let mut frontier = Frontier::new();
        for (&replica, counters) in &self.columns {
            if let Some(&max) = counters.iter().next_back() {
                frontier.record(OpId::new(max, replica));
            }
        }
        frontier
    }

    /// Every applied operation the given frontier has not seen, ascending by
    /// id so dependencies replay before their dependents.
    pub fn missing_for(&self, remote: &Frontier) -> Vec<Operation> {
        let mut out: Vec<Operation> = Vec::new();
        for (&replica, counters) in &self.columns {
            let known = remote.counter_for(replica);
            for &counter in counters.range(known + 1..) {
                let id = OpId::new(counter, replica);
                if let Some(op) = self.log.get(&id) {
                    out.push(op.clone());
                }
            }
        }
        out.sort_unstable_by_key(|op| op.id);
        out
    }

    /// This replica's own operations with a counter above `acked`, in mint
    /// order. The retransmission source for at-least-once delivery.
    pub fn pending_since(&self, acked: u64) -> Vec<Operation> {
        let Some(counters) = self.columns.get(&self.replica()) else {
            return Vec::new();
        };
        counters
            .range(acked + 1..)
            .filter_map(|&counter| self.log.get(&OpId::new(counter, self.replica())).cloned())
            .collect()
    }

    /// Counter of the newest operation this replica has minted.
    pub fn last_minted(&self) -> u64 {
        self.prev_local.map(|id| id.counter).unwrap_or(0)
    }

    fn order(&self) -> DocOrder {
        merge::order(&self.log)
    }

    /// Build a new local operation, apply it, and hand it back for the wire.
    fn mint(&mut self, kind: OpKind) -> Operation {
        let id = self.clock.tick();
        let mut deps: Vec<OpId> = Vec::new();
        if let Some(prev) = self.prev_local {
            deps.push(prev);
        }
        for referenced in match &kind {
            OpKind::Insert { anchor, .. } => vec![*anchor],
            OpKind::Delete { target } => vec![*target],
            OpKind::Format { start, end, .. } => vec![*start, *end],
        } {
            if !referenced.is_root() && !deps.contains(&referenced) {
                deps.push(referenced);
            }
        }
        let op = Operation::new(id, deps, kind);
        let result = self.apply(op.clone());
        debug_assert!(matches!(result, AppliedResult::Applied));
        self.prev_local = Some(id);
        op
    }

    /// Dependency and referenced ids not yet in the log (root never counts).
    fn missing_requires(&self, op: &Operation) -> Vec<OpId> {
        let mut requires: Vec<OpId> = op.deps.clone();
        for id in op.referenced_ids() {
            if !requires.contains(&id) {
                requires.push(id);
            }
        }
        requires
            .into_iter()
            .filter(|id| !id.is_root() && !self.log.contains_key(id))
            .collect()
    }

    fn commit(&mut self, op: Operation) {
        let id = op.id;
        self.clock.observe(id);
        self.columns
            .entry(id.replica)
            .or_default()
            .insert(id.counter);
        self.log.insert(id, op);
        self.release_waiters(id);
    }

    /// Re-check everything parked on `arrived`, cascading through any
    /// operations that become applicable in turn.
    fn release_waiters(&mut self, arrived: OpId) {
        let mut worklist = vec![arrived];
        while let Some(ready) = worklist.pop() {
            let Some(waiters) = self.waiting.remove(&ready) else {
                continue;
            };
            for waiter in waiters {
                let Some(parked) = self.parked.get(&waiter) else {
                    continue;
                };
                if !self.missing_requires(parked).is_empty() {
                    // Still blocked; it stays indexed under its other
                    // missing dependencies.
                    continue;
                }
                if let Some(op) = self.parked.remove(&waiter) {
                    debug!("releasing buffered operation {}", op.id);
                    let id = op.id;
                    self.clock.observe(id);
                    self.columns
                        .entry(id.replica)
                        .or_default()
                        .insert(id.counter);
                    self.log.insert(id, op);
                    worklist.push(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::op::RejectReason;

    fn rid(n: u128) -> ReplicaId {
        ReplicaId::from_u128(n)
    }

    fn remote_insert(counter: u64, replica: u128, anchor: OpId, ch: char) -> Operation {
        let mut deps = Vec::new();
        if !anchor.is_root() {
            deps.push(anchor);
        }
        Operation::new(
            OpId::new(counter, rid(replica)),
            deps,
            OpKind::Insert { anchor, ch },
        )
    }

    #[test]
    fn local_edits_build_a_document() {
        let mut replica = Replica::new(rid(1));
        replica.insert_at(0, 'h').unwrap();
        replica.insert_at(1, 'i').unwrap();
        replica.insert_at(0, 'o').unwrap();
        assert_eq!(replica.text(), "ohi");
    }

    #[test]
    fn insert_past_the_end_is_rejected() {
        let mut replica = Replica::new(rid(1));
        replica.insert_at(0, 'a').unwrap();
        let err = replica.insert_at(5, 'b').unwrap_err();
        assert_eq!(err, EditError::OutOfBounds { pos: 5, len: 1 });
    }

    #[test]
    fn delete_on_empty_document_is_rejected() {
        let mut replica = Replica::new(rid(1));
        assert_eq!(
            replica.delete_at(0),
            Err(EditError::OutOfBounds { pos: 0, len: 0 })
        );
    }

    #[test]
    fn format_needs_a_nonempty_range() {
        let mut replica = Replica::new(rid(1));
        replica.insert_at(0, 'a').unwrap();
        assert_eq!(
            replica.format_range(1..1, "bold", Value::Bool(true)),
            Err(EditError::EmptyRange)
        );
        assert!(replica
            .format_range(0..1, "bold", Value::Bool(true))
            .is_ok());
    }

    #[test]
    fn reapplying_is_a_no_op() {
        let mut replica = Replica::new(rid(1));
        let op = remote_insert(1, 2, OpId::root(), 'x');
        assert_eq!(replica.apply(op.clone()), AppliedResult::Applied);
        assert_eq!(replica.apply(op), AppliedResult::AlreadyApplied);
        assert_eq!(replica.op_count(), 1);
        assert_eq!(replica.text(), "x");
    }

    #[test]
    fn out_of_order_delivery_buffers_then_applies() {
        let mut replica = Replica::new(rid(1));
        let first = remote_insert(1, 2, OpId::root(), 'a');
        let second = remote_insert(2, 2, first.id, 'b');

        assert_eq!(replica.apply(second.clone()), AppliedResult::Buffered);
        assert_eq!(replica.parked_count(), 1);
        assert_eq!(replica.text(), "");

        assert_eq!(replica.apply(first), AppliedResult::Applied);
        assert_eq!(replica.parked_count(), 0);
        assert_eq!(replica.text(), "ab");
        // The buffered op is in the log now.
        assert_eq!(replica.apply(second), AppliedResult::AlreadyApplied);
    }

    #[test]
    fn buffered_chain_cascades_on_release() {
        let mut replica = Replica::new(rid(1));
        let a = remote_insert(1, 2, OpId::root(), 'a');
        let b = remote_insert(2, 2, a.id, 'b');
        let c = remote_insert(3, 2, b.id, 'c');

        assert_eq!(replica.apply(c), AppliedResult::Buffered);
        assert_eq!(replica.apply(b), AppliedResult::Buffered);
        assert_eq!(replica.parked_count(), 2);
        assert_eq!(replica.apply(a), AppliedResult::Applied);
        assert_eq!(replica.parked_count(), 0);
        assert_eq!(replica.text(), "abc");
    }

    #[test]
    fn redelivering_a_parked_op_keeps_it_parked_once() {
        let mut replica = Replica::new(rid(1));
        let a = remote_insert(1, 2, OpId::root(), 'a');
        let b = remote_insert(2, 2, a.id, 'b');

        assert_eq!(replica.apply(b.clone()), AppliedResult::Buffered);
        assert_eq!(replica.apply(b), AppliedResult::Buffered);
        assert_eq!(replica.parked_count(), 1);
        replica.apply(a);
        assert_eq!(replica.text(), "ab");
    }

    #[test]
    fn malformed_op_is_rejected_and_the_stream_continues() {
        let mut replica = Replica::new(rid(1));
        let anchor = OpId::new(9, rid(2));
        let bad = Operation::new(
            OpId::new(3, rid(2)),
            vec![anchor],
            OpKind::Insert { anchor, ch: 'x' },
        );
        assert!(matches!(
            replica.apply(bad),
            AppliedResult::Rejected(RejectReason::CausalityViolation { .. })
        ));

        let good = remote_insert(1, 2, OpId::root(), 'a');
        assert_eq!(replica.apply(good), AppliedResult::Applied);
        assert_eq!(replica.text(), "a");
    }

    #[test]
    fn minted_ops_depend_on_the_previous_local_op() {
        let mut replica = Replica::new(rid(1));
        let first = replica.insert_at(0, 'a').unwrap();
        let second = replica.insert_at(1, 'b').unwrap();
        assert!(second.deps.contains(&first.id));
    }

    #[test]
    fn clock_ticks_past_observed_remote_counters() {
        let mut replica = Replica::new(rid(1));
        replica.apply(remote_insert(10, 2, OpId::root(), 'z'));
        let op = replica.insert_at(0, 'a').unwrap();
        assert!(op.id.counter > 10);
    }

    #[test]
    fn frontier_tracks_each_replica() {
        let mut replica = Replica::new(rid(1));
        replica.insert_at(0, 'a').unwrap();
        replica.apply(remote_insert(7, 2, OpId::root(), 'b'));

        let frontier = replica.frontier();
        assert_eq!(frontier.counter_for(rid(1)), 1);
        assert_eq!(frontier.counter_for(rid(2)), 7);
        assert_eq!(frontier.counter_for(rid(3)), 0);
    }

    #[test]
    fn missing_for_returns_the_gap_in_ascending_order() {
        let mut source = Replica::new(rid(1));
        source.insert_at(0, 'a').unwrap();
        source.insert_at(1, 'b').unwrap();
        source.insert_at(2, 'c').unwrap();

        let mut behind = Frontier::new();
        behind.record(OpId::new(1, rid(1)));

        let missing = source.missing_for(&behind);
        let counters: Vec<u64> = missing.iter().map(|op| op.id.counter).collect();
        assert_eq!(counters, vec![2, 3]);

        // Replaying the gap converges a fresh replica.
        let mut replay = Replica::new(rid(2));
        for op in source.missing_for(&Frontier::new()) {
            replay.apply(op);
        }
        assert_eq!(replay.text(), source.text());
    }

    #[test]
    fn pending_since_lists_unacked_local_ops() {
        let mut replica = Replica::new(rid(1));
        replica.insert_at(0, 'a').unwrap();
        replica.insert_at(1, 'b').unwrap();
        replica.insert_at(2, 'c').unwrap();
        // A remote op must not show up as pending.
        replica.apply(remote_insert(2, 9, OpId::root(), 'z'));

        let pending = replica.pending_since(1);
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|op| op.id.replica == rid(1)));
        assert!(pending[0].id.counter < pending[1].id.counter);
        assert!(replica.pending_since(replica.last_minted()).is_empty());
    }
}
