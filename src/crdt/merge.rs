//! Deterministic merge rule: same set of operations in, same document out.
//!
//! Inserts form a tree. Every insert hangs off its anchor (the character it
//! was typed after, or the root sentinel), and siblings under one anchor are
//! ordered by descending [`OpId`]. A depth-first walk of that tree is the
//! converged total order. Because ids are minted by a Lamport clock, an
//! insert that causally saw another always carries the larger counter and so
//! sorts closer to the shared anchor, which keeps one author's consecutive
//! typing contiguous instead of interleaved with a concurrent author's.
//!
//! Deletes tombstone their target but never remove it from the order, so
//! concurrent inserts anchored on a deleted character keep a well-defined
//! position. Formats are evaluated last, over the converged order, so every
//! replica styles the same run of characters; per character and attribute
//! the format with the highest id wins.
//!
//! Everything here is a pure function of the operation set. The caller is
//! expected to pass each operation exactly once (the store's log already
//! guarantees that).

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::crdt::op::{OpKind, Operation};
use crate::crdt::tree::{Attrs, ContentTree};
use crate::crdt::types::OpId;

/// One character in the converged order, tombstoned or not.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderedChar {
    pub id: OpId,
    pub ch: char,
    pub deleted: bool,
}

/// The converged character order of a log, with tombstones kept in place.
///
/// This is the lookup structure local editing needs: a caret position in the
/// visible text maps here to the [`OpId`] a new operation should anchor on
/// or target.
#[derive(Debug, Default)]
pub struct DocOrder {
    entries: Vec<OrderedChar>,
    index: HashMap<OpId, usize>,
}

impl DocOrder {
    pub fn entries(&self) -> &[OrderedChar] {
        &self.entries
    }

    /// Index of an insert in the full order (tombstones included).
    pub fn position_of(&self, id: OpId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    /// Id of the `index`-th visible character, zero-based.
    pub fn visible_id_at(&self, index: usize) -> Option<OpId> {
        self.entries
            .iter()
            .filter(|e| !e.deleted)
            .nth(index)
            .map(|e| e.id)
    }

    pub fn visible_len(&self) -> usize {
        self.entries.iter().filter(|e| !e.deleted).count()
    }
}

/// Compute the converged character order of `log`.
pub fn order(log: &HashMap<OpId, Operation>) -> DocOrder {
    let mut children: HashMap<OpId, Vec<OpId>> = HashMap::new();
    let mut chars: HashMap<OpId, char> = HashMap::new();
    let mut deleted: HashSet<OpId> = HashSet::new();

    for op in log.values() {
        match &op.kind {
            OpKind::Insert { anchor, ch } => {
                children.entry(*anchor).or_default().push(op.id);
                chars.insert(op.id, *ch);
            }
            OpKind::Delete { target } => {
                deleted.insert(*target);
            }
            OpKind::Format { .. } => {}
        }
    }

    // Highest id first under each anchor.
    for siblings in children.values_mut() {
        siblings.sort_unstable_by(|a, b| b.cmp(a));
    }

    // Iterative pre-order walk. Sequential typing produces an anchor chain,
    // so the stack stays shallow even for long documents, but a recursive
    // walk would not.
    let mut entries = Vec::with_capacity(chars.len());
    let mut index = HashMap::with_capacity(chars.len());
    let mut stack: Vec<OpId> = Vec::new();
    if let Some(roots) = children.get(&OpId::root()) {
        stack.extend(roots.iter().rev());
    }
    while let Some(id) = stack.pop() {
        index.insert(id, entries.len());
        entries.push(OrderedChar {
            id,
            ch: chars[&id],
            deleted: deleted.contains(&id),
        });
        if let Some(kids) = children.get(&id) {
            stack.extend(kids.iter().rev());
        }
    }

    DocOrder { entries, index }
}

/// Project `log` into the visible document.
pub fn materialize(log: &HashMap<OpId, Operation>) -> ContentTree {
    let order = order(log);
    materialize_ordered(log, &order)
}

/// Same as [`materialize`], reusing an order already computed from `log`.
pub fn materialize_ordered(log: &HashMap<OpId, Operation>, order: &DocOrder) -> ContentTree {
    let entries = order.entries();
    let mut attrs: Vec<Attrs> = vec![Attrs::new(); entries.len()];

    // Ascending id order makes plain overwriting implement last-writer-wins.
    let mut formats: Vec<&Operation> = log
        .values()
        .filter(|op| matches!(op.kind, OpKind::Format { .. }))
        .collect();
    formats.sort_unstable_by_key(|op| op.id);

    for op in formats {
        let OpKind::Format {
            start,
            end,
            attr,
            value,
        } = &op.kind
        else {
            continue;
        };
        let (Some(a), Some(b)) = (order.position_of(*start), order.position_of(*end)) else {
            // Endpoint is not a character in this log. Nothing to style.
            continue;
        };
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        for slot in &mut attrs[lo..=hi] {
            if value == &Value::Null {
                slot.remove(attr);
            } else {
                slot.insert(attr.clone(), value.clone());
            }
        }
    }

    ContentTree::from_chars(
        entries
            .iter()
            .zip(attrs)
            .filter(|(e, _)| !e.deleted)
            .map(|(e, a)| (e.ch, a)),
    )
}
