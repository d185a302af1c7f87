//! The operation vocabulary of the replicated document.
//!
//! Every edit is an immutable [`Operation`]: a closed set of kinds (insert,
//! delete, format) tagged with a logical identifier and the identifiers of
//! the operations it was created after. The kinds are a closed tagged variant
//! on purpose: the merge rule's correctness depends on handling every kind
//! exhaustively, so open dispatch has no place here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::crdt::types::OpId;

/// One atomic edit.
///
/// - `Insert` places a character immediately after `anchor` (or after
///   [`OpId::root`] for the beginning of the document).
/// - `Delete` tombstones the character created by `target`. The tombstone
///   stays in the log so concurrent operations anchored on it keep a
///   well-defined position.
/// - `Format` sets one attribute over the span of characters between `start`
///   and `end` (inclusive, in converged document order). A `null` value
///   clears the attribute. Conflicting formats resolve last-writer-wins per
///   attribute, "last" meaning the highest [`OpId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    Insert { anchor: OpId, ch: char },
    Delete { target: OpId },
    Format {
        start: OpId,
        end: OpId,
        attr: String,
        value: Value,
    },
}

/// An immutable operation: identifier, causal dependencies, payload.
///
/// `deps` lists the operations this one was created after: the ids the kind
/// refers to, plus the creator's own previous operation. An operation is
/// never applied before all of its dependencies are present, which is the
/// causal buffering invariant the store enforces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub deps: Vec<OpId>,
    pub kind: OpKind,
}

impl Operation {
    pub fn new(id: OpId, deps: Vec<OpId>, kind: OpKind) -> Self {
        Operation { id, deps, kind }
    }

    /// Structural validation, independent of any log state.
    ///
    /// A well-formed operation was minted by a Lamport clock ticked past all
    /// of its dependencies, so every dependency counter is strictly below its
    /// own. Violations cover self-dependencies and every possible dependency
    /// cycle.
    pub fn validate(&self) -> Result<(), RejectReason> {
        if self.id.counter == 0 {
            return Err(RejectReason::ReservedId { id: self.id });
        }
        for dep in &self.deps {
            if *dep == self.id {
                return Err(RejectReason::SelfDependency { id: self.id });
            }
            if dep.counter >= self.id.counter {
                return Err(RejectReason::CausalityViolation {
                    id: self.id,
                    dep: *dep,
                });
            }
        }
        Ok(())
    }

    /// The ids this operation's payload refers to (anchor, target or span
    /// endpoints), excluding the always-present root.
    pub fn referenced_ids(&self) -> Vec<OpId> {
        let ids = match &self.kind {
            OpKind::Insert { anchor, .. } => vec![*anchor],
            OpKind::Delete { target } => vec![*target],
            OpKind::Format { start, end, .. } => vec![*start, *end],
        };
        ids.into_iter().filter(|id| !id.is_root()).collect()
    }
}

/// Outcome of offering an operation to the replica store.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedResult {
    /// New operation, now part of the log.
    Applied,
    /// Same id already present; redelivery is a no-op, not an error.
    AlreadyApplied,
    /// Held back until its missing dependencies arrive; retried
    /// automatically, never dropped.
    Buffered,
    /// Malformed; the single offending operation is discarded and reported,
    /// the stream continues.
    Rejected(RejectReason),
}

/// Why an operation was rejected outright. Only malformed input lands here;
/// out-of-order delivery is buffering, not rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("operation {id} uses the reserved root counter")]
    ReservedId { id: OpId },
    #[error("operation {id} depends on itself")]
    SelfDependency { id: OpId },
    #[error("operation {id} depends on {dep}, which does not precede it")]
    CausalityViolation { id: OpId, dep: OpId },
}
