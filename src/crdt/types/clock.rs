//! Lamport clock for minting operation identifiers.
//!
//! Each replica carries one clock. New local operations get the next counter;
//! observing a remote operation advances the clock past that operation's
//! counter. The result is that a causally later operation always carries a
//! strictly larger counter than everything its creator had seen, which is
//! what lets [`OpId`](super::OpId) ordering stand in for recency.

use super::{OpId, ReplicaId};

/// A Lamport clock owned by a single replica.
///
/// Unlike a wall clock this only moves when asked: `tick` on local edit
/// creation, `observe` on every applied remote operation. The replica's
/// single-writer discipline means no interior synchronization is needed.
#[derive(Debug, Clone)]
pub struct OpClock {
    replica: ReplicaId,
    counter: u64,
}

impl OpClock {
    pub fn new(replica: ReplicaId) -> Self {
        OpClock { replica, counter: 0 }
    }

    /// Mints the id for a new local operation.
    pub fn tick(&mut self) -> OpId {
        self.counter += 1;
        OpId::new(self.counter, self.replica)
    }

    /// Advances the clock past a remote operation's counter so the next local
    /// id orders after it.
    pub fn observe(&mut self, id: OpId) {
        self.counter = self.counter.max(id.counter);
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// The current counter value (for bookkeeping and tests).
    pub fn current(&self) -> u64 {
        self.counter
    }
}
