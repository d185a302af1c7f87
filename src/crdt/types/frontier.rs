//! Causal frontier: the latest known counter per replica.
//!
//! The resync handshake exchanges frontiers so each side can send exactly the
//! operations the other has not seen. A frontier is a faithful summary of a
//! log because per-replica counters are strictly increasing: "I know replica
//! R up to counter N" covers every operation R created up to that point.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{OpId, ReplicaId};

/// Latest known operation counter per replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frontier(BTreeMap<ReplicaId, u64>);

impl Frontier {
    pub fn new() -> Self {
        Frontier::default()
    }

    /// The highest counter known for `replica`, 0 when the replica is unknown.
    pub fn counter_for(&self, replica: ReplicaId) -> u64 {
        self.0.get(&replica).copied().unwrap_or(0)
    }

    /// Whether an operation with this id is covered by the frontier.
    pub fn covers(&self, id: OpId) -> bool {
        id.counter <= self.counter_for(id.replica)
    }

    /// Records an observed operation id, keeping the per-replica maximum.
    pub fn record(&mut self, id: OpId) {
        let entry = self.0.entry(id.replica).or_insert(0);
        *entry = (*entry).max(id.counter);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.0.iter().map(|(replica, counter)| (*replica, *counter))
    }
}
