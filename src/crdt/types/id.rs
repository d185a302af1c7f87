//! Identifier types for replicas, documents and operations.
//!
//! This module contains the identifiers that name every participant and every
//! edit in the system. Their ordering properties are what the merge rule's
//! deterministic tie-break is built on.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for one replica (one editing session of one client).
///
/// Generated fresh for every session; never reused. The nil value is reserved
/// for [`OpId::root`], the anchor that marks the beginning of the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// Generates a fresh, globally unique replica id.
    pub fn random() -> Self {
        ReplicaId(Uuid::new_v4())
    }

    /// The reserved nil replica, used only by [`OpId::root`].
    pub fn nil() -> Self {
        ReplicaId(Uuid::nil())
    }

    /// Builds a deterministic replica id. Intended for tests and demos where
    /// a stable tie-break order matters.
    pub fn from_u128(value: u128) -> Self {
        ReplicaId(Uuid::from_u128(value))
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight hex chars are plenty for log lines.
        let simple = self.0.simple().to_string();
        write!(f, "{}", &simple[..8])
    }
}

/// An opaque, stable identifier for one document. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn random() -> Self {
        DocumentId(Uuid::new_v4())
    }

    pub fn from_u128(value: u128) -> Self {
        DocumentId(Uuid::from_u128(value))
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for DocumentId {
    fn from(value: Uuid) -> Self {
        DocumentId(value)
    }
}

impl From<DocumentId> for Uuid {
    fn from(value: DocumentId) -> Self {
        value.0
    }
}

/// The logical identifier of one operation: the originating replica plus that
/// replica's Lamport counter at creation time.
///
/// `OpId`s are totally ordered, counter first and replica second. That order
/// serves two purposes:
///
/// - it is the deterministic tie-break between causally concurrent
///   operations, so every replica holding the same operation set agrees on
///   one materialized order;
/// - because counters are Lamport counters (each replica ticks past every
///   counter it has seen), a causally later operation always orders after
///   everything it was created on top of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    /// The originating replica's logical clock value when the operation was
    /// created. Strictly increasing per replica, never reused.
    pub counter: u64,
    /// The replica that created the operation.
    pub replica: ReplicaId,
}

impl OpId {
    pub fn new(counter: u64, replica: ReplicaId) -> Self {
        OpId { counter, replica }
    }

    /// The reserved anchor that every document starts from. Inserting "at the
    /// beginning" means anchoring after this id.
    pub fn root() -> Self {
        OpId {
            counter: 0,
            replica: ReplicaId::nil(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.counter == 0 && self.replica.is_nil()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "root")
        } else {
            write!(f, "{}@{}", self.counter, self.replica)
        }
    }
}
