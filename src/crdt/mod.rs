//! Conflict-free replicated document state.
//!
//! [`types`] holds the identifier and clock primitives, [`op`] the operation
//! vocabulary, [`store`] the per-document log with causal buffering, and
//! [`merge`] the deterministic projection from log to [`tree::ContentTree`].

pub mod merge;
pub mod op;
pub mod store;
pub mod tree;
pub mod types;

pub use op::{AppliedResult, OpKind, Operation, RejectReason};
pub use store::{EditError, Replica};
pub use tree::{Attrs, ContentTree, Span};
pub use types::{DocumentId, Frontier, OpClock, OpId, ReplicaId};
