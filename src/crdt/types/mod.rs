//! Type definitions for the replica core.
//!
//! This module contains the fundamental identifier and clock types used
//! throughout the CRDT implementation, organized into focused submodules.

pub mod clock;
pub mod frontier;
pub mod id;

pub use clock::OpClock;
pub use frontier::Frontier;
pub use id::{DocumentId, OpId, ReplicaId};
