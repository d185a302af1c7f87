//! Collaborative document synchronization core.
//!
//! Documents are replicated as append-only operation logs that merge
//! deterministically on every replica ([`crdt`]). A client opens a document
//! by spawning a [`sync::SyncHandle`], which owns the local replica, keeps
//! it converged with the server across disconnects, and surfaces content and
//! presence through watch channels. The [`server`] module is the reference
//! authority those sessions talk to, and [`metadata`] guards the
//! non-collaborative document fields with optimistic version locking.

pub mod crdt;
pub mod metadata;
pub mod server;
pub mod sync;

pub use crdt::{
    AppliedResult, ContentTree, DocumentId, EditError, Frontier, OpId, OpKind, Operation,
    RejectReason, Replica, ReplicaId,
};
pub use metadata::{
    DocumentPatch, DocumentRecord, DocumentStatus, InMemoryMetadataStore, MetadataError,
    MetadataStore, UserId,
};
pub use sync::{
    Connector, Frame, SessionFault, SessionState, SyncConfig, SyncHandle, Transport,
    TransportError, WsConnector,
};
