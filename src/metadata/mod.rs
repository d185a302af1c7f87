//! Versioned document metadata, guarded by optimistic locking.

pub mod record;
pub mod store;

pub use record::{DocumentPatch, DocumentRecord, DocumentStatus, UserId};
pub use store::{InMemoryMetadataStore, MetadataError, MetadataStore};
