//! Metadata storage behind optimistic version locking.
//!
//! Every update names the version it read. The store compares under the
//! record lock and either applies the whole patch with a version bump of
//! exactly one, or fails with the current version and changes nothing.
//! There is no session and no retry here; a conflicted caller refetches and
//! decides for itself.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::crdt::DocumentId;
use crate::metadata::record::{DocumentPatch, DocumentRecord, DocumentStatus, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("document {0} not found")]
    NotFound(DocumentId),
    #[error("version conflict: expected {expected}, current is {current}")]
    VersionConflict { expected: u64, current: u64 },
    #[error("only the owner may delete a document")]
    Forbidden,
}

/// Storage boundary for document metadata. The reference implementation is
/// in-memory; a persistent backend plugs in behind the same trait.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    async fn create(&self, title: String, owner: UserId)
        -> Result<DocumentRecord, MetadataError>;

    async fn get(&self, id: DocumentId) -> Result<DocumentRecord, MetadataError>;

    /// All records, newest first.
    async fn list(&self) -> Result<Vec<DocumentRecord>, MetadataError>;

    /// Apply `patch` if the record is still at `expected_version`.
    async fn update(
        &self,
        id: DocumentId,
        patch: DocumentPatch,
        expected_version: u64,
    ) -> Result<DocumentRecord, MetadataError>;

    /// Remove a record. Only its owner may.
    async fn delete(&self, id: DocumentId, requester: UserId) -> Result<(), MetadataError>;
}

/// Concurrent in-memory store: lock-free map for lookup, one lock per
/// record for the compare-and-update.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: SkipMap<DocumentId, Arc<RwLock<DocumentRecord>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create(
        &self,
        title: String,
        owner: UserId,
    ) -> Result<DocumentRecord, MetadataError> {
        let now = Utc::now();
        let record = DocumentRecord {
            id: DocumentId::random(),
            title,
            status: DocumentStatus::Draft,
            owner,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        debug!("created document {}", record.id);
        self.records
            .insert(record.id, Arc::new(RwLock::new(record.clone())));
        Ok(record)
    }

    async fn get(&self, id: DocumentId) -> Result<DocumentRecord, MetadataError> {
        self.records
            .get(&id)
            .map(|entry| entry.value().read().clone())
            .ok_or(MetadataError::NotFound(id))
    }

    async fn list(&self) -> Result<Vec<DocumentRecord>, MetadataError> {
        let mut records: Vec<DocumentRecord> = self
            .records
            .iter()
            .map(|entry| entry.value().read().clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn update(
        &self,
        id: DocumentId,
        patch: DocumentPatch,
        expected_version: u64,
    ) -> Result<DocumentRecord, MetadataError> {
        let entry = self.records.get(&id).ok_or(MetadataError::NotFound(id))?;
        let mut record = entry.value().write();
        if record.version != expected_version {
            debug!(
                "update of {} rejected: expected version {}, current {}",
                id, expected_version, record.version
            );
            return Err(MetadataError::VersionConflict {
                expected: expected_version,
                current: record.version,
            });
        }
        record.apply_patch(patch);
        record.version += 1;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn delete(&self, id: DocumentId, requester: UserId) -> Result<(), MetadataError> {
        let entry = self.records.get(&id).ok_or(MetadataError::NotFound(id))?;
        if entry.value().read().owner != requester {
            return Err(MetadataError::Forbidden);
        }
        entry.remove();
        debug!("deleted document {}", id);
        Ok(())
    }
}
