//! Shared state of the sync server.
//!
//! Each document gets one authoritative replica behind a mutex (applies are
//! serialized) and one broadcast channel fanning accepted operations out to
//! every connected session. The document registry itself is a lock-free map,
//! created lazily on first touch.

use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::crdt::{DocumentId, Operation, Replica, ReplicaId};
use crate::metadata::{InMemoryMetadataStore, MetadataStore};
use crate::server::config::ServerConfig;

/// An operation accepted from one session, on its way to the others.
#[derive(Debug, Clone)]
pub struct Broadcast {
    /// Replica id of the session the operation came from, so fanout can
    /// skip echoing it back.
    pub source: ReplicaId,
    pub op: Operation,
}

/// Authoritative state of one document.
pub struct DocState {
    pub replica: Mutex<Replica>,
    pub updates: broadcast::Sender<Broadcast>,
}

impl DocState {
    fn new() -> Self {
        let (updates, _) = broadcast::channel(256);
        DocState {
            replica: Mutex::new(Replica::new(ReplicaId::random())),
            updates,
        }
    }
}

pub struct ServerState {
    documents: SkipMap<DocumentId, Arc<DocState>>,
    pub metadata: Arc<dyn MetadataStore>,
    pub config: ServerConfig,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(ServerState {
            documents: SkipMap::new(),
            metadata: Arc::new(InMemoryMetadataStore::new()),
            config,
        })
    }

    /// The authoritative state for `id`, created on first touch.
    pub fn document(&self, id: DocumentId) -> Arc<DocState> {
        let entry = self.documents.get_or_insert_with(id, || {
            debug!("opening document {}", id);
            Arc::new(DocState::new())
        });
        Arc::clone(entry.value())
    }

    /// Check a session credential against the configured token. With no
    /// token configured, every session is admitted.
    pub fn authorize(&self, token: Option<&str>) -> bool {
        match &self.config.auth_token {
            None => true,
            Some(expected) => token == Some(expected.as_str()),
        }
    }
}
