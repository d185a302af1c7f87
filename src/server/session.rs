//! One sync session on the server side.
//!
//! A session speaks [`Frame`]s over any [`Transport`], so the same code
//! serves a real WebSocket and an in-process channel pair in tests. The
//! lifecycle mirrors the client controller: hello and credential check,
//! resync exchange, then a loop interleaving the session's inbound
//! operations with fanout from every other session on the document.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::crdt::{AppliedResult, DocumentId, Frontier, Operation, ReplicaId};
use crate::server::state::{Broadcast, DocState, ServerState};
use crate::sync::frame::Frame;
use crate::sync::transport::Transport;

/// Accept one session and run it to completion.
///
/// `route_document` is the document named in the connection path, when the
/// transport has one; a hello for a different document is refused.
pub async fn run_session(
    state: Arc<ServerState>,
    mut transport: Transport,
    route_document: Option<DocumentId>,
) {
    // The first frame must introduce the session.
    let Some(Frame::Hello {
        document_id,
        replica_id,
        token,
    }) = transport.recv().await
    else {
        warn!("session closed before a valid hello");
        return;
    };

    if let Some(expected) = route_document {
        if expected != document_id {
            let _ = transport.send(Frame::Denied {
                reason: "hello names a different document than the path".into(),
            });
            return;
        }
    }
    if !state.authorize(token.as_deref()) {
        warn!("denied session {} on {}: bad credential", replica_id, document_id);
        let _ = transport.send(Frame::Denied {
            reason: "invalid credential".into(),
        });
        return;
    }
    if transport.send(Frame::HelloOk).is_err() {
        return;
    }
    info!("session {} joined document {}", replica_id, document_id);

    let doc = state.document(document_id);
    // Subscribe before snapshotting so nothing applied in between is lost;
    // anything that lands in both is deduplicated by the client's log.
    let updates = doc.updates.subscribe();

    let session = Session {
        doc,
        replica_id,
        transport,
    };
    session.run(updates).await;
    info!("session {} left document {}", replica_id, document_id);
}

struct Session {
    doc: Arc<DocState>,
    replica_id: ReplicaId,
    transport: Transport,
}

impl Session {
    async fn run(mut self, mut updates: broadcast::Receiver<Broadcast>) {
        loop {
            tokio::select! {
                frame = self.transport.recv() => match frame {
                    None | Some(Frame::Bye) => break,
                    Some(Frame::SyncRequest { frontier }) => {
                        if !self.answer_resync(frontier).await {
                            break;
                        }
                    }
                    Some(Frame::Op { op }) => {
                        if !self.accept_op(op).await {
                            break;
                        }
                    }
                    Some(other) => {
                        debug!("session {} sent unexpected {:?}", self.replica_id, other);
                    }
                },
                event = updates.recv() => match event {
                    Ok(broadcast) => {
                        if broadcast.source != self.replica_id
                            && self.transport.send(Frame::Op { op: broadcast.op }).is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // The next handshake will close the gap.
                        warn!(
                            "session {} lagged {} updates behind, closing for resync",
                            self.replica_id, missed
                        );
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Answer a resync request with everything past the client's frontier.
    async fn answer_resync(&mut self, frontier: Frontier) -> bool {
        let response = {
            let replica = self.doc.replica.lock().await;
            Frame::SyncResponse {
                ops: replica.missing_for(&frontier),
                frontier: replica.frontier(),
            }
        };
        self.transport.send(response).is_ok()
    }

    /// Apply one inbound operation, acknowledge it, and fan it out.
    async fn accept_op(&mut self, op: Operation) -> bool {
        let id = op.id;
        let result = self.doc.replica.lock().await.apply(op.clone());
        match result {
            AppliedResult::Applied | AppliedResult::Buffered => {
                if self.transport.send(Frame::Ack { id }).is_err() {
                    return false;
                }
                // Nobody listening is fine; new sessions resync anyway.
                let _ = self.doc.updates.send(Broadcast {
                    source: self.replica_id,
                    op,
                });
                true
            }
            AppliedResult::AlreadyApplied => {
                // Redelivery. Acknowledge, do not fan out again.
                self.transport.send(Frame::Ack { id }).is_ok()
            }
            AppliedResult::Rejected(reason) => {
                warn!(
                    "session {} sent a malformed operation: {}",
                    self.replica_id, reason
                );
                true
            }
        }
    }
}
