//! End-to-end session tests: client controllers against the reference
//! server, over in-process transports that can be cut to simulate outages,
//! plus one smoke test over a real WebSocket.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cowrite::server::{create_router, run_session, ServerConfig, ServerState};
use cowrite::{
    Connector, DocumentId, SessionFault, SessionState, SyncConfig, SyncHandle, Transport,
    TransportError, WsConnector,
};
use tokio::sync::watch;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Connector that hands sessions straight to an in-process server. Every
/// live connection runs through a relay that can be severed, and dialing
/// can be refused to keep a client offline.
struct LocalConnector {
    state: Arc<ServerState>,
    generation: watch::Sender<u64>,
    refuse: AtomicBool,
    attempts: AtomicUsize,
}

impl LocalConnector {
    fn new(state: Arc<ServerState>) -> Arc<Self> {
        let (generation, _) = watch::channel(0);
        Arc::new(LocalConnector {
            state,
            generation,
            refuse: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        })
    }

    /// Drop every live connection.
    fn sever(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, _document: DocumentId) -> Result<Transport, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("refused by test".into()));
        }

        let (client_side, mut relay_client) = Transport::pair();
        let (mut relay_server, server_side) = Transport::pair();
        tokio::spawn(run_session(Arc::clone(&self.state), server_side, None));

        let mut severed = self.generation.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = severed.changed() => break,
                    frame = relay_client.recv() => match frame {
                        Some(frame) => {
                            if relay_server.send(frame).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    frame = relay_server.recv() => match frame {
                        Some(frame) => {
                            if relay_client.send(frame).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            // Dropping both relay ends closes client and server sides.
        });

        Ok(client_side)
    }
}

fn quick_config() -> SyncConfig {
    SyncConfig {
        token: None,
        backoff_base_ms: 10,
        backoff_max_ms: 50,
        flush_timeout_ms: 500,
    }
}

async fn wait_text(handle: &SyncHandle, expected: &str) {
    let mut content = handle.content();
    timeout(WAIT, content.wait_for(|tree| tree.text() == expected))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", expected))
        .expect("content channel closed");
}

async fn wait_state(handle: &SyncHandle, predicate: fn(&SessionState) -> bool) {
    let mut state = handle.state();
    timeout(WAIT, state.wait_for(predicate))
        .await
        .expect("timed out waiting for session state")
        .expect("state channel closed");
}

#[tokio::test]
async fn test_two_clients_converge_through_the_server() {
    let state = ServerState::new(ServerConfig::default());
    let connector = LocalConnector::new(Arc::clone(&state));
    let document = DocumentId::from_u128(1);

    let alice = SyncHandle::spawn(document, connector.clone(), quick_config());
    let bob = SyncHandle::spawn(document, connector.clone(), quick_config());
    wait_state(&alice, |s| s.is_synced()).await;
    wait_state(&bob, |s| s.is_synced()).await;

    alice.insert_str(0, "hello");
    wait_text(&bob, "hello").await;

    bob.insert_str(5, " world");
    wait_text(&alice, "hello world").await;

    // The authoritative replica carries the same text.
    assert_eq!(
        state.document(document).replica.lock().await.text(),
        "hello world"
    );

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_offline_edits_survive_reconnect_exactly_once() {
    let state = ServerState::new(ServerConfig::default());
    let connector = LocalConnector::new(Arc::clone(&state));
    let document = DocumentId::from_u128(1);

    let alice = SyncHandle::spawn(document, connector.clone(), quick_config());
    let bob = SyncHandle::spawn(document, connector.clone(), quick_config());

    alice.insert_str(0, "abc");
    wait_text(&bob, "abc").await;

    // Outage: cut the wires and refuse redials.
    connector.set_refuse(true);
    connector.sever();
    wait_state(&alice, |s| !s.is_connected()).await;
    wait_state(&bob, |s| !s.is_connected()).await;

    // Five edits while disconnected. They apply locally at once.
    alice.insert_str(3, "defgh");
    wait_text(&alice, "abcdefgh").await;
    assert_eq!(bob.content().borrow().text(), "abc");

    // Connectivity returns; both resync from their frontiers.
    connector.set_refuse(false);
    wait_text(&bob, "abcdefgh").await;
    wait_state(&alice, |s| s.is_synced()).await;
    wait_state(&bob, |s| s.is_synced()).await;

    // Exactly once: eight inserts, no duplicates, on the authority.
    let server_doc = state.document(document);
    let server_replica = server_doc.replica.lock().await;
    assert_eq!(server_replica.text(), "abcdefgh");
    assert_eq!(server_replica.op_count(), 8);
    drop(server_replica);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_presence_signals_follow_connectivity() {
    let state = ServerState::new(ServerConfig::default());
    let connector = LocalConnector::new(Arc::clone(&state));
    connector.set_refuse(true);

    let handle = SyncHandle::spawn(DocumentId::from_u128(1), connector.clone(), quick_config());

    // While dialing is refused the session never reports connected.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_connected());
    assert!(!handle.is_synced());

    connector.set_refuse(false);
    wait_state(&handle, |s| s.is_synced()).await;
    assert!(handle.is_connected());

    // Cut again: presence must drop.
    connector.set_refuse(true);
    connector.sever();
    wait_state(&handle, |s| !s.is_connected()).await;

    handle.close().await;
}

#[tokio::test]
async fn test_denied_session_is_terminal() {
    let state = ServerState::new(ServerConfig {
        auth_token: Some("secret".into()),
        ..ServerConfig::default()
    });
    let connector = LocalConnector::new(Arc::clone(&state));

    let config = SyncConfig {
        token: Some("wrong".into()),
        ..quick_config()
    };
    let handle = SyncHandle::spawn(DocumentId::from_u128(1), connector.clone(), config);

    let mut fault = handle.fault();
    let seen = timeout(WAIT, fault.wait_for(|f| f.is_some()))
        .await
        .expect("timed out waiting for fault")
        .expect("fault channel closed")
        .clone();
    assert!(matches!(seen, Some(SessionFault::Denied(_))));

    // No retry after a denial.
    let attempts = connector.attempts();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(connector.attempts(), attempts);
    assert!(!handle.is_connected());

    handle.close().await;
}

#[tokio::test]
async fn test_accepted_token_syncs() {
    let state = ServerState::new(ServerConfig {
        auth_token: Some("secret".into()),
        ..ServerConfig::default()
    });
    let connector = LocalConnector::new(Arc::clone(&state));

    let config = SyncConfig {
        token: Some("secret".into()),
        ..quick_config()
    };
    let handle = SyncHandle::spawn(DocumentId::from_u128(1), connector, config);
    wait_state(&handle, |s| s.is_synced()).await;
    handle.close().await;
}

#[tokio::test]
async fn test_close_flushes_before_teardown() {
    let state = ServerState::new(ServerConfig::default());
    let connector = LocalConnector::new(Arc::clone(&state));
    let document = DocumentId::from_u128(1);

    let writer = SyncHandle::spawn(document, connector.clone(), quick_config());
    wait_state(&writer, |s| s.is_synced()).await;
    writer.insert_str(0, "persisted");
    writer.close().await;

    // A fresh session sees everything the closed one wrote.
    let reader = SyncHandle::spawn(document, connector.clone(), quick_config());
    wait_text(&reader, "persisted").await;
    reader.close().await;
}

#[tokio::test]
async fn test_websocket_end_to_end() {
    let state = ServerState::new(ServerConfig::default());
    let app = create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let connector = Arc::new(WsConnector::new(format!("ws://{}", addr)));
    let document = DocumentId::from_u128(7);

    let alice = SyncHandle::spawn(document, connector.clone(), quick_config());
    let bob = SyncHandle::spawn(document, connector, quick_config());
    wait_state(&alice, |s| s.is_synced()).await;
    wait_state(&bob, |s| s.is_synced()).await;

    alice.insert_str(0, "over the wire");
    wait_text(&bob, "over the wire").await;

    bob.delete(0);
    bob.insert(0, 'O');
    wait_text(&alice, "Over the wire").await;

    alice.close().await;
    bob.close().await;
}
