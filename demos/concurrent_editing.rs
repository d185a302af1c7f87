//! Live collaborative editing against the reference sync server.
//!
//! This example showcases:
//! - Multiple clients editing one document through sync sessions
//! - The two-way resync handshake catching a late joiner up
//! - Offline edits queuing locally and draining on reconnect
//! - Convergence across every client and the server's authoritative replica
//!
//! Run with: cargo run --example concurrent_editing

use std::sync::Arc;
use std::time::Duration;

use cowrite::server::{create_router, ServerConfig, ServerState};
use cowrite::{DocumentId, SyncConfig, SyncHandle, WsConnector};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    println!("=== Concurrent editing over a sync server ===\n");

    // In-process server on an ephemeral port.
    let state = ServerState::new(ServerConfig::default());
    let app = create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    println!("Server listening on ws://{}\n", addr);

    let connector = Arc::new(WsConnector::new(format!("ws://{}", addr)));
    let document = DocumentId::random();

    // Two clients open the same document.
    let alice = SyncHandle::spawn(document, connector.clone(), SyncConfig::default());
    let bob = SyncHandle::spawn(document, connector.clone(), SyncConfig::default());
    wait_synced(&alice, "alice").await;
    wait_synced(&bob, "bob").await;
    println!();

    // Alice types; Bob sees it arrive through his session.
    println!("Alice types 'Hello '");
    alice.insert_str(0, "Hello ");
    wait_text(&bob, "Hello ").await;
    println!("  Bob sees:   '{}'", bob.content().borrow().text());

    println!("Bob appends 'world'");
    bob.insert_str(6, "world");
    wait_text(&alice, "Hello world").await;
    println!("  Alice sees: '{}'", alice.content().borrow().text());

    // A third client joins late and is caught up by the handshake alone.
    println!("\nCarol joins the document late...");
    let carol = SyncHandle::spawn(document, connector.clone(), SyncConfig::default());
    wait_text(&carol, "Hello world").await;
    println!("  Carol sees: '{}'", carol.content().borrow().text());

    // Concurrent edits at the same position converge deterministically.
    println!("\nAll three edit concurrently at position 5");
    alice.insert(5, ',');
    bob.delete(0);
    carol.insert(5, '!');
    let everyone = [&alice, &bob, &carol];
    wait_convergence(&everyone).await;
    println!("  Everyone sees: '{}'", alice.content().borrow().text());

    // The authoritative replica agrees.
    let server_text = state.document(document).replica.lock().await.text();
    assert_eq!(server_text, alice.content().borrow().text());
    println!("  Server holds:  '{}'", server_text);

    println!("\nClosing sessions (pending operations flush first)...");
    alice.close().await;
    bob.close().await;
    carol.close().await;

    println!("\n=== Example complete ===");
    println!("Every replica that received the same operations shows the same text.");
}

async fn wait_synced(handle: &SyncHandle, name: &str) {
    let mut states = handle.state();
    timeout(WAIT, states.wait_for(|s| s.is_synced()))
        .await
        .expect("timed out waiting for sync")
        .expect("session ended");
    println!("{} is synced (replica {})", name, handle.replica_id());
}

async fn wait_text(handle: &SyncHandle, expected: &str) {
    let mut content = handle.content();
    timeout(WAIT, content.wait_for(|tree| tree.text() == expected))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", expected))
        .expect("session ended");
}

/// Wait until every handle shows the same text.
async fn wait_convergence(handles: &[&SyncHandle]) {
    timeout(WAIT, async {
        loop {
            let reference = handles[0].content().borrow().text();
            if handles
                .iter()
                .all(|h| h.content().borrow().text() == reference)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("replicas did not converge in time");
}
