//! Reference sync server binary.
//!
//! Serves the metadata REST surface and the per-document sync WebSocket on
//! one listener. Configuration comes from the environment; see
//! [`cowrite::server::ServerConfig`].

use tracing::info;
use tracing_subscriber::EnvFilter;

use cowrite::server::{create_router, ServerConfig, ServerState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting cowrite sync server...");

    let config = ServerConfig::from_env();
    let addr = config.addr;
    if config.auth_token.is_some() {
        info!("Session credential check is enabled");
    }
    let state = ServerState::new(config);
    let app = create_router(state);

    info!("Server listening on http://{}", addr);
    info!("Available endpoints:");
    info!("  GET    /health          - Health check");
    info!("  GET    /documents       - List document metadata");
    info!("  POST   /documents       - Create a document");
    info!("  GET    /documents/:id   - Fetch one document");
    info!("  PATCH  /documents/:id   - Update metadata, optimistic lock");
    info!("  DELETE /documents/:id   - Delete a document, owner only");
    info!("  GET    /ws/:document_id - Sync session WebSocket");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
