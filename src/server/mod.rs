//! Reference synchronization server.
//!
//! Holds the authoritative replica per document, fans accepted operations
//! out to connected sessions, and serves the metadata REST surface. One
//! process is the single authority; clients treat it as a remote peer.

pub mod config;
pub mod routes;
pub mod session;
pub mod state;

pub use config::ServerConfig;
pub use routes::create_router;
pub use session::run_session;
pub use state::{Broadcast, DocState, ServerState};
