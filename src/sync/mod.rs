//! Session plumbing between a local replica and a sync server.
//!
//! [`frame`] defines the wire vocabulary, [`transport`] the non-blocking
//! frame pipe and the connectors that produce one, [`controller`] the state
//! machine that owns a replica and keeps it converged across reconnects.

pub mod controller;
pub mod frame;
pub mod transport;

pub use controller::{SessionFault, SessionState, SyncConfig, SyncHandle};
pub use frame::Frame;
pub use transport::{Connector, Transport, TransportError, WsConnector};
