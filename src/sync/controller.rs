//! Session state machine for one open document.
//!
//! A spawned controller is a single tokio task that owns the replica, so
//! every mutation of local state flows through one place. The task walks
//! `Disconnected -> Connecting -> Handshaking -> Synced`; any connection
//! loss falls back to `Disconnected` and retries with exponential backoff,
//! and every retry re-runs the full handshake from the causal frontier
//! rather than trusting a remembered cursor.
//!
//! Local edits are accepted in every state. They apply to the replica
//! immediately and ride along on the wire once the session is draining or
//! synced; an offline stretch just widens the gap the next handshake closes.
//! The handshake is two-way: `Synced` is announced only after the server's
//! missing operations are applied here and everything the server lacked has
//! been sent and acknowledged back.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::crdt::{
    AppliedResult, ContentTree, DocumentId, OpId, Operation, Replica, ReplicaId,
};
use crate::sync::frame::Frame;
use crate::sync::transport::{Connector, Transport};

/// Where the session currently stands. Observable through
/// [`SyncHandle::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Synced,
}

impl SessionState {
    /// A transport to the server exists (handshake may still be running).
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Handshaking | SessionState::Synced)
    }

    /// Fully drained in both directions; live edits flow.
    pub fn is_synced(self) -> bool {
        matches!(self, SessionState::Synced)
    }
}

/// Terminal session failures. Connection drops are not faults, they are
/// retried; a fault means the session gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFault {
    #[error("session denied: {0}")]
    Denied(String),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Credential forwarded in the hello frame. `None` sends no token.
    pub token: Option<String>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How long `close` may wait for outstanding acknowledgements.
    pub flush_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            token: None,
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
            flush_timeout_ms: 2_000,
        }
    }
}

/// Doubling delay between reconnect attempts, capped at a maximum.
#[derive(Debug)]
struct Backoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl Backoff {
    fn new(base_ms: u64, max_ms: u64) -> Self {
        Backoff {
            base_ms,
            max_ms,
            attempt: 0,
        }
    }

    fn next(&mut self) -> Duration {
        let shift = self.attempt.min(16);
        let ms = self
            .base_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_ms);
        self.attempt += 1;
        Duration::from_millis(ms)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

enum Command {
    Insert { pos: usize, ch: char },
    Delete { pos: usize },
    Format { range: Range<usize>, attr: String, value: Value },
    Close,
}

/// How one connection attempt ended.
enum ConnectionEnd {
    /// Transport lost; back off and reconnect.
    Retry,
    /// Close requested; the task exits.
    Close,
    /// The server refused the session. Terminal.
    Denied(String),
}

/// Caller-facing handle to a running session.
///
/// Edits are fire-and-forget and never block; invalid positions are logged
/// and dropped, exactly as they would be rejected by [`Replica`] directly.
/// Document content and session state arrive through watch channels.
pub struct SyncHandle {
    replica_id: ReplicaId,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    content: watch::Receiver<ContentTree>,
    fault: watch::Receiver<Option<SessionFault>>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Spawn the controller task for `document` and hand back its handle.
    pub fn spawn(
        document: DocumentId,
        connector: Arc<dyn Connector>,
        config: SyncConfig,
    ) -> SyncHandle {
        let replica_id = ReplicaId::random();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (content_tx, content_rx) = watch::channel(ContentTree::default());
        let (fault_tx, fault_rx) = watch::channel::<Option<SessionFault>>(None);

        let backoff = Backoff::new(config.backoff_base_ms, config.backoff_max_ms);
        let controller = Controller {
            document,
            replica: Replica::new(replica_id),
            config,
            connector,
            state_tx,
            content_tx,
            fault_tx,
            acked: 0,
            backoff,
        };
        let span = info_span!("sync", document = %document, replica = %replica_id);
        let task = tokio::spawn(controller.run(command_rx).instrument(span));

        SyncHandle {
            replica_id,
            commands: command_tx,
            state: state_rx,
            content: content_rx,
            fault: fault_rx,
            task,
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Insert `ch` so it lands at visible position `pos`.
    pub fn insert(&self, pos: usize, ch: char) {
        self.send(Command::Insert { pos, ch });
    }

    /// Type a string starting at visible position `pos`.
    pub fn insert_str(&self, pos: usize, text: &str) {
        for (offset, ch) in text.chars().enumerate() {
            self.send(Command::Insert {
                pos: pos + offset,
                ch,
            });
        }
    }

    pub fn delete(&self, pos: usize) {
        self.send(Command::Delete { pos });
    }

    /// Set (or clear, with `Value::Null`) an attribute over a half-open
    /// range of visible positions.
    pub fn format(&self, range: Range<usize>, attr: &str, value: Value) {
        self.send(Command::Format {
            range,
            attr: attr.to_string(),
            value,
        });
    }

    /// Current and future session states.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Current and future materialized documents.
    pub fn content(&self) -> watch::Receiver<ContentTree> {
        self.content.clone()
    }

    /// Set once if the session fails terminally.
    pub fn fault(&self) -> watch::Receiver<Option<SessionFault>> {
        self.fault.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    pub fn is_synced(&self) -> bool {
        self.state.borrow().is_synced()
    }

    /// Flush unacknowledged operations (bounded by the configured timeout),
    /// say goodbye and tear the session down. The replica is discarded.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close);
        let _ = self.task.await;
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("edit dropped, session already closed");
        }
    }
}

struct Controller {
    document: DocumentId,
    replica: Replica,
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    state_tx: watch::Sender<SessionState>,
    content_tx: watch::Sender<ContentTree>,
    fault_tx: watch::Sender<Option<SessionFault>>,
    /// Highest own counter the server has acknowledged.
    acked: u64,
    backoff: Backoff,
}

impl Controller {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            match self.run_connection(&mut commands).await {
                ConnectionEnd::Retry => {
                    self.set_state(SessionState::Disconnected);
                    let delay = self.backoff.next();
                    debug!("reconnecting in {:?}", delay);
                    if !self.idle_wait(delay, &mut commands).await {
                        break;
                    }
                }
                ConnectionEnd::Close => break,
                ConnectionEnd::Denied(reason) => {
                    warn!("session denied: {}", reason);
                    self.fault_tx
                        .send_replace(Some(SessionFault::Denied(reason)));
                    break;
                }
            }
        }
        self.set_state(SessionState::Disconnected);
        debug!("session task finished");
    }

    /// One full connection attempt: dial, handshake, then the live loop.
    async fn run_connection(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> ConnectionEnd {
        self.set_state(SessionState::Connecting);
        let mut transport = match self.dial(commands).await {
            Ok(transport) => transport,
            Err(end) => return end,
        };

        self.set_state(SessionState::Handshaking);
        if let Err(end) = self.handshake(&mut transport, commands).await {
            return end;
        }

        self.set_state(SessionState::Synced);
        self.backoff.reset();
        self.steady(&mut transport, commands).await
    }

    /// Connect while still accepting edits.
    async fn dial(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<Transport, ConnectionEnd> {
        let connector = Arc::clone(&self.connector);
        let document = self.document;
        let mut attempt = Box::pin(async move { connector.connect(document).await });
        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(transport) => Ok(transport),
                        Err(err) => {
                            debug!("connect failed: {}", err);
                            Err(ConnectionEnd::Retry)
                        }
                    };
                }
                command = commands.recv() => {
                    if !self.offline_command(command) {
                        return Err(ConnectionEnd::Close);
                    }
                }
            }
        }
    }

    /// Hello, resync in both directions, wait for the drain to be
    /// acknowledged. On `Ok` the session is fully caught up.
    async fn handshake(
        &mut self,
        transport: &mut Transport,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<(), ConnectionEnd> {
        let hello = Frame::Hello {
            document_id: self.document,
            replica_id: self.replica.replica(),
            token: self.config.token.clone(),
        };
        if transport.send(hello).is_err() {
            return Err(ConnectionEnd::Retry);
        }

        // Wait for the server's verdict.
        loop {
            tokio::select! {
                frame = transport.recv() => match frame {
                    None | Some(Frame::Bye) => return Err(ConnectionEnd::Retry),
                    Some(Frame::HelloOk) => break,
                    Some(Frame::Denied { reason }) => {
                        return Err(ConnectionEnd::Denied(reason));
                    }
                    Some(other) => debug!("ignoring pre-accept frame {:?}", other),
                },
                command = commands.recv() => {
                    if !self.offline_command(command) {
                        return Err(ConnectionEnd::Close);
                    }
                }
            }
        }

        let request = Frame::SyncRequest {
            frontier: self.replica.frontier(),
        };
        if transport.send(request).is_err() {
            return Err(ConnectionEnd::Retry);
        }

        // The server's side of the gap.
        let server_frontier = loop {
            tokio::select! {
                frame = transport.recv() => match frame {
                    None | Some(Frame::Bye) => return Err(ConnectionEnd::Retry),
                    Some(Frame::SyncResponse { ops, frontier }) => {
                        let count = ops.len();
                        for op in ops {
                            self.replica.apply(op);
                        }
                        self.publish_content();
                        debug!("applied {} operations from resync", count);
                        break frontier;
                    }
                    Some(Frame::Op { op }) => self.apply_remote(op),
                    Some(Frame::Denied { reason }) => {
                        return Err(ConnectionEnd::Denied(reason));
                    }
                    Some(other) => debug!("ignoring handshake frame {:?}", other),
                },
                command = commands.recv() => {
                    if !self.offline_command(command) {
                        return Err(ConnectionEnd::Close);
                    }
                }
            }
        };

        // Our side of the gap. Synced is earned once every one of these has
        // been acknowledged.
        let missing = self.replica.missing_for(&server_frontier);
        let mut outstanding: HashSet<OpId> = missing.iter().map(|op| op.id).collect();
        let sent = missing.len();
        for op in missing {
            if transport.send(Frame::Op { op }).is_err() {
                return Err(ConnectionEnd::Retry);
            }
        }

        while !outstanding.is_empty() {
            tokio::select! {
                frame = transport.recv() => match frame {
                    None | Some(Frame::Bye) => return Err(ConnectionEnd::Retry),
                    Some(Frame::Ack { id }) => {
                        self.record_ack(id);
                        outstanding.remove(&id);
                    }
                    Some(Frame::Op { op }) => self.apply_remote(op),
                    Some(Frame::Denied { reason }) => {
                        return Err(ConnectionEnd::Denied(reason));
                    }
                    Some(other) => debug!("ignoring drain frame {:?}", other),
                },
                command = commands.recv() => match command {
                    None | Some(Command::Close) => return Err(ConnectionEnd::Close),
                    Some(command) => {
                        // Mid-drain edits join the batch being drained.
                        if let Some(op) = self.mint_edit(command) {
                            outstanding.insert(op.id);
                            if transport.send(Frame::Op { op }).is_err() {
                                return Err(ConnectionEnd::Retry);
                            }
                        }
                    }
                },
            }
        }

        info!("handshake complete, {} operations drained", sent);
        Ok(())
    }

    /// Live phase: edits out, remote operations and acks in.
    async fn steady(
        &mut self,
        transport: &mut Transport,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> ConnectionEnd {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(Command::Close) => {
                        self.flush(transport).await;
                        let _ = transport.send(Frame::Bye);
                        return ConnectionEnd::Close;
                    }
                    Some(command) => {
                        if let Some(op) = self.mint_edit(command) {
                            if transport.send(Frame::Op { op }).is_err() {
                                return ConnectionEnd::Retry;
                            }
                        }
                    }
                },
                frame = transport.recv() => match frame {
                    None | Some(Frame::Bye) => return ConnectionEnd::Retry,
                    Some(Frame::Op { op }) => self.apply_remote(op),
                    Some(Frame::Ack { id }) => self.record_ack(id),
                    Some(Frame::Denied { reason }) => {
                        return ConnectionEnd::Denied(reason);
                    }
                    Some(other) => debug!("ignoring frame {:?}", other),
                },
            }
        }
    }

    /// Best-effort wait for every own operation to be acknowledged, bounded
    /// by the configured flush timeout.
    async fn flush(&mut self, transport: &mut Transport) {
        for op in self.replica.pending_since(self.acked) {
            if transport.send(Frame::Op { op }).is_err() {
                return;
            }
        }
        let deadline = Instant::now() + Duration::from_millis(self.config.flush_timeout_ms);
        while !self.replica.pending_since(self.acked).is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("close flush timed out with operations unacknowledged");
                return;
            }
            match timeout(remaining, transport.recv()).await {
                Ok(Some(Frame::Ack { id })) => self.record_ack(id),
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    warn!("close flush ended with operations unacknowledged");
                    return;
                }
            }
        }
    }

    /// Sleep between reconnect attempts, still accepting edits. Returns
    /// `false` if close was requested during the wait.
    async fn idle_wait(
        &mut self,
        delay: Duration,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = commands.recv() => {
                    if !self.offline_command(command) {
                        return false;
                    }
                }
            }
        }
    }

    /// Handle a command while nothing can be transmitted. Returns `false`
    /// on close.
    fn offline_command(&mut self, command: Option<Command>) -> bool {
        match command {
            None | Some(Command::Close) => false,
            Some(command) => {
                self.mint_edit(command);
                true
            }
        }
    }

    /// Apply a local edit to the replica and hand back the minted operation.
    fn mint_edit(&mut self, command: Command) -> Option<Operation> {
        let result = match command {
            Command::Insert { pos, ch } => self.replica.insert_at(pos, ch),
            Command::Delete { pos } => self.replica.delete_at(pos),
            Command::Format { range, attr, value } => {
                self.replica.format_range(range, &attr, value)
            }
            Command::Close => return None,
        };
        match result {
            Ok(op) => {
                self.publish_content();
                Some(op)
            }
            Err(err) => {
                warn!("ignoring local edit: {}", err);
                None
            }
        }
    }

    fn apply_remote(&mut self, op: Operation) {
        if let AppliedResult::Applied = self.replica.apply(op) {
            self.publish_content();
        }
    }

    fn record_ack(&mut self, id: OpId) {
        if id.replica == self.replica.replica() {
            self.acked = self.acked.max(id.counter);
        }
    }

    fn publish_content(&self) {
        self.content_tx.send_replace(self.replica.materialize());
    }

    fn set_state(&self, state: SessionState) {
        if *self.state_tx.borrow() != state {
            debug!("session state {:?}", state);
            self.state_tx.send_replace(state);
        }
    }
}
