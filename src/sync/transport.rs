//! Framed, non-blocking session transport.
//!
//! A [`Transport`] is a pair of unbounded channels carrying [`Frame`]s:
//! `send` never blocks or fails for backpressure reasons, `recv` yields each
//! inbound frame exactly once in delivery order. The transport promises
//! nothing across a disconnect; at-least-once delivery comes from the resync
//! handshake retransmitting unacknowledged operations into an idempotent log.
//!
//! [`Connector`] abstracts how a transport comes to exist, so tests can wire
//! sessions together in-process with [`Transport::pair`] while production
//! uses [`WsConnector`] over a WebSocket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::crdt::DocumentId;
use crate::sync::frame::Frame;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport closed")]
    Closed,
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// One end of a frame pipe.
pub struct Transport {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<Frame>,
}

impl Transport {
    /// Two ends wired to each other, for in-process sessions and tests.
    pub fn pair() -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Transport {
                outbound: a_tx,
                inbound: b_rx,
            },
            Transport {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }

    pub fn from_channels(
        outbound: mpsc::UnboundedSender<Frame>,
        inbound: mpsc::UnboundedReceiver<Frame>,
    ) -> Transport {
        Transport { outbound, inbound }
    }

    /// Queue a frame for the peer. Never blocks; fails only once the
    /// connection is gone.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    /// Next inbound frame, or `None` once the peer is gone and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }
}

/// How sessions reach a peer. Injected into the controller, so the state
/// machine is testable without sockets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, document: DocumentId) -> Result<Transport, TransportError>;
}

/// WebSocket connector against a sync server, e.g. `ws://127.0.0.1:3000`.
///
/// Two pump tasks translate between the socket and the frame channels; they
/// exit when either side hangs up, which surfaces to the session as `recv`
/// returning `None`.
pub struct WsConnector {
    base: String,
}

impl WsConnector {
    pub fn new(base: impl Into<String>) -> Self {
        WsConnector { base: base.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, document: DocumentId) -> Result<Transport, TransportError> {
        let url = format!("{}/ws/{}", self.base, document);
        let (socket, _) = connect_async(&url)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (mut sink, mut source) = socket.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("dropping unencodable frame: {err}");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => match Frame::decode(&text) {
                        Ok(frame) => {
                            if inbound_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("skipping undecodable frame: {err}"),
                    },
                    Ok(Message::Close(_)) => {
                        debug!("peer closed the websocket");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!("websocket read failed: {err}");
                        break;
                    }
                }
            }
        });

        Ok(Transport::from_channels(outbound, inbound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let (client, mut server) = Transport::pair();
        client.send(Frame::HelloOk).unwrap();
        client.send(Frame::Bye).unwrap();
        assert_eq!(server.recv().await, Some(Frame::HelloOk));
        assert_eq!(server.recv().await, Some(Frame::Bye));
    }

    #[tokio::test]
    async fn recv_ends_when_the_peer_drops() {
        let (client, mut server) = Transport::pair();
        client.send(Frame::Bye).unwrap();
        drop(client);
        // Queued frames still drain before the end-of-stream.
        assert_eq!(server.recv().await, Some(Frame::Bye));
        assert_eq!(server.recv().await, None);
    }

    #[tokio::test]
    async fn send_after_peer_drop_reports_closed() {
        let (client, server) = Transport::pair();
        drop(server);
        assert!(matches!(
            client.send(Frame::Bye),
            Err(TransportError::Closed)
        ));
    }
}
