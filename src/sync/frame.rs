//! Wire vocabulary of a sync session.
//!
//! Frames travel as JSON text messages, tagged by `type`. The handshake is
//! `hello` / `hello_ok` (or `denied`); the client then sends `sync_request`
//! and the server answers `sync_response`, while the client's side of the
//! gap travels back as ordinary `op` frames. After that the session is a
//! stream of `op` and `ack` frames until one side says `bye` or the
//! connection drops.

use serde::{Deserialize, Serialize};

use crate::crdt::{DocumentId, Frontier, OpId, Operation, ReplicaId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Session opener: which document, who is asking, and the credential to
    /// check it with.
    Hello {
        document_id: DocumentId,
        replica_id: ReplicaId,
        token: Option<String>,
    },
    HelloOk,
    /// Authorization failure. Terminal for the session.
    Denied { reason: String },
    /// "Send me everything past this frontier."
    SyncRequest { frontier: Frontier },
    /// The missing operations, ascending by id, plus the sender's own
    /// frontier so the receiver can answer with its side of the gap.
    SyncResponse {
        ops: Vec<Operation>,
        frontier: Frontier,
    },
    Op { op: Operation },
    Ack { id: OpId },
    Bye,
}

impl Frame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Frame, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{OpKind, ReplicaId};

    #[test]
    fn frames_round_trip() {
        let replica = ReplicaId::from_u128(7);
        let op = Operation::new(
            OpId::new(1, replica),
            vec![],
            OpKind::Insert {
                anchor: OpId::root(),
                ch: 'a',
            },
        );
        let frames = vec![
            Frame::Hello {
                document_id: DocumentId::from_u128(1),
                replica_id: replica,
                token: Some("secret".into()),
            },
            Frame::HelloOk,
            Frame::Denied {
                reason: "bad token".into(),
            },
            Frame::SyncRequest {
                frontier: Frontier::new(),
            },
            Frame::SyncResponse {
                ops: vec![op.clone()],
                frontier: Frontier::new(),
            },
            Frame::Op { op },
            Frame::Ack {
                id: OpId::new(1, replica),
            },
            Frame::Bye,
        ];
        for frame in frames {
            let text = frame.encode().unwrap();
            assert_eq!(Frame::decode(&text).unwrap(), frame);
        }
    }

    #[test]
    fn tag_is_snake_case_on_the_wire() {
        let text = Frame::HelloOk.encode().unwrap();
        assert_eq!(text, r#"{"type":"hello_ok"}"#);
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        assert!(Frame::decode(r#"{"type":"teleport"}"#).is_err());
        assert!(Frame::decode("not json at all").is_err());
    }
}
