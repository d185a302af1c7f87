//! Route handlers for the sync server.
//!
//! HTTP carries the document metadata surface; `/ws/:document_id` upgrades
//! into a sync session. The REST side identifies callers by the `x-user-id`
//! header, which stands in for the session layer an auth provider would
//! supply.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crdt::DocumentId;
use crate::metadata::{DocumentPatch, DocumentStatus, MetadataError, UserId};
use crate::server::session::run_session;
use crate::server::state::ServerState;
use crate::sync::frame::Frame;
use crate::sync::transport::Transport;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateDocumentRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDocumentRequest {
    pub title: Option<String>,
    pub status: Option<DocumentStatus>,
    /// The version the caller read. A mismatch is answered with 409 and the
    /// current version, and nothing is applied.
    pub expected_version: u64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct ConflictResponse {
    error: String,
    current_version: u64,
}

/// Basic health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running!".to_string(),
    })
}

pub async fn create_document(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<CreateDocumentRequest>,
) -> Response {
    let Some(owner) = user_id(&headers) else {
        return missing_user();
    };
    match state.metadata.create(body.title, owner).await {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(err) => metadata_error(err),
    }
}

pub async fn list_documents(State(state): State<Arc<ServerState>>) -> Response {
    match state.metadata.list().await {
        Ok(records) => Json(records).into_response(),
        Err(err) => metadata_error(err),
    }
}

pub async fn get_document(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.metadata.get(DocumentId::from(id)).await {
        Ok(record) => Json(record).into_response(),
        Err(err) => metadata_error(err),
    }
}

pub async fn update_document(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateDocumentRequest>,
) -> Response {
    let patch = DocumentPatch {
        title: body.title,
        status: body.status,
    };
    match state
        .metadata
        .update(DocumentId::from(id), patch, body.expected_version)
        .await
    {
        Ok(record) => Json(record).into_response(),
        Err(err) => metadata_error(err),
    }
}

pub async fn delete_document(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let Some(requester) = user_id(&headers) else {
        return missing_user();
    };
    match state.metadata.delete(DocumentId::from(id), requester).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => metadata_error(err),
    }
}

/// WebSocket upgrade into a sync session for one document.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(document_id): Path<Uuid>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    let document = DocumentId::from(document_id);
    ws.on_upgrade(move |socket| async move {
        let transport = socket_transport(socket);
        run_session(state, transport, Some(document)).await;
    })
}

fn user_id(headers: &HeaderMap) -> Option<UserId> {
    let value = headers.get("x-user-id")?.to_str().ok()?;
    value.parse::<Uuid>().ok().map(UserId::from)
}

fn missing_user() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "missing or invalid x-user-id header".to_string(),
        }),
    )
        .into_response()
}

fn metadata_error(err: MetadataError) -> Response {
    match err {
        MetadataError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: err.to_string(),
            }),
        )
            .into_response(),
        MetadataError::VersionConflict { current, .. } => (
            StatusCode::CONFLICT,
            Json(ConflictResponse {
                error: err.to_string(),
                current_version: current,
            }),
        )
            .into_response(),
        MetadataError::Forbidden => (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: err.to_string(),
            }),
        )
            .into_response(),
    }
}

/// Bridge an accepted WebSocket into a frame transport. Two pump tasks
/// translate both ways and wind down when either side hangs up.
fn socket_transport(socket: WebSocket) -> Transport {
    let (mut sink, mut source) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let (inbound_tx, inbound) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(err) => {
                    warn!("dropping unencodable frame: {}", err);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
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
                    Err(err) => warn!("skipping undecodable frame: {}", err),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!("websocket read failed: {}", err);
                    break;
                }
            }
        }
    });

    Transport::from_channels(outbound, inbound)
}

/// Creates and configures the main application router
pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/documents", get(list_documents).post(create_document))
        .route(
            "/documents/:id",
            get(get_document)
                .patch(update_document)
                .delete(delete_document),
        )
        .route("/ws/:document_id", get(ws_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::ServerConfig;

    fn test_state() -> Arc<ServerState> {
        ServerState::new(ServerConfig::default())
    }

    fn owner_headers(user: u128) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-user-id",
            Uuid::from_u128(user).to_string().parse().unwrap(),
        );
        headers
    }

    async fn created(state: &Arc<ServerState>, title: &str, user: u128) -> DocumentId {
        let record = state
            .metadata
            .create(title.to_string(), UserId::from_u128(user))
            .await
            .unwrap();
        record.id
    }

    #[tokio::test]
    async fn create_requires_a_user_header() {
        let state = test_state();
        let response = create_document(
            State(Arc::clone(&state)),
            HeaderMap::new(),
            Json(CreateDocumentRequest {
                title: "notes".into(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = create_document(
            State(state),
            owner_headers(1),
            Json(CreateDocumentRequest {
                title: "notes".into(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn stale_update_is_a_conflict() {
        let state = test_state();
        let id = created(&state, "notes", 1).await;

        let fresh = update_document(
            State(Arc::clone(&state)),
            Path(Uuid::from(id)),
            Json(UpdateDocumentRequest {
                title: Some("renamed".into()),
                status: None,
                expected_version: 1,
            }),
        )
        .await;
        assert_eq!(fresh.status(), StatusCode::OK);

        let stale = update_document(
            State(state),
            Path(Uuid::from(id)),
            Json(UpdateDocumentRequest {
                title: Some("too late".into()),
                status: None,
                expected_version: 1,
            }),
        )
        .await;
        assert_eq!(stale.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn delete_by_non_owner_is_forbidden() {
        let state = test_state();
        let id = created(&state, "notes", 1).await;

        let response = delete_document(
            State(Arc::clone(&state)),
            Path(Uuid::from(id)),
            owner_headers(2),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response =
            delete_document(State(state), Path(Uuid::from(id)), owner_headers(1)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn unknown_document_is_not_found() {
        let state = test_state();
        let response = get_document(State(state), Path(Uuid::from_u128(42))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
