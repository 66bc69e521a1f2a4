//! HTTP gateway surface.
//!
//! The transport contract is deliberately thin: a start request that
//! accepts immediately and processes asynchronously, a server-sent
//! event stream of transparency frames, a poll fallback for clients
//! that cannot hold a connection, and a cancel endpoint for the
//! "new chat" reset path. Auth and upload live in a different service.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::events::{EventSource, InMemoryEventBus, StreamFrame};
use crate::orchestrator::Orchestrator;
use crate::session::SessionRegistry;
use crate::types::{AnalysisRequest, TransparencyEvent};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub bus: Arc<InMemoryEventBus>,
    pub sessions: Arc<SessionRegistry>,
}

#[derive(Deserialize)]
pub struct ChatMessageRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub dataset_ref: String,
}

#[derive(Serialize)]
pub struct ChatMessageResponse {
    pub session_id: String,
    pub accepted: bool,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub session_id: String,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub session_id: String,
    pub cancelled: bool,
}

#[derive(Deserialize)]
pub struct PollParams {
    #[serde(default)]
    pub since_event_id: Option<String>,
}

#[derive(Serialize)]
pub struct PollBody {
    pub session_id: String,
    pub events: Vec<TransparencyEvent>,
    pub has_more: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/chat/message", post(message_handler))
        .route("/api/chat/cancel", post(cancel_handler))
        .route("/api/stream/events/:session_id", get(stream_handler))
        .route("/api/stream/events/:session_id/poll", get(poll_handler))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState, bind_addr: &str) -> EngineResult<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| EngineError::Config(format!("gateway bind error: {}", e)))?;
    info!(addr = %bind_addr, "gateway listening");
    axum::serve(listener, router(state).into_make_service())
        .await
        .map_err(|e| EngineError::Config(format!("gateway server error: {}", e)))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Accept a chat message and kick off orchestration in the background.
async fn message_handler(
    State(state): State<AppState>,
    Json(body): Json<ChatMessageRequest>,
) -> (StatusCode, Json<ChatMessageResponse>) {
    let session_id = body
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let request = AnalysisRequest {
        text: body.message,
        dataset_ref: body.dataset_ref,
        session_id: Some(session_id.clone()),
    };

    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        match orchestrator.handle(request).await {
            Ok(_) => {}
            Err(EngineError::Cancelled) => {}
            Err(err) => error!(error = %err, "orchestration failed"),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(ChatMessageResponse {
            session_id,
            accepted: true,
        }),
    )
}

async fn cancel_handler(
    State(state): State<AppState>,
    Json(body): Json<CancelRequest>,
) -> Json<CancelResponse> {
    let cancelled = state.sessions.cancel(&body.session_id);
    Json(CancelResponse {
        session_id: body.session_id,
        cancelled,
    })
}

fn frame_to_sse(frame: StreamFrame) -> Event {
    match frame {
        StreamFrame::Event { event } => Event::default().event("event").data(
            serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string()),
        ),
        StreamFrame::Complete {
            session_id,
            total_events,
            final_answer,
        } => Event::default().event("complete").data(
            serde_json::json!({
                "type": "complete",
                "session_id": session_id,
                "total_events": total_events,
                "final_answer": final_answer,
            })
            .to_string(),
        ),
        // The inactivity terminal rides the complete channel so every
        // consumer sees exactly one closing frame.
        StreamFrame::Timeout { session_id } => Event::default().event("complete").data(
            serde_json::json!({
                "type": "timeout",
                "session_id": session_id,
            })
            .to_string(),
        ),
        StreamFrame::Error { message } => Event::default().event("error").data(
            serde_json::json!({
                "type": "error",
                "message": message,
            })
            .to_string(),
        ),
    }
}

async fn stream_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = state
        .bus
        .subscribe(&session_id)
        .map(|frame| Ok(frame_to_sse(frame)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn poll_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<PollParams>,
) -> Json<PollBody> {
    let response = state
        .bus
        .poll(&session_id, params.since_event_id.as_deref());
    Json(PollBody {
        session_id,
        events: response.events,
        has_more: response.has_more,
    })
}
