use crate::health;
use crate::logging::request_id_middleware;
use crate::realtime::RealtimeEvent;
use crate::types::*;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use futures_util::StreamExt;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::cors::CorsLayer;
use tracing::Instrument;

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub prompt: String,
    pub model: String,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub turn_id: TurnId,
    pub sequence: i64,
    pub status: TurnStatus,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub added: usize,
    pub before: Option<i64>,
    pub exhausted: bool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/conversations/:cid", get(get_conversation))
        .route("/v1/conversations/:cid/turns", post(submit_turn))
        .route("/v1/conversations/:cid/history", post(load_history))
        .route("/v1/conversations/:cid/live", get(live_updates))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Loads the newest page once so new turns get sequences above stored history.
async fn ensure_history_loaded(state: &AppState, conversation_id: &ConversationId) -> Result<()> {
    let cursor = state.store.history_cursor(conversation_id).await?;
    if cursor.before.is_none() && !cursor.exhausted {
        state
            .store
            .load_next_page(conversation_id, state.history.as_ref(), state.args.history_page_size)
            .await?;
    }
    Ok(())
}

async fn submit_turn(
    State(state): State<Arc<AppState>>,
    Path(cid): Path<String>,
    Json(body): Json<SubmitBody>,
) -> Response {
    if body.prompt.trim().is_empty() {
        return ObservedError::from(ParleyError::InvalidRequest("prompt is empty".to_string()))
            .into_response();
    }
    let conversation_id = ConversationId::from(cid);
    if let Err(e) = ensure_history_loaded(&state, &conversation_id).await {
        return e.into_response();
    }

    let request = TurnRequest {
        conversation_id,
        prompt: body.prompt,
        model: body.model,
        user_id: body.user_id,
    };
    let turn = match state.handler.submit(&request).await {
        Ok(t) => t,
        Err(e) => return e.into_response(),
    };

    let response = SubmitResponse {
        turn_id: turn.id.clone(),
        sequence: turn.sequence,
        status: turn.status,
    };

    let handler = state.handler.clone();
    let cancel = state.shutdown.child_token();
    tokio::spawn(
        async move {
            let outcome = handler.run_turn(turn, request, cancel).await;
            tracing::debug!(
                "Turn {} finished as {}",
                outcome.turn().id.short(),
                outcome.turn().status.as_str()
            );
        }
        .in_current_span(),
    );

    (StatusCode::ACCEPTED, Json(response)).into_response()
}

async fn get_conversation(State(state): State<Arc<AppState>>, Path(cid): Path<String>) -> Response {
    let conversation_id = ConversationId::from(cid);
    if let Err(e) = ensure_history_loaded(&state, &conversation_id).await {
        return e.into_response();
    }
    match state.store.get_conversation_view(&conversation_id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn load_history(State(state): State<Arc<AppState>>, Path(cid): Path<String>) -> Response {
    let conversation_id = ConversationId::from(cid);
    let added = match state
        .store
        .load_next_page(&conversation_id, state.history.as_ref(), state.args.history_page_size)
        .await
    {
        Ok(n) => n,
        Err(e) => return e.into_response(),
    };
    match state.store.history_cursor(&conversation_id).await {
        Ok(cursor) => Json(HistoryResponse {
            added,
            before: cursor.before,
            exhausted: cursor.exhausted,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn live_updates(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(cid): Path<String>,
) -> Response {
    let conversation_id = ConversationId::from(cid);
    ws.on_upgrade(move |socket| relay_socket(socket, state, conversation_id))
}

/// Forwards this conversation's realtime events to the socket and applies
/// events that other instances push back through it.
async fn relay_socket(mut socket: WebSocket, state: Arc<AppState>, conversation_id: ConversationId) {
    let mut events = BroadcastStream::new(state.realtime.subscribe());
    tracing::debug!("Live subscriber attached to {}", conversation_id.short());

    loop {
        tokio::select! {
            received = events.next() => match received {
                Some(Ok(event)) => {
                    if event.conversation_id() != &conversation_id {
                        continue;
                    }
                    let payload = match serde_json::to_string(&event) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::error!("Failed to serialize realtime event: {}", e);
                            continue;
                        }
                    };
                    if socket.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!("Live subscriber for {} lagged by {} events", conversation_id.short(), skipped);
                }
                None => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<RealtimeEvent>(&text) {
                        Ok(event) if event.conversation_id() == &conversation_id => {
                            if let Err(e) = state.store.apply_remote(event).await {
                                tracing::error!("Failed to apply remote event: {}", e.inner);
                            }
                        }
                        Ok(_) => tracing::warn!("Ignoring remote event for another conversation"),
                        Err(e) => tracing::warn!("Ignoring malformed remote event: {}", e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Live socket error: {}", e);
                    break;
                }
            },
        }
    }
    tracing::debug!("Live subscriber detached from {}", conversation_id.short());
}
