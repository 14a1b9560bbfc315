use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Ok,
    Error,
    Stopped,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub database: ComponentStatus,
    pub store: ComponentStatus,
    pub realtime_subscribers: usize,
}

impl ReadinessResponse {
    fn is_ready(&self) -> bool {
        self.database == ComponentStatus::Ok && self.store == ComponentStatus::Ok
    }
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

/// Ready when the database answers and the store kernel is still receiving.
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let database = match sqlx::query("SELECT 1").fetch_one(&state.db).await {
        Ok(_) => ComponentStatus::Ok,
        Err(e) => {
            tracing::error!("Readiness check: DB error: {}", e);
            ComponentStatus::Error
        }
    };

    let store = if state.store.is_closed() {
        tracing::error!("Readiness check: store kernel is not running");
        ComponentStatus::Stopped
    } else {
        ComponentStatus::Ok
    };

    let mut response = ReadinessResponse {
        status: "unready",
        database,
        store,
        realtime_subscribers: state.realtime.receiver_count(),
    };

    if response.is_ready() {
        response.status = "ready";
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}
