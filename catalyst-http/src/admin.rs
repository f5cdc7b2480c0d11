//! Liveness and debug endpoints, separate from the playback-facing routes.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::state::AppState;

pub async fn handle_ok() -> impl IntoResponse {
    "ok"
}

pub async fn handle_members(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.dump_members())
}
