pub mod admin;
pub mod error;
pub mod path;
pub mod redirect;
pub mod state;
pub mod stream_source;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Wires every route named in SPEC_FULL.md 4: the catch-all playback
/// redirect, the `STREAM_SOURCE` pull-arbitration endpoint used by the
/// media server, and the liveness/debug admin routes.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ok", get(admin::handle_ok))
        .route("/admin/members", get(admin::handle_members))
        .route("/api/mist/trigger", post(stream_source::handle_stream_source))
        .fallback(redirect::handle_redirect)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
