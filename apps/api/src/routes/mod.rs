pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::hearing::handlers;
use crate::state::AppState;

/// Request body cap: base64 inflates audio by 4/3, plus room for the JSON envelope.
fn body_limit(max_audio_bytes: usize) -> usize {
    max_audio_bytes / 3 * 4 + 64 * 1024
}

pub fn build_router(state: AppState) -> Router {
    let limit = body_limit(state.config.max_audio_bytes);
    Router::new()
        .route("/health", get(health::health_handler))
        // Hearing API
        .route(
            "/api/v1/sessions/:session_id/hearing",
            get(handlers::handle_get_hearing),
        )
        .route(
            "/api/v1/sessions/:session_id/hearing/:stage",
            post(handlers::handle_run_hearing),
        )
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}
