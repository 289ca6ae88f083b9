//! Server-Sent Events endpoint

use axum::{extract::State, response::IntoResponse, routing::get, Router};

use crate::AppState;

/// GET /api/events
///
/// SSE stream of system events for dashboards and open review sessions.
pub async fn event_stream(State(state): State<AppState>) -> impl IntoResponse {
    warden_common::sse::event_stream(&state.event_bus, "warden-review")
}

/// Build event stream routes
pub fn event_routes() -> Router<AppState> {
    Router::new().route("/api/events", get(event_stream))
}
