//! Lifecycle endpoint

use axum::{extract::State, http::StatusCode};
use tracing::warn;

use crate::api::state::ApiState;
use crate::lifecycle::ShutdownTrigger;

/// POST /-/quit
///
/// Requests a graceful shutdown and returns without waiting for it.
pub async fn quit(State(state): State<ApiState>) -> (StatusCode, &'static str) {
    warn!("received termination request via web service, exiting gracefully...");
    state.shutdown.trigger(ShutdownTrigger::Quit);

    (StatusCode::ACCEPTED, "Requesting termination... Goodbye!")
}
