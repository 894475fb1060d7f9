use axum::{Json, extract::State as AxumState, response::IntoResponse};
use serde_json::json;
use tracing::warn;

use crate::SharedState;

pub async fn root() -> &'static str {
    "autodeploy"
}

/// Returns server uptime, in-flight deployments and registered target count
pub async fn status(AxumState(state): AxumState<SharedState>) -> impl IntoResponse {
    let total_targets = state.store.count_targets().await.unwrap_or_else(|e| {
        warn!("Failed to count deployment targets: {}", e);
        0
    });
    let in_flight = state.receiver.in_flight();

    Json(json!({
        "server": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": state.started_at,
            "uptime_seconds": state.start_time.elapsed().as_secs(),
        },
        "deployments": {
            "in_flight": in_flight,
            "in_flight_count": in_flight.len(),
        },
        "config": {
            "total_targets": total_targets,
            "dry_run": state.config.deploy.dry_run,
        }
    }))
}
