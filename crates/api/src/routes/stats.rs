//! Introspection endpoint for dashboards

use axum::{extract::State, Json};
use huddle_coordination::ResourceStats;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: usize,
    pub resources: Vec<ResourceStats>,
    pub sweep_interval_secs: u64,
    pub presence_staleness_secs: u64,
}

/// Per-resource subscriber, presence, typing and lock numbers
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let snapshot = state.coordinator.stats().await;

    Json(StatsResponse {
        connections: snapshot.connections,
        resources: snapshot.resources,
        sweep_interval_secs: state.config.sweep_interval.as_secs(),
        presence_staleness_secs: state.config.presence_staleness.as_secs(),
    })
}
