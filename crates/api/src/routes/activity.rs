//! Activity ingestion
//!
//! The domain layer posts here after it has durably stored a mutation. The
//! event is re-broadcast to the resource's current subscribers and nothing
//! is retained.

use axum::{extract::rejection::JsonRejection, extract::State, http::StatusCode, Json};
use huddle_coordination::ActivityKind;
use huddle_shared::ResourceKey;
use serde::{Deserialize, Serialize};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PublishActivityRequest {
    pub resource: ResourceKey,
    pub item_id: String,
    pub kind: ActivityKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct PublishActivityResponse {
    pub delivered: usize,
}

pub async fn publish_activity(
    State(state): State<AppState>,
    request: Result<Json<PublishActivityRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<PublishActivityResponse>)> {
    let Json(request) = request?;

    let delivered = state
        .coordinator
        .publish_activity(&request.resource, request.item_id, request.kind, request.payload)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(PublishActivityResponse { delivered })))
}
