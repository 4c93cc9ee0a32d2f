//! HTTP routes

pub mod activity;
pub mod health;
pub mod stats;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{state::AppState, websocket::ws_handler};

/// Create all routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness));

    // Introspection and domain-layer ingestion
    let api_routes = Router::new()
        .route("/stats", get(stats::stats))
        .route("/activity", post(activity::publish_activity));

    // Identity is passed pre-validated in the query string
    let websocket_routes = Router::new().route("/ws", get(ws_handler));

    Router::new()
        .merge(health_routes)
        .merge(api_routes)
        .merge(websocket_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
        response::Response,
    };
    use huddle_coordination::{Coordinator, CoordinatorConfig, ServerEvent};
    use huddle_shared::{Actor, ResourceKey};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::config::{Config, LogFormat};

    fn test_config() -> Config {
        let coordination = CoordinatorConfig::default();
        Config {
            bind_address: "127.0.0.1:0".to_string(),
            sweep_interval: coordination.sweep_interval,
            presence_staleness: coordination.presence_staleness,
            default_lock_ttl: coordination.default_lock_ttl,
            max_lock_ttl: coordination.max_lock_ttl,
            log_filter: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }

    fn test_state() -> AppState {
        let config = test_config();
        AppState::new(Coordinator::new(config.coordinator_config()), config)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_version() {
        let response = create_router(test_state())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_health_after_shutdown() {
        let state = test_state();
        state.coordinator.shutdown().await;

        let response = create_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_activity_is_delivered_to_subscribers() {
        let state = test_state();
        let timeline = ResourceKey::new("client", "123").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection_id = state
            .coordinator
            .register(Actor::new("alice", "Alice"), tx)
            .await
            .unwrap();
        state.coordinator.subscribe(connection_id, &timeline).await.unwrap();
        while rx.try_recv().is_ok() {}

        let response = create_router(state)
            .oneshot(post_json(
                "/activity",
                serde_json::json!({
                    "resource": {"type": "client", "id": "123"},
                    "item_id": "note-9",
                    "kind": "updated",
                    "payload": {"body": "edited"}
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["delivered"], 1);
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::ActivityUpdated(_)));
    }

    #[tokio::test]
    async fn test_activity_rejects_malformed_resource() {
        let response = create_router(test_state())
            .oneshot(post_json(
                "/activity",
                serde_json::json!({
                    "resource": {"type": "", "id": "123"},
                    "item_id": "note-9",
                    "kind": "new"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_stats_lists_active_resources() {
        let state = test_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection_id = state
            .coordinator
            .register(Actor::new("alice", "Alice"), tx)
            .await
            .unwrap();
        let ticket = ResourceKey::new("ticket", "T1").unwrap();
        state.coordinator.join(connection_id, &ticket).await.unwrap();

        let response = create_router(state)
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["connections"], 1);
        assert_eq!(body["resources"][0]["resource"]["type"], "ticket");
        assert_eq!(body["resources"][0]["presence"], 1);
        assert_eq!(body["resources"][0]["lock"]["locked"], false);
    }
}
