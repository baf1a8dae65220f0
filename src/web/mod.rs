pub mod sse;
pub mod ws;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tokio::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::{
    db::Database,
    hub::Hub,
    models::TouchEvent,
    state::StateController,
    stats::{ApiResponse, StatisticsSnapshot},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_error;

const DEFAULT_EVENT_LIMIT: u32 = 50;
const MAX_EVENT_LIMIT: u32 = 500;

/// Shared handler context. Everything in here is a cheap clone over an
/// `Arc`, so the router can hand a copy to every request.
#[derive(Clone)]
pub struct WebState {
    pub db: Database,
    pub controller: StateController,
    pub hub: Hub,
    pub heartbeat: Duration,
}

pub fn router(state: WebState) -> Router {
    // The dashboard is served from wherever is convenient (often another
    // host on the LAN), so the API accepts any origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/statistics", get(get_statistics))
        .route("/api/events", get(get_events))
        .route("/api/ws/statistics", get(ws::ws_handler))
        .route("/api/events/statistics", get(sse::sse_handler))
        .layer(cors)
        .with_state(state)
}

async fn get_statistics(
    State(state): State<WebState>,
) -> Json<ApiResponse<StatisticsSnapshot>> {
    match state.controller.snapshot(Utc::now()).await {
        Ok(snapshot) => Json(ApiResponse::ok(snapshot)),
        Err(err) => {
            log_error!("failed to assemble statistics snapshot: {err}");
            Json(ApiResponse::err("failed to read statistics"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

async fn get_events(
    State(state): State<WebState>,
    Query(query): Query<EventsQuery>,
) -> Json<ApiResponse<Vec<TouchEvent>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .min(MAX_EVENT_LIMIT);
    let offset = query.offset.unwrap_or(0);

    match state.db.recent_events(limit, offset).await {
        Ok(events) => Json(ApiResponse::ok(events)),
        Err(err) => {
            log_error!("failed to list touch events: {err}");
            Json(ApiResponse::err("failed to read touch events"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tempfile::tempdir;

    async fn test_state() -> (WebState, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("web.sqlite3")).unwrap();
        let hub = Hub::new(8);
        let config = AppConfig::default();
        let (controller, _led_rx) =
            StateController::new(db.clone(), hub.clone(), &config, Utc::now())
                .await
                .unwrap();

        (
            WebState {
                db,
                controller,
                hub,
                heartbeat: Duration::from_secs(30),
            },
            dir,
        )
    }

    #[tokio::test]
    async fn statistics_endpoint_reports_current_state() {
        let (state, _dir) = test_state().await;

        let Json(response) = get_statistics(State(state)).await;
        assert!(response.success);
        let snapshot = response.data.unwrap();
        assert_eq!(snapshot.total_count, 0);
        assert_eq!(snapshot.state, crate::models::EmotionalState::Sad);
    }

    #[tokio::test]
    async fn events_endpoint_applies_limit_and_offset() {
        let (state, _dir) = test_state().await;

        let base = Utc::now();
        for i in 0..5 {
            let at = base + chrono::Duration::seconds(i);
            state.db.record_touch_start(0, at).await.unwrap();
            state
                .db
                .record_touch_end(0, at + chrono::Duration::milliseconds(100))
                .await
                .unwrap();
        }

        let query = Query(EventsQuery {
            limit: Some(2),
            offset: Some(1),
        });
        let Json(response) = get_events(State(state), query).await;
        assert!(response.success);
        let events = response.data.unwrap();
        assert_eq!(events.len(), 2);
        // Newest first, offset skips the most recent one.
        assert_eq!(events[0].started_at, base + chrono::Duration::seconds(3));
    }

    #[tokio::test]
    async fn events_endpoint_caps_oversized_limits() {
        let (state, _dir) = test_state().await;

        let query = Query(EventsQuery {
            limit: Some(1_000_000),
            offset: None,
        });
        let Json(response) = get_events(State(state), query).await;
        assert!(response.success);
        assert!(response.data.unwrap().is_empty());
    }
}
