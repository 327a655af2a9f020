//! Monitoring API endpoints

use crate::api::server::AppState;
use crate::db::PositionStore;
use crate::services::{DetailedStatus, GuardStats, StartOutcome};
use crate::types::{Position, PositionId};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct StartMonitoringResponse {
    pub position_id: PositionId,
    pub outcome: StartOutcome,
}

pub async fn get_stats(State(state): State<AppState>) -> Json<GuardStats> {
    Json(state.guard.get_stats().await)
}

pub async fn get_status(State(state): State<AppState>) -> Json<DetailedStatus> {
    Json(state.guard.get_detailed_status().await)
}

/// Position row including any protection warning
pub async fn get_position(
    State(state): State<AppState>,
    Path(id): Path<PositionId>,
) -> Result<Json<Position>, (StatusCode, Json<ErrorResponse>)> {
    state
        .db
        .get_position(id)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!("Database error: {}", e),
                }),
            )
        })?
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("Position {} not found", id),
                }),
            )
        })
}

pub async fn start_monitoring(
    State(state): State<AppState>,
    Path(id): Path<PositionId>,
) -> (StatusCode, Json<StartMonitoringResponse>) {
    let outcome = state.guard.start_monitoring(id).await;
    let status = match outcome {
        StartOutcome::Watching | StartOutcome::Unprotected => StatusCode::OK,
        StartOutcome::NotFound => StatusCode::NOT_FOUND,
        StartOutcome::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        Json(StartMonitoringResponse {
            position_id: id,
            outcome,
        }),
    )
}

pub async fn stop_monitoring(State(state): State<AppState>, Path(id): Path<PositionId>) -> StatusCode {
    state.guard.stop_monitoring(id).await;
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use crate::api::{create_app, AppState};
    use crate::db::{Database, NewPosition};
    use crate::services::execution_queue::tests::FakePlacer;
    use crate::services::GuardCoordinator;
    use crate::types::{AccountType, PositionSide};
    use crate::Config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<GuardCoordinator>, i64) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let portfolio = db.create_portfolio(None, "test").await.unwrap();
        let id = db
            .create_position(&NewPosition {
                portfolio_id: portfolio,
                symbol: "BTCUSDT".to_string(),
                side: PositionSide::Long,
                account_type: AccountType::Spot,
                quantity: dec!(1),
                entry_price: dec!(100),
                stop_loss: Some(dec!(90)),
                take_profit: None,
            })
            .await
            .unwrap();

        let config = Config {
            market_stream_url: "ws://127.0.0.1:1".to_string(),
            ..Config::default()
        };
        let guard = Arc::new(GuardCoordinator::new(
            db.clone(),
            Arc::new(FakePlacer::default()),
            config,
        ));
        let app = create_app(AppState {
            db,
            guard: guard.clone(),
        });
        (app, guard, id)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stats_before_initialize() {
        let (app, _, _) = app().await;
        let response = app
            .oneshot(Request::builder().uri("/api/monitor/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["initialized"], false);
    }

    #[tokio::test]
    async fn test_start_and_stop_monitoring() {
        let (app, guard, id) = app().await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/monitor/positions/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["outcome"], "watching");

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/monitor/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["initialized"], true);
        assert_eq!(json["monitor"]["monitored_positions"], 1);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/monitor/positions/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(guard.get_stats().await.monitor.unwrap().monitored_positions, 0);

        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_position() {
        let (app, guard, _) = app().await;
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/monitor/positions/999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::builder().uri("/api/positions/999").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        guard.shutdown().await;
    }
}
