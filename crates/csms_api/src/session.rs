use axum::{
    Json,
    extract::{Path, State},
};
use csms_core::{ChargingSession, SessionError};

use crate::{ApiError, AppState};

/// Get a charging session by transaction id
pub async fn get_session(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> Result<Json<ChargingSession>, ApiError> {
    state
        .engine
        .store()
        .session(&transaction_id)
        .map(Json)
        .ok_or_else(|| SessionError::TransactionNotFound { transaction_id }.into())
}

#[cfg(test)]
mod tests {
    use crate::create_app;
    use crate::test_support::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use chrono::Utc;
    use csms_core::{StartRequest, StateMachine, StopReason};
    use tower::util::ServiceExt;

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_get_session() {
        let engine = test_engine();
        StateMachine::new(engine.store().clone())
            .on_start_session(
                "S2",
                StartRequest {
                    connector_idx: 1,
                    transaction_id: "T7".into(),
                    meter_start: 1200,
                    user_tag: None,
                    timestamp: Utc::now(),
                },
            )
            .unwrap();
        let app = create_app(engine);

        let response = app.oneshot(get("/sessions/T7")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let session = body_json(response).await;
        assert_eq!(session["transactionId"], "T7");
        assert_eq!(session["connectorId"]["stationId"], "S2");
        assert_eq!(session["meterStart"], 1200);
        assert_eq!(session["status"], "Active");
    }

    #[tokio::test]
    async fn test_completed_session_stays_readable() {
        let engine = test_engine();
        let machine = StateMachine::new(engine.store().clone());
        machine
            .on_start_session(
                "S1",
                StartRequest {
                    connector_idx: 1,
                    transaction_id: "T8".into(),
                    meter_start: 0,
                    user_tag: None,
                    timestamp: Utc::now(),
                },
            )
            .unwrap();
        machine
            .on_stop_session("S1", "T8", 400, StopReason::Local, Utc::now())
            .unwrap();
        let app = create_app(engine);

        let response = app.oneshot(get("/sessions/T8")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let session = body_json(response).await;
        assert_eq!(session["status"], "Completed");
        assert_eq!(session["energy"], 400);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let app = create_app(test_engine());

        let response = app.oneshot(get("/sessions/T404")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
