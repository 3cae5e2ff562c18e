use axum::{
    Json,
    extract::{Path, State},
};
use csms_core::{ChargingGroup, ConnectorId, SessionError, SessionStatus};
use serde::Serialize;
use uuid::Uuid;

use crate::{ApiError, AppState};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationView {
    pub transaction_id: String,
    pub connector_id: ConnectorId,
    pub allocated_power: Option<u32>,
    pub status: SessionStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    #[serde(flatten)]
    pub group: ChargingGroup,
    pub allocations: Vec<AllocationView>,
}

/// Get a group with the power currently granted to each of its sessions
pub async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<GroupView>, ApiError> {
    let store = state.engine.store();
    let group = store
        .group(group_id)
        .ok_or(SessionError::GroupNotFound { group_id })?;
    let allocations = store
        .group_sessions(group_id)
        .into_iter()
        .map(|session| AllocationView {
            transaction_id: session.transaction_id,
            connector_id: session.connector_id,
            allocated_power: session.allocated_power,
            status: session.status,
        })
        .collect();
    Ok(Json(GroupView { group, allocations }))
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
    use csms_core::{StartRequest, StateMachine};
    use tower::util::ServiceExt;

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_group_lists_member_sessions() {
        let engine = test_engine();
        let machine = StateMachine::new(engine.store().clone());
        for (station, tx) in [("S2", "T2"), ("S1", "T1")] {
            machine
                .on_start_session(
                    station,
                    StartRequest {
                        connector_idx: 1,
                        transaction_id: tx.into(),
                        meter_start: 0,
                        user_tag: None,
                        timestamp: Utc::now(),
                    },
                )
                .unwrap();
        }
        let app = create_app(engine);

        let response = app
            .oneshot(get(&format!("/groups/{GROUP}")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let view = body_json(response).await;
        assert_eq!(view["name"], "Depot");
        assert_eq!(view["maxPower"], 30_000);
        assert_eq!(view["strategy"], "ROUND_ROBIN");
        let allocations = view["allocations"].as_array().unwrap();
        assert_eq!(allocations.len(), 2);
        assert_eq!(allocations[0]["transactionId"], "T1");
        assert_eq!(allocations[1]["transactionId"], "T2");
        assert!(allocations[0]["allocatedPower"].is_null());
    }

    #[tokio::test]
    async fn test_unknown_group_is_not_found() {
        let app = create_app(test_engine());

        let response = app
            .oneshot(get(&format!("/groups/{}", uuid::Uuid::from_u128(7))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_group_id_is_rejected() {
        let app = create_app(test_engine());

        let response = app.oneshot(get("/groups/not-a-uuid")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
