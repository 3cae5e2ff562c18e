use std::time::Duration;

use axum::{
    Json,
    extract::{Path, State},
};
use csms_core::{
    AdjustmentReason, ChargingSession, ConnectorId, PowerDistributionEvent, SessionError, Station,
};
use serde::{Deserialize, Serialize};

use crate::{ApiError, AppState};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationView {
    #[serde(flatten)]
    pub station: Station,
    pub connected: bool,
    pub delivery_failures: u32,
    pub sessions: Vec<ChargingSession>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLimitRequest {
    pub limit: u32,
    /// Makes the limit temporary; it pins the session until it lapses.
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default = "manual")]
    pub reason: AdjustmentReason,
}

fn manual() -> AdjustmentReason {
    AdjustmentReason::Manual
}

/// Get a station with its connection state and active sessions
pub async fn get_station(
    State(state): State<AppState>,
    Path(station_id): Path<String>,
) -> Result<Json<StationView>, ApiError> {
    let store = state.engine.store();
    let station = store
        .station(&station_id)
        .ok_or_else(|| SessionError::StationNotFound {
            station_id: station_id.clone(),
        })?;
    Ok(Json(StationView {
        connected: state.engine.channels().is_connected(&station_id),
        delivery_failures: store.delivery_failures(&station_id).unwrap_or(0),
        sessions: store.active_sessions(&station_id),
        station,
    }))
}

/// Send a manual power limit to a connector
pub async fn set_limit(
    State(state): State<AppState>,
    Path((station_id, connector_idx)): Path<(String, u32)>,
    Json(request): Json<SetLimitRequest>,
) -> Result<Json<PowerDistributionEvent>, ApiError> {
    tracing::info!(
        %station_id,
        connector_idx,
        limit = request.limit,
        "Manual limit requested"
    );
    let event = state
        .engine
        .set_limit(
            &ConnectorId::new(station_id, connector_idx),
            request.limit,
            request.duration_secs.map(Duration::from_secs),
            request.reason,
        )
        .await?;
    Ok(Json(event))
}
