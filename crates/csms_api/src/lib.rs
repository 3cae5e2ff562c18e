//! CSMS API Library
//!
//! HTTP surface of the charging station management core: the OCPP device
//! endpoint, read views over stations, sessions and groups, and manual
//! power limits.

mod group;
mod ocpp;
mod session;
mod station;

pub use ocpp::OCPP_PROTOCOL;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use csms_core::{ErrorKind, SessionError};
use csms_engine::{Engine, LimitError};
use serde::Serialize;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
}

/// Error answered by a handler, mapped to a status code by its kind.
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::ProtocolViolation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::DeliveryFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::AllocationFailure => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.message,
                kind: self.kind,
            }),
        )
            .into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        ApiError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<LimitError> for ApiError {
    fn from(err: LimitError) -> Self {
        ApiError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub stations: usize,
    pub connected: usize,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        stations: state.engine.store().station_ids().len(),
        connected: state.engine.channels().connected_stations().len(),
    })
}

/// Create the application router with all endpoints
pub fn create_app(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ocpp/{station_id}", get(ocpp::connect_station))
        .route("/stations/{station_id}", get(station::get_station))
        .route(
            "/stations/{station_id}/connectors/{connector_idx}/limit",
            post(station::set_limit),
        )
        .route("/sessions/{transaction_id}", get(session::get_session))
        .route("/groups/{group_id}", get(group::get_group))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}
