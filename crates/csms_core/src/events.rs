use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChargingSession, SessionStatus, StopReason};

pub const SESSION_LIFECYCLE_TOPIC: &str = "session-lifecycle-events";
pub const POWER_DISTRIBUTION_TOPIC: &str = "power-distribution-events";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleEventType {
    SessionStarted,
    SessionUpdated,
    SessionEnded,
}

/// A session fact handed to billing and reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionLifecycleEvent {
    pub event_id: uuid::Uuid,
    pub event_type: LifecycleEventType,
    pub transaction_id: String,
    pub station_id: String,
    pub connector_idx: u32,
    pub user_tag: Option<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub meter_start: u64,
    pub energy: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub timestamp: DateTime<Utc>,
}

impl SessionLifecycleEvent {
    pub fn from_session(
        event_type: LifecycleEventType,
        session: &ChargingSession,
        timestamp: DateTime<Utc>,
    ) -> Self {
        SessionLifecycleEvent {
            event_id: uuid::Uuid::new_v4(),
            event_type,
            transaction_id: session.transaction_id.clone(),
            station_id: session.connector_id.station_id.clone(),
            connector_idx: session.connector_id.idx,
            user_tag: session.user_tag.clone(),
            status: session.status,
            started_at: session.started_at,
            stopped_at: session.stopped_at,
            meter_start: session.meter_start,
            energy: session.energy,
            duration_secs: session.duration_secs(),
            stop_reason: session.stop_reason,
            timestamp,
        }
    }

    /// Records are keyed by station.
    pub fn key(&self) -> &str {
        &self.station_id
    }
}
