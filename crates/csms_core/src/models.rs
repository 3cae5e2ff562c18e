use std::fmt;

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Minimum power a connector can be throttled to before the vehicle stops
/// charging (6 A on a single 230 V phase).
pub const DEFAULT_MIN_POWER: u32 = 1_380;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorId {
    pub station_id: String,
    pub idx: u32,
}

impl ConnectorId {
    pub fn new(station_id: impl Into<String>, idx: u32) -> Self {
        ConnectorId {
            station_id: station_id.into(),
            idx,
        }
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.station_id, self.idx)
    }
}

/// Status shared by stations and connectors.
///
/// Connectors only ever report the OCPP connector subset; `Occupied`,
/// `Offline`, `Pending` and `Unknown` are station-level states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
pub enum ChargePointStatus {
    Available,
    Occupied,
    Unavailable,
    Offline,
    Faulted,
    Reserved,
    Preparing,
    Charging,
    #[serde(rename = "SuspendedEV")]
    SuspendedByVehicle,
    #[serde(rename = "SuspendedEVSE")]
    SuspendedByStation,
    Finishing,
    Pending,
    #[default]
    Unknown,
}

impl ChargePointStatus {
    /// Whether a station may report this status for one of its connectors.
    pub fn is_connector_status(self) -> bool {
        !matches!(
            self,
            ChargePointStatus::Occupied
                | ChargePointStatus::Offline
                | ChargePointStatus::Pending
                | ChargePointStatus::Unknown
        )
    }

    /// Statuses that take a connector out of `Faulted`.
    pub fn is_recovery(self) -> bool {
        matches!(
            self,
            ChargePointStatus::Available | ChargePointStatus::Unavailable
        )
    }

    /// Connector transition rule: anything may fault, a faulted connector
    /// only leaves through an explicit recovery status.
    pub fn can_transition_to(self, next: ChargePointStatus) -> bool {
        if !next.is_connector_status() {
            return false;
        }
        match self {
            ChargePointStatus::Faulted => next == ChargePointStatus::Faulted || next.is_recovery(),
            _ => true,
        }
    }
}

impl fmt::Display for ChargePointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Derive a station status from its connectors, most significant first.
pub fn derive_station_status(connectors: &[Connector]) -> ChargePointStatus {
    const PRECEDENCE: [ChargePointStatus; 9] = [
        ChargePointStatus::Faulted,
        ChargePointStatus::Charging,
        ChargePointStatus::SuspendedByVehicle,
        ChargePointStatus::SuspendedByStation,
        ChargePointStatus::Preparing,
        ChargePointStatus::Finishing,
        ChargePointStatus::Reserved,
        ChargePointStatus::Available,
        ChargePointStatus::Unavailable,
    ];
    PRECEDENCE
        .into_iter()
        .find(|status| connectors.iter().any(|c| c.status == *status))
        .unwrap_or(ChargePointStatus::Unknown)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorType {
    Type1,
    #[default]
    Type2,
    Ccs1,
    Ccs2,
    Chademo,
    Tesla,
    GbT,
    Nacs,
    Schuko,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerType {
    Ac1Phase,
    #[default]
    Ac3Phase,
    Dc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// Power values are whole watts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    pub idx: u32,
    #[serde(default)]
    pub connector_type: ConnectorType,
    #[serde(default)]
    pub power_type: PowerType,
    #[serde(default)]
    pub max_voltage: Option<u32>,
    #[serde(default)]
    pub max_amperage: Option<u32>,
    pub max_power: u32,
    #[serde(default = "default_min_power")]
    pub min_power: u32,
    #[serde(default)]
    pub status: ChargePointStatus,
    #[serde(default)]
    pub last_status_at: Option<DateTime<Utc>>,
}

fn default_min_power() -> u32 {
    DEFAULT_MIN_POWER
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub station_id: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub location: Option<GeoLocation>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub group_id: Option<uuid::Uuid>,
    /// Higher value wins under priority-based allocation.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub smart_charging_enabled: bool,
    /// Station-wide ceiling shared by all connectors, if any.
    #[serde(default)]
    pub max_power: Option<u32>,
    #[serde(default = "default_station_status")]
    pub status: ChargePointStatus,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub connectors: Vec<Connector>,
}

fn default_station_status() -> ChargePointStatus {
    ChargePointStatus::Pending
}

impl Station {
    pub fn connector(&self, idx: u32) -> Option<&Connector> {
        self.connectors.iter().find(|c| c.idx == idx)
    }

    /// The power a session on `connector` may draw at most.
    pub fn session_max_power(&self, connector: &Connector) -> u32 {
        self.max_power
            .map_or(connector.max_power, |max| max.min(connector.max_power))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum SessionStatus {
    Pending,
    Active,
    Paused,
    PowerReduced,
    Completed,
    Error,
    Terminated,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Error | SessionStatus::Terminated
        )
    }

    /// Sessions the allocation engine hands power to. `Paused` is included
    /// so that a session starved in one pass can be resumed in a later one.
    pub fn is_allocatable(self) -> bool {
        matches!(
            self,
            SessionStatus::Active | SessionStatus::PowerReduced | SessionStatus::Paused
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// OCPP 1.6 stop reasons.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub enum StopReason {
    EmergencyStop,
    #[serde(rename = "EVDisconnected")]
    EvDisconnected,
    HardReset,
    #[default]
    Local,
    Other,
    PowerLoss,
    Reboot,
    Remote,
    SoftReset,
    UnlockCommand,
    DeAuthorized,
}

impl StopReason {
    pub fn is_fault(self) -> bool {
        matches!(self, StopReason::EmergencyStop | StopReason::PowerLoss)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSession {
    pub transaction_id: String,
    pub connector_id: ConnectorId,
    pub user_tag: Option<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub meter_start: u64,
    pub meter_last: u64,
    pub meter_stop: Option<u64>,
    /// Meter delta since start, in meter units.
    pub energy: u64,
    /// Last limit granted by the allocation engine; `None` until the first pass.
    pub allocated_power: Option<u32>,
    pub max_power: u32,
    pub min_power: u32,
    pub priority: i32,
    pub status: SessionStatus,
    pub stop_reason: Option<StopReason>,
}

impl ChargingSession {
    pub fn duration_secs(&self) -> Option<i64> {
        self.stopped_at
            .map(|stopped| (stopped - self.started_at).num_seconds())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    FirstComeFirstServe,
    PriorityBased,
    Dynamic,
    TimeOfUse,
}

impl LoadBalancingStrategy {
    /// Strategies whose cap is scaled by the active profile's price tier.
    pub fn is_price_driven(self) -> bool {
        matches!(
            self,
            LoadBalancingStrategy::Dynamic | LoadBalancingStrategy::TimeOfUse
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChargingGroup {
    pub id: uuid::Uuid,
    pub name: String,
    pub max_power: u32,
    #[serde(default)]
    pub current_power: u32,
    #[serde(default = "default_true")]
    pub active: bool,
    pub strategy: LoadBalancingStrategy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceTier {
    OffPeak,
    Standard,
    Peak,
    Critical,
}

impl PriceTier {
    /// Share of the group maximum usable while this tier is in force.
    pub fn cap_percent(self) -> u32 {
        match self {
            PriceTier::OffPeak => 100,
            PriceTier::Standard => 75,
            PriceTier::Peak => 50,
            PriceTier::Critical => 25,
        }
    }
}

/// A scheduled ceiling for a station or a group.
///
/// Windows are evaluated in UTC. A window whose end is before its start
/// wraps past midnight and belongs to the day it started on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PowerProfile {
    pub id: uuid::Uuid,
    #[serde(default)]
    pub station_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<uuid::Uuid>,
    pub days: Vec<Weekday>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub max_power: u32,
    #[serde(default)]
    pub min_power: Option<u32>,
    pub price_tier: PriceTier,
}

impl PowerProfile {
    pub fn applies_at(&self, at: DateTime<Utc>) -> bool {
        let time = NaiveTime::from_hms_opt(at.hour(), at.minute(), at.second())
            .unwrap_or(NaiveTime::MIN);
        let day = at.weekday();
        if self.start_time <= self.end_time {
            self.days.contains(&day) && time >= self.start_time && time < self.end_time
        } else if time >= self.start_time {
            self.days.contains(&day)
        } else {
            time < self.end_time && self.days.contains(&day.pred())
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentReason {
    Manual,
    LoadBalancing,
    Emergency,
    PriceTier,
    ScheduledProfile,
    Optimization,
}

/// A temporary limit pinned on a connector until `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LimitOverride {
    pub limit: u32,
    pub expires_at: DateTime<Utc>,
    pub reason: AdjustmentReason,
}

impl LimitOverride {
    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        at < self.expires_at
    }
}

/// Outbound power command, also published for audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PowerDistributionEvent {
    pub event_id: uuid::Uuid,
    pub station_id: String,
    /// `None` addresses the whole station.
    pub connector_idx: Option<u32>,
    pub power_limit: u32,
    pub reason: AdjustmentReason,
    pub temporary: bool,
    pub duration_secs: Option<u64>,
    pub transaction_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}
