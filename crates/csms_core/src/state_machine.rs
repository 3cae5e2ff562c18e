use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::ocpp::ChargePointErrorCode;
use crate::{
    ChargePointStatus, ChargingSession, ConnectorId, LifecycleEventType, SessionError,
    SessionLifecycleEvent, SessionStatus, SessionStore, StopReason,
};

/// What an accepted transition asks of the rest of the system.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Effects {
    pub lifecycle: Vec<SessionLifecycleEvent>,
    /// Group whose allocation must be recomputed.
    pub reallocate: Option<uuid::Uuid>,
}

impl Effects {
    fn lifecycle(
        event_type: LifecycleEventType,
        session: &ChargingSession,
        group: Option<uuid::Uuid>,
        at: DateTime<Utc>,
    ) -> Self {
        Effects {
            lifecycle: vec![SessionLifecycleEvent::from_session(event_type, session, at)],
            reallocate: group,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOpen {
    Created(ChargingSession),
    /// The same transaction was already running on this connector.
    Existing(ChargingSession),
}

impl SessionOpen {
    pub fn session(&self) -> &ChargingSession {
        match self {
            SessionOpen::Created(session) | SessionOpen::Existing(session) => session,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StationInfo {
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub connector_idx: u32,
    pub transaction_id: String,
    pub meter_start: u64,
    pub user_tag: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Interprets station messages against the session store.
///
/// Every operation either applies completely or leaves the store untouched.
#[derive(Debug, Clone)]
pub struct StateMachine {
    store: Arc<SessionStore>,
}

impl StateMachine {
    pub fn new(store: Arc<SessionStore>) -> Self {
        StateMachine { store }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    fn require_station(&self, station_id: &str) -> Result<(), SessionError> {
        if self.store.contains_station(station_id) {
            Ok(())
        } else {
            Err(SessionError::StationNotFound {
                station_id: station_id.to_string(),
            })
        }
    }

    pub fn on_boot(
        &self,
        station_id: &str,
        info: StationInfo,
        now: DateTime<Utc>,
    ) -> Result<ChargePointStatus, SessionError> {
        self.store.update_station(station_id, |station| {
            station.vendor = Some(info.vendor);
            station.model = Some(info.model);
            if info.serial_number.is_some() {
                station.serial_number = info.serial_number;
            }
            if info.firmware_version.is_some() {
                station.firmware_version = info.firmware_version;
            }
            station.last_heartbeat = Some(now);
            if matches!(
                station.status,
                ChargePointStatus::Pending | ChargePointStatus::Offline | ChargePointStatus::Unknown
            ) {
                station.status = ChargePointStatus::Available;
            }
        })?;
        let status = self.store.refresh_station_status(station_id)?;
        tracing::info!(station_id, %status, "Station booted");
        Ok(status)
    }

    pub fn on_heartbeat(&self, station_id: &str, now: DateTime<Utc>) -> Result<(), SessionError> {
        self.store
            .update_station(station_id, |station| station.last_heartbeat = Some(now))?;
        self.restore_online(station_id)
    }

    /// Bring an `Offline` station back once any message arrives from it.
    fn restore_online(&self, station_id: &str) -> Result<(), SessionError> {
        let restored = self.store.update_station(station_id, |station| {
            if station.status == ChargePointStatus::Offline {
                station.status = ChargePointStatus::Available;
                true
            } else {
                false
            }
        })?;
        if restored {
            let status = self.store.refresh_station_status(station_id)?;
            tracing::info!(station_id, %status, "Station back online");
        }
        Ok(())
    }

    /// The station stayed silent past its heartbeat timeout.
    pub fn on_heartbeat_timeout(
        &self,
        station_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Effects, SessionError> {
        self.store.update_station(station_id, |station| {
            station.status = ChargePointStatus::Offline;
        })?;
        tracing::warn!(station_id, "Heartbeat timeout, station offline");

        let mut effects = Effects::default();
        for session in self.store.active_sessions(station_id) {
            let ended = self.store.with_slot(&session.connector_id, |slot| {
                let Some(mut session) = slot
                    .active
                    .take_if(|s| s.transaction_id == session.transaction_id)
                else {
                    return Ok(None);
                };
                session.status = SessionStatus::Error;
                session.stopped_at = Some(now);
                self.store.archive(session.clone());
                Ok(Some(session))
            })?;
            if let Some(session) = ended {
                tracing::warn!(
                    station_id,
                    transaction_id = %session.transaction_id,
                    "Session ended in error"
                );
                effects.lifecycle.push(SessionLifecycleEvent::from_session(
                    LifecycleEventType::SessionEnded,
                    &session,
                    now,
                ));
            }
        }
        if !effects.lifecycle.is_empty() {
            effects.reallocate = self.store.group_of_station(station_id);
        }
        Ok(effects)
    }

    pub fn on_status_notification(
        &self,
        station_id: &str,
        connector_idx: u32,
        status: ChargePointStatus,
        error_code: ChargePointErrorCode,
        timestamp: DateTime<Utc>,
    ) -> Result<ChargePointStatus, SessionError> {
        self.require_station(station_id)?;
        self.restore_online(station_id)?;
        let next = if error_code != ChargePointErrorCode::NoError {
            ChargePointStatus::Faulted
        } else {
            status
        };

        if connector_idx == 0 {
            // The whole charge point
            if !next.is_connector_status() {
                return Err(SessionError::InvalidStatus {
                    connector_id: ConnectorId::new(station_id, 0),
                    from: ChargePointStatus::Unknown,
                    to: next,
                });
            }
            self.store
                .update_station(station_id, |station| station.status = next)?;
            tracing::info!(station_id, status = %next, "Station status");
            return Ok(next);
        }

        let connector_id = ConnectorId::new(station_id, connector_idx);
        self.store.with_slot(&connector_id, |slot| {
            let current = slot.connector.status;
            if !current.can_transition_to(next) {
                return Err(SessionError::InvalidStatus {
                    connector_id: connector_id.clone(),
                    from: current,
                    to: next,
                });
            }
            slot.connector.status = next;
            slot.connector.last_status_at = Some(timestamp);
            Ok(())
        })?;
        tracing::info!(connector_id = %connector_id, status = %next, ?error_code, "Connector status");
        self.store.refresh_station_status(station_id)
    }

    pub fn on_start_session(
        &self,
        station_id: &str,
        request: StartRequest,
    ) -> Result<(SessionOpen, Effects), SessionError> {
        let station = self
            .store
            .station(station_id)
            .ok_or_else(|| SessionError::StationNotFound {
                station_id: station_id.to_string(),
            })?;
        if !station.enabled {
            return Err(SessionError::StationDisabled {
                station_id: station_id.to_string(),
            });
        }
        self.restore_online(station_id)?;

        let connector_id = ConnectorId::new(station_id, request.connector_idx);
        let opened = self.store.with_slot(&connector_id, |slot| {
            if let Some(active) = &slot.active {
                if active.transaction_id == request.transaction_id {
                    return Ok(SessionOpen::Existing(active.clone()));
                }
                return Err(SessionError::ConnectorAlreadyInUse {
                    connector_id: connector_id.clone(),
                    existing: active.transaction_id.clone(),
                });
            }
            if !slot.connector.status.can_transition_to(ChargePointStatus::Charging) {
                return Err(SessionError::InvalidStatus {
                    connector_id: connector_id.clone(),
                    from: slot.connector.status,
                    to: ChargePointStatus::Charging,
                });
            }
            self.store
                .index_transaction(&request.transaction_id, &connector_id)?;

            let mut session = ChargingSession {
                transaction_id: request.transaction_id.clone(),
                connector_id: connector_id.clone(),
                user_tag: request.user_tag.clone(),
                started_at: request.timestamp,
                stopped_at: None,
                meter_start: request.meter_start,
                meter_last: request.meter_start,
                meter_stop: None,
                energy: 0,
                allocated_power: None,
                max_power: station.session_max_power(&slot.connector),
                min_power: slot.connector.min_power,
                priority: station.priority,
                status: SessionStatus::Pending,
                stop_reason: None,
            };
            tracing::debug!(transaction_id = %session.transaction_id, "Session pending");
            session.status = SessionStatus::Active;
            slot.connector.status = ChargePointStatus::Charging;
            slot.connector.last_status_at = Some(request.timestamp);
            slot.active = Some(session.clone());
            Ok(SessionOpen::Created(session))
        })?;

        if matches!(opened, SessionOpen::Existing(_)) {
            tracing::debug!(
                transaction_id = %request.transaction_id,
                "Start repeated for a running session"
            );
            return Ok((opened, Effects::default()));
        }
        let session = opened.session();
        self.store.refresh_station_status(station_id)?;
        tracing::info!(
            connector_id = %connector_id,
            transaction_id = %session.transaction_id,
            meter_start = session.meter_start,
            "Session started"
        );
        let effects = Effects::lifecycle(
            LifecycleEventType::SessionStarted,
            session,
            station.group_id,
            request.timestamp,
        );
        Ok((opened, effects))
    }

    fn locate_on_station(
        &self,
        station_id: &str,
        transaction_id: &str,
    ) -> Result<ConnectorId, SessionError> {
        self.store
            .locate(transaction_id)
            .filter(|connector_id| connector_id.station_id == station_id)
            .ok_or_else(|| SessionError::TransactionNotFound {
                transaction_id: transaction_id.to_string(),
            })
    }

    /// Record a meter reading. Readings below the last one are rejected and
    /// leave the session untouched.
    pub fn on_meter_values(
        &self,
        station_id: &str,
        transaction_id: &str,
        reading: u64,
        timestamp: DateTime<Utc>,
    ) -> Result<Effects, SessionError> {
        self.restore_online(station_id)?;
        let connector_id = self.locate_on_station(station_id, transaction_id)?;
        let session = self.store.with_slot(&connector_id, |slot| {
            let session = slot
                .active
                .as_mut()
                .filter(|s| s.transaction_id == transaction_id)
                .ok_or_else(|| SessionError::TransactionNotFound {
                    transaction_id: transaction_id.to_string(),
                })?;
            if reading < session.meter_last {
                return Err(SessionError::MeterRegression {
                    transaction_id: transaction_id.to_string(),
                    last: session.meter_last,
                    reading,
                });
            }
            session.meter_last = reading;
            session.energy = reading.saturating_sub(session.meter_start);
            Ok(session.clone())
        })?;
        tracing::debug!(transaction_id, reading, energy = session.energy, "Meter values");
        Ok(Effects::lifecycle(
            LifecycleEventType::SessionUpdated,
            &session,
            self.store.group_of_station(station_id),
            timestamp,
        ))
    }

    /// Close a session. Repeating the stop of a closed session returns it
    /// unchanged.
    pub fn on_stop_session(
        &self,
        station_id: &str,
        transaction_id: &str,
        meter_stop: u64,
        reason: StopReason,
        timestamp: DateTime<Utc>,
    ) -> Result<(ChargingSession, Effects), SessionError> {
        self.restore_online(station_id)?;
        let connector_id = match self.locate_on_station(station_id, transaction_id) {
            Ok(connector_id) => connector_id,
            Err(err) => {
                return match self.store.session(transaction_id) {
                    Some(closed)
                        if closed.status.is_terminal()
                            && closed.connector_id.station_id == station_id =>
                    {
                        tracing::debug!(transaction_id, "Stop repeated for a closed session");
                        Ok((closed, Effects::default()))
                    }
                    _ => Err(err),
                };
            }
        };

        let session = self.store.with_slot(&connector_id, |slot| {
            let last = slot
                .active
                .as_ref()
                .filter(|s| s.transaction_id == transaction_id)
                .map(|s| s.meter_last)
                .ok_or_else(|| SessionError::TransactionNotFound {
                    transaction_id: transaction_id.to_string(),
                })?;
            if meter_stop < last {
                return Err(SessionError::MeterRegression {
                    transaction_id: transaction_id.to_string(),
                    last,
                    reading: meter_stop,
                });
            }
            let Some(mut session) = slot.active.take() else {
                return Err(SessionError::TransactionNotFound {
                    transaction_id: transaction_id.to_string(),
                });
            };
            session.meter_last = meter_stop;
            session.meter_stop = Some(meter_stop);
            session.energy = meter_stop - session.meter_start;
            session.stopped_at = Some(timestamp);
            session.stop_reason = Some(reason);
            session.status = if reason.is_fault() {
                SessionStatus::Error
            } else {
                SessionStatus::Completed
            };
            // A fault reported during the session outlives it
            for next in [ChargePointStatus::Finishing, ChargePointStatus::Available] {
                if !slot.connector.status.can_transition_to(next) {
                    break;
                }
                slot.connector.status = next;
                slot.connector.last_status_at = Some(timestamp);
                tracing::debug!(connector_id = %connector_id, status = %next, "Connector status");
            }
            slot.override_limit = None;
            self.store.archive(session.clone());
            Ok(session)
        })?;
        self.store.refresh_station_status(station_id)?;
        tracing::info!(
            transaction_id,
            status = %session.status,
            energy = session.energy,
            ?reason,
            "Session stopped"
        );
        let effects = Effects::lifecycle(
            LifecycleEventType::SessionEnded,
            &session,
            self.store.group_of_station(station_id),
            timestamp,
        );
        Ok((session, effects))
    }
}
