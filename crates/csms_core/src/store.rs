use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::{
    ChargePointStatus, ChargingGroup, ChargingSession, Connector, ConnectorId, GroupSnapshot,
    LimitOverride, PowerProfile, SessionDemand, SessionError, SessionStatus, Station,
    derive_station_status,
};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Live state of one connector: the connector itself, the session running
/// on it and any temporary limit pinned on it.
#[derive(Debug, Clone)]
pub struct ConnectorSlot {
    pub connector: Connector,
    pub active: Option<ChargingSession>,
    pub override_limit: Option<LimitOverride>,
}

#[derive(Debug)]
struct StationRecord {
    /// Registered station; connector entries are the registration copy, live
    /// connector state is kept in the slots.
    station: Station,
    delivery_failures: u32,
}

/// Authoritative record of stations, connectors and sessions.
///
/// Readers never block each other and writers are serialized per connector.
/// Locks are always taken slot first, then the transaction index, then the
/// closed-session archive.
#[derive(Debug)]
pub struct SessionStore {
    stations: RwLock<HashMap<String, StationRecord>>,
    slots: RwLock<HashMap<ConnectorId, Arc<Mutex<ConnectorSlot>>>>,
    transactions: RwLock<HashMap<String, ConnectorId>>,
    closed: RwLock<HashMap<String, ChargingSession>>,
    groups: RwLock<HashMap<uuid::Uuid, ChargingGroup>>,
    profiles: RwLock<Vec<PowerProfile>>,
    lock_timeout: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        SessionStore::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl SessionStore {
    pub fn new(lock_timeout: Duration) -> Self {
        SessionStore {
            stations: RwLock::new(HashMap::new()),
            slots: RwLock::new(HashMap::new()),
            transactions: RwLock::new(HashMap::new()),
            closed: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            profiles: RwLock::new(Vec::new()),
            lock_timeout,
        }
    }

    pub fn register_station(&self, station: Station) {
        tracing::info!(station_id = %station.station_id, "Registering station");
        {
            let mut slots = self.slots.write();
            for connector in &station.connectors {
                slots
                    .entry(ConnectorId::new(&station.station_id, connector.idx))
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(ConnectorSlot {
                            connector: connector.clone(),
                            active: None,
                            override_limit: None,
                        }))
                    });
            }
        }
        self.stations.write().insert(
            station.station_id.clone(),
            StationRecord {
                station,
                delivery_failures: 0,
            },
        );
    }

    pub fn register_group(&self, group: ChargingGroup) {
        tracing::info!(group_id = %group.id, name = %group.name, "Registering charging group");
        self.groups.write().insert(group.id, group);
    }

    pub fn register_profile(&self, profile: PowerProfile) {
        self.profiles.write().push(profile);
    }

    pub fn contains_station(&self, station_id: &str) -> bool {
        self.stations.read().contains_key(station_id)
    }

    pub fn station_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.stations.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Station with its live connector state.
    pub fn station(&self, station_id: &str) -> Option<Station> {
        let mut station = self.stations.read().get(station_id)?.station.clone();
        station.connectors = self.connectors(station_id);
        Some(station)
    }

    /// Live connectors of a station, ordered by index.
    pub fn connectors(&self, station_id: &str) -> Vec<Connector> {
        let mut connectors: Vec<Connector> = self
            .station_slots(station_id)
            .into_iter()
            .filter_map(|(id, slot)| self.read_slot(&id, &slot, |s| s.connector.clone()))
            .collect();
        connectors.sort_by_key(|c| c.idx);
        connectors
    }

    fn read_slot<R>(
        &self,
        connector_id: &ConnectorId,
        slot: &Mutex<ConnectorSlot>,
        f: impl FnOnce(&ConnectorSlot) -> R,
    ) -> Option<R> {
        match slot.try_lock_for(self.lock_timeout) {
            Some(guard) => Some(f(&guard)),
            None => {
                tracing::warn!(connector_id = %connector_id, "Connector busy, left out of read");
                None
            }
        }
    }

    fn station_slots(&self, station_id: &str) -> Vec<(ConnectorId, Arc<Mutex<ConnectorSlot>>)> {
        self.slots
            .read()
            .iter()
            .filter(|(id, _)| id.station_id == station_id)
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect()
    }

    /// Mutate the station record.
    pub fn update_station<R>(
        &self,
        station_id: &str,
        f: impl FnOnce(&mut Station) -> R,
    ) -> Result<R, SessionError> {
        let mut stations = self.stations.write();
        let record = stations
            .get_mut(station_id)
            .ok_or_else(|| SessionError::StationNotFound {
                station_id: station_id.to_string(),
            })?;
        Ok(f(&mut record.station))
    }

    /// Recompute the station status from its connectors. An `Offline`
    /// station keeps its status until it is heard from again.
    pub fn refresh_station_status(&self, station_id: &str) -> Result<ChargePointStatus, SessionError> {
        let connectors = self.connectors(station_id);
        self.update_station(station_id, |station| {
            if station.status != ChargePointStatus::Offline {
                let derived = derive_station_status(&connectors);
                if derived != ChargePointStatus::Unknown {
                    station.status = derived;
                }
            }
            station.status
        })
    }

    pub fn record_delivery_failure(&self, station_id: &str) -> Result<u32, SessionError> {
        let mut stations = self.stations.write();
        let record = stations
            .get_mut(station_id)
            .ok_or_else(|| SessionError::StationNotFound {
                station_id: station_id.to_string(),
            })?;
        record.delivery_failures += 1;
        Ok(record.delivery_failures)
    }

    pub fn delivery_failures(&self, station_id: &str) -> Option<u32> {
        self.stations
            .read()
            .get(station_id)
            .map(|record| record.delivery_failures)
    }

    /// Run `f` with exclusive access to one connector.
    pub fn with_slot<R>(
        &self,
        connector_id: &ConnectorId,
        f: impl FnOnce(&mut ConnectorSlot) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        let slot = self
            .slots
            .read()
            .get(connector_id)
            .cloned()
            .ok_or_else(|| SessionError::ConnectorNotFound {
                connector_id: connector_id.clone(),
            })?;
        let mut guard =
            slot.try_lock_for(self.lock_timeout)
                .ok_or_else(|| SessionError::LockTimeout {
                    connector_id: connector_id.clone(),
                })?;
        f(&mut guard)
    }

    /// Connector the transaction is running on, if it is still active.
    pub fn locate(&self, transaction_id: &str) -> Option<ConnectorId> {
        self.transactions.read().get(transaction_id).cloned()
    }

    /// Whether the transaction id was ever used, active or closed.
    pub fn is_known_transaction(&self, transaction_id: &str) -> bool {
        self.transactions.read().contains_key(transaction_id)
            || self.closed.read().contains_key(transaction_id)
    }

    /// Index a new session. Must be called while holding its slot.
    pub(crate) fn index_transaction(
        &self,
        transaction_id: &str,
        connector_id: &ConnectorId,
    ) -> Result<(), SessionError> {
        let mut transactions = self.transactions.write();
        if transactions.contains_key(transaction_id)
            || self.closed.read().contains_key(transaction_id)
        {
            return Err(SessionError::TransactionConflict {
                transaction_id: transaction_id.to_string(),
            });
        }
        transactions.insert(transaction_id.to_string(), connector_id.clone());
        Ok(())
    }

    /// Move a terminal session to the archive. Must be called while holding
    /// its slot.
    pub(crate) fn archive(&self, session: ChargingSession) {
        let mut transactions = self.transactions.write();
        transactions.remove(&session.transaction_id);
        self.closed
            .write()
            .insert(session.transaction_id.clone(), session);
    }

    pub fn session(&self, transaction_id: &str) -> Option<ChargingSession> {
        if let Some(connector_id) = self.locate(transaction_id) {
            let active = self
                .with_slot(&connector_id, |slot| {
                    Ok(slot
                        .active
                        .as_ref()
                        .filter(|s| s.transaction_id == transaction_id)
                        .cloned())
                })
                .ok()
                .flatten();
            if active.is_some() {
                return active;
            }
        }
        self.closed.read().get(transaction_id).cloned()
    }

    /// Non-terminal sessions of a station.
    pub fn active_sessions(&self, station_id: &str) -> Vec<ChargingSession> {
        let mut sessions: Vec<ChargingSession> = self
            .station_slots(station_id)
            .into_iter()
            .filter_map(|(id, slot)| self.read_slot(&id, &slot, |s| s.active.clone()).flatten())
            .collect();
        sessions.sort_by_key(|s| s.connector_id.idx);
        sessions
    }

    /// Non-terminal sessions of every station in a group.
    pub fn group_sessions(&self, group_id: uuid::Uuid) -> Vec<ChargingSession> {
        let members: Vec<String> = self
            .stations
            .read()
            .values()
            .filter(|record| record.station.group_id == Some(group_id))
            .map(|record| record.station.station_id.clone())
            .collect();
        let mut sessions: Vec<ChargingSession> = members
            .iter()
            .flat_map(|station_id| self.active_sessions(station_id))
            .collect();
        sessions.sort_by(|a, b| a.connector_id.cmp(&b.connector_id));
        sessions
    }

    pub fn groups(&self) -> Vec<ChargingGroup> {
        let mut groups: Vec<ChargingGroup> = self.groups.read().values().cloned().collect();
        groups.sort_by_key(|g| g.id);
        groups
    }

    pub fn group(&self, group_id: uuid::Uuid) -> Option<ChargingGroup> {
        self.groups.read().get(&group_id).cloned()
    }

    pub fn group_of_station(&self, station_id: &str) -> Option<uuid::Uuid> {
        self.stations
            .read()
            .get(station_id)
            .and_then(|record| record.station.group_id)
    }

    pub fn set_group_current_power(
        &self,
        group_id: uuid::Uuid,
        current_power: u32,
    ) -> Result<(), SessionError> {
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(&group_id)
            .ok_or(SessionError::GroupNotFound { group_id })?;
        group.current_power = current_power;
        Ok(())
    }

    pub fn profiles(&self) -> Vec<PowerProfile> {
        self.profiles.read().clone()
    }

    /// Copy out what an allocation pass needs for one group.
    ///
    /// Expired overrides are dropped on the way.
    pub fn group_snapshot(
        &self,
        group_id: uuid::Uuid,
        now: DateTime<Utc>,
    ) -> Result<GroupSnapshot, SessionError> {
        let group = self
            .group(group_id)
            .ok_or(SessionError::GroupNotFound { group_id })?;

        let members: Vec<Station> = self
            .stations
            .read()
            .values()
            .filter(|record| record.station.group_id == Some(group_id))
            .map(|record| record.station.clone())
            .collect();

        let mut sessions = Vec::new();
        let mut fixed_load = 0u32;
        for station in &members {
            if !station.smart_charging_enabled {
                let station_draw: u32 = self
                    .connectors(&station.station_id)
                    .iter()
                    .filter(|c| c.status == ChargePointStatus::Charging)
                    .map(|c| station.session_max_power(c))
                    .sum();
                fixed_load = fixed_load.saturating_add(station_draw);
                continue;
            }
            for (connector_id, _) in self.station_slots(&station.station_id) {
                let demand = self.with_slot(&connector_id, |slot| {
                    if slot
                        .override_limit
                        .as_ref()
                        .is_some_and(|o| !o.is_active(now))
                    {
                        tracing::info!(connector_id = %connector_id, "Temporary limit expired");
                        slot.override_limit = None;
                    }
                    Ok(slot.active.as_ref().map(|session| SessionDemand {
                        transaction_id: session.transaction_id.clone(),
                        connector_id: connector_id.clone(),
                        started_at: session.started_at,
                        priority: session.priority,
                        min_power: session.min_power,
                        max_power: session.max_power,
                        allocated_power: session.allocated_power,
                        status: session.status,
                        override_limit: slot.override_limit.clone(),
                    }))
                })?;
                sessions.extend(demand);
            }
        }

        let profiles = self
            .profiles
            .read()
            .iter()
            .filter(|p| {
                p.group_id == Some(group_id)
                    || p
                        .station_id
                        .as_ref()
                        .is_some_and(|id| members.iter().any(|s| &s.station_id == id))
            })
            .cloned()
            .collect();

        Ok(GroupSnapshot {
            group,
            sessions,
            fixed_load,
            profiles,
        })
    }

    /// Record a granted limit. Returns the previous allocation, or `None`
    /// when the session ended or moved on since the snapshot.
    pub fn apply_grant(
        &self,
        connector_id: &ConnectorId,
        transaction_id: &str,
        limit: u32,
        status: SessionStatus,
    ) -> Result<Option<Option<u32>>, SessionError> {
        self.with_slot(connector_id, |slot| {
            let Some(session) = slot
                .active
                .as_mut()
                .filter(|s| s.transaction_id == transaction_id && !s.status.is_terminal())
            else {
                return Ok(None);
            };
            let previous = session.allocated_power;
            session.allocated_power = Some(limit);
            session.status = status;
            Ok(Some(previous))
        })
    }

    /// Undo a grant the station never acknowledged.
    pub fn revert_grant(
        &self,
        connector_id: &ConnectorId,
        transaction_id: &str,
        previous: Option<u32>,
    ) -> Result<(), SessionError> {
        self.with_slot(connector_id, |slot| {
            if let Some(session) = slot
                .active
                .as_mut()
                .filter(|s| s.transaction_id == transaction_id)
            {
                session.allocated_power = previous;
            }
            Ok(())
        })
    }

    pub fn set_override(
        &self,
        connector_id: &ConnectorId,
        override_limit: Option<LimitOverride>,
    ) -> Result<(), SessionError> {
        self.with_slot(connector_id, |slot| {
            slot.override_limit = override_limit;
            Ok(())
        })
    }
}
