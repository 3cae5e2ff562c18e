use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use csms_core::ocpp::{
    Call, ChargingProfile, ChargingProfileKind, ChargingProfilePurpose, ChargingProfileStatus,
    ChargingRateUnit, ChargingSchedule, ChargingSchedulePeriod, SetChargingProfileRequest,
    SetChargingProfileResponse,
};
use csms_core::{
    AdjustmentReason, AllocationError, ConnectorId, DEFAULT_EPSILON, ErrorKind, Grant,
    LimitOverride, LoadBalancingStrategy, PowerDistributionEvent, SessionError, SessionStatus,
    SessionStore, allocate,
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;

use crate::backoff::RetryPolicy;
use crate::channel::{ChannelManager, DeliveryError};
use crate::publisher::Publisher;

/// Charging profile ids are stable per connector so that a new limit
/// replaces the previous one on the station.
const PROFILE_ID_BASE: i32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationConfig {
    /// Minimum change in watts before a new limit is sent.
    pub epsilon: u32,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        AllocationConfig {
            epsilon: DEFAULT_EPSILON,
        }
    }
}

#[derive(Debug, Error)]
pub enum PassError {
    #[error(transparent)]
    Store(#[from] SessionError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("Allocation pass for group {group_id} timed out")]
    Timeout { group_id: uuid::Uuid },
}

impl PassError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PassError::Timeout { .. } => ErrorKind::Timeout,
            _ => ErrorKind::AllocationFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub group_id: uuid::Uuid,
    pub effective_cap: u32,
    pub total: u32,
    pub commands_sent: usize,
    pub delivery_failures: usize,
}

/// Runs allocation passes and delivers the resulting limits to stations.
pub struct AllocationRunner {
    store: Arc<SessionStore>,
    channels: Arc<ChannelManager>,
    publisher: Publisher,
    config: AllocationConfig,
    delivery: RetryPolicy,
    /// Last limit each running transaction acknowledged.
    acknowledged: Mutex<HashMap<String, u32>>,
}

/// Grants written to the store whose delivery has not settled yet.
///
/// A pass cut short by its timeout drops this with deliveries still in
/// flight; those grants are put back to their previous allocation and
/// counted as delivery failures, so the next pass sends them again.
struct UnsettledGrants<'a> {
    store: &'a SessionStore,
    grants: Mutex<HashMap<String, (ConnectorId, Option<u32>)>>,
}

impl<'a> UnsettledGrants<'a> {
    fn new(store: &'a SessionStore) -> Self {
        UnsettledGrants {
            store,
            grants: Mutex::new(HashMap::new()),
        }
    }

    fn track(&self, grant: &Grant, previous: Option<u32>) {
        self.grants.lock().insert(
            grant.transaction_id.clone(),
            (grant.connector_id.clone(), previous),
        );
    }

    fn settle(&self, transaction_id: &str) {
        self.grants.lock().remove(transaction_id);
    }
}

impl Drop for UnsettledGrants<'_> {
    fn drop(&mut self) {
        for (transaction_id, (connector_id, previous)) in self.grants.get_mut().drain() {
            tracing::warn!(
                connector_id = %connector_id,
                %transaction_id,
                "Pass cancelled before the limit was delivered"
            );
            if let Err(err) = self
                .store
                .revert_grant(&connector_id, &transaction_id, previous)
            {
                tracing::warn!(error = %err, "Could not revert grant");
            }
            if let Err(err) = self.store.record_delivery_failure(&connector_id.station_id) {
                tracing::warn!(error = %err, "Could not record delivery failure");
            }
        }
    }
}

/// Build the SetChargingProfile call for a power command.
pub fn charging_profile_call(event: &PowerDistributionEvent) -> Result<Call, DeliveryError> {
    let connector_id = event.connector_idx.unwrap_or(0);
    let purpose = match (&event.transaction_id, connector_id) {
        (_, 0) => ChargingProfilePurpose::ChargePointMaxProfile,
        (Some(_), _) => ChargingProfilePurpose::TxProfile,
        (None, _) => ChargingProfilePurpose::TxDefaultProfile,
    };
    let request = SetChargingProfileRequest {
        connector_id,
        cs_charging_profiles: ChargingProfile {
            charging_profile_id: PROFILE_ID_BASE + connector_id as i32,
            stack_level: if event.temporary { 1 } else { 0 },
            charging_profile_purpose: purpose,
            charging_profile_kind: ChargingProfileKind::Absolute,
            charging_schedule: ChargingSchedule {
                charging_rate_unit: ChargingRateUnit::W,
                charging_schedule_period: vec![ChargingSchedulePeriod {
                    start_period: 0,
                    limit: event.power_limit as f64,
                    number_phases: None,
                }],
                start_schedule: Some(event.timestamp),
                duration: event
                    .duration_secs
                    .map(|secs| i32::try_from(secs).unwrap_or(i32::MAX)),
                min_charging_rate: None,
            },
            valid_from: None,
            valid_to: None,
            transaction_id: event.transaction_id.clone(),
        },
    };
    Ok(Call::set_charging_profile(request)?)
}

fn reason_for(grant: &Grant, strategy: LoadBalancingStrategy) -> AdjustmentReason {
    if grant.pinned {
        AdjustmentReason::Manual
    } else if strategy.is_price_driven() {
        AdjustmentReason::PriceTier
    } else {
        AdjustmentReason::LoadBalancing
    }
}

impl AllocationRunner {
    pub fn new(
        store: Arc<SessionStore>,
        channels: Arc<ChannelManager>,
        publisher: Publisher,
        config: AllocationConfig,
        delivery: RetryPolicy,
    ) -> Self {
        AllocationRunner {
            store,
            channels,
            publisher,
            config,
            delivery,
            acknowledged: Mutex::new(HashMap::new()),
        }
    }

    /// One pass over one group: snapshot, plan, write back, deliver.
    ///
    /// A failure before the write back leaves the group at its previous
    /// allocation. A grant only stands once its station acknowledged it,
    /// including when the pass is dropped mid-delivery.
    pub async fn run_pass(&self, group_id: uuid::Uuid) -> Result<PassReport, PassError> {
        let now = Utc::now();
        let snapshot = self.store.group_snapshot(group_id, now)?;
        let plan = allocate(&snapshot, now)?;

        // Forget acknowledgements of transactions that are no longer running
        self.acknowledged
            .lock()
            .retain(|tx, _| self.store.locate(tx).is_some());

        let unsettled = UnsettledGrants::new(&self.store);
        let mut commands = Vec::new();
        for grant in &plan.grants {
            let Some(previous) = self.store.apply_grant(
                &grant.connector_id,
                &grant.transaction_id,
                grant.limit,
                grant.status,
            )?
            else {
                tracing::debug!(transaction_id = %grant.transaction_id, "Session ended during pass");
                continue;
            };
            if grant.needs_command(self.config.epsilon) {
                unsettled.track(grant, previous);
                commands.push((grant, previous));
            }
        }
        self.store.set_group_current_power(group_id, plan.total())?;

        let outcomes = join_all(commands.iter().map(|(grant, previous)| {
            let event = PowerDistributionEvent {
                event_id: uuid::Uuid::new_v4(),
                station_id: grant.connector_id.station_id.clone(),
                connector_idx: Some(grant.connector_id.idx),
                power_limit: grant.limit,
                reason: reason_for(grant, plan.strategy),
                temporary: false,
                duration_secs: None,
                transaction_id: Some(grant.transaction_id.clone()),
                timestamp: now,
            };
            self.deliver_grant(&unsettled, grant, *previous, event)
        }))
        .await;
        let delivery_failures = outcomes.iter().filter(|delivered| !**delivered).count();

        let report = PassReport {
            group_id,
            effective_cap: plan.effective_cap,
            total: plan.total(),
            commands_sent: commands.len() - delivery_failures,
            delivery_failures,
        };
        tracing::info!(
            group_id = %group_id,
            cap = report.effective_cap,
            total = report.total,
            commands = report.commands_sent,
            failures = report.delivery_failures,
            "Allocation pass complete"
        );
        Ok(report)
    }

    async fn deliver_grant(
        &self,
        unsettled: &UnsettledGrants<'_>,
        grant: &Grant,
        previous: Option<u32>,
        event: PowerDistributionEvent,
    ) -> bool {
        let outcome = self.deliver(&event).await;
        if outcome.is_ok() {
            unsettled.settle(&grant.transaction_id);
        }
        match outcome {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    connector_id = %grant.connector_id,
                    transaction_id = %grant.transaction_id,
                    limit = grant.limit,
                    error = %err,
                    "Power command not delivered"
                );
                if let Err(err) =
                    self.store
                        .revert_grant(&grant.connector_id, &grant.transaction_id, previous)
                {
                    tracing::warn!(error = %err, "Could not revert grant");
                }
                if let Ok(failures) = self
                    .store
                    .record_delivery_failure(&grant.connector_id.station_id)
                {
                    tracing::warn!(
                        station_id = %grant.connector_id.station_id,
                        failures,
                        "Station delivery failure"
                    );
                }
                unsettled.settle(&grant.transaction_id);
                false
            }
        }
    }

    /// Send a power command with retries. A limit the station already
    /// acknowledged for the same transaction is not sent again.
    pub async fn deliver(&self, event: &PowerDistributionEvent) -> Result<(), DeliveryError> {
        let ack_key = event.transaction_id.as_ref().filter(|_| !event.temporary);
        let acknowledged = ack_key
            .is_some_and(|tx| self.acknowledged.lock().get(tx) == Some(&event.power_limit));
        if acknowledged {
            tracing::debug!(transaction_id = ?ack_key, limit = event.power_limit, "Limit already acknowledged");
            return Ok(());
        }

        let station_id = event.station_id.as_str();
        self.delivery
            .run("SetChargingProfile", DeliveryError::is_transient, |_| async move {
                let call = charging_profile_call(event)?;
                let result = self.channels.call(station_id, call).await?;
                let response: SetChargingProfileResponse = result.parse_payload()?;
                match response.status {
                    ChargingProfileStatus::Accepted => Ok(()),
                    status => Err(DeliveryError::Rejected {
                        station_id: station_id.to_string(),
                        status: format!("{status:?}"),
                    }),
                }
            })
            .await?;

        if let Some(tx) = ack_key {
            self.acknowledged.lock().insert(tx.clone(), event.power_limit);
        }
        tracing::info!(
            station_id,
            connector_idx = ?event.connector_idx,
            limit = event.power_limit,
            reason = ?event.reason,
            "Power limit applied"
        );
        self.publisher.power_event(event);
        Ok(())
    }

    /// Apply a manual limit on a connector.
    ///
    /// A temporary limit pins the running session at `limit` until it
    /// expires; a persistent one is sent right away and stands until the
    /// next pass of the connector's group replaces it.
    pub async fn set_limit(
        &self,
        connector_id: &ConnectorId,
        limit: u32,
        duration: Option<Duration>,
        reason: AdjustmentReason,
    ) -> Result<PowerDistributionEvent, LimitError> {
        let now = Utc::now();
        let station = self
            .store
            .station(&connector_id.station_id)
            .ok_or_else(|| SessionError::StationNotFound {
                station_id: connector_id.station_id.clone(),
            })?;
        let connector = station
            .connector(connector_id.idx)
            .ok_or_else(|| SessionError::ConnectorNotFound {
                connector_id: connector_id.clone(),
            })?;
        let limit = limit.min(station.session_max_power(connector));
        let session = self
            .store
            .with_slot(connector_id, |slot| Ok(slot.active.clone()))?;

        if let Some(duration) = duration {
            let expires_at = chrono::Duration::from_std(duration)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.store.set_override(
                connector_id,
                Some(LimitOverride {
                    limit,
                    expires_at,
                    reason,
                }),
            )?;
        }

        let event = PowerDistributionEvent {
            event_id: uuid::Uuid::new_v4(),
            station_id: connector_id.station_id.clone(),
            connector_idx: Some(connector_id.idx),
            power_limit: limit,
            reason,
            temporary: duration.is_some(),
            duration_secs: duration.map(|d| d.as_secs()),
            transaction_id: session.as_ref().map(|s| s.transaction_id.clone()),
            timestamp: now,
        };
        tracing::info!(
            connector_id = %connector_id,
            limit,
            temporary = event.temporary,
            reason = ?reason,
            "Manual limit"
        );
        self.deliver(&event).await?;

        if let Some(session) = session.filter(|_| duration.is_none()) {
            let status = if limit == 0 {
                SessionStatus::Paused
            } else if limit < session.max_power {
                SessionStatus::PowerReduced
            } else {
                SessionStatus::Active
            };
            self.store
                .apply_grant(connector_id, &session.transaction_id, limit, status)?;
        }
        Ok(event)
    }
}

#[derive(Debug, Error)]
pub enum LimitError {
    #[error(transparent)]
    Store(#[from] SessionError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl LimitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LimitError::Store(err) => err.kind(),
            LimitError::Delivery(err) => err.kind(),
        }
    }
}
