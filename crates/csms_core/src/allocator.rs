use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    ChargingGroup, ConnectorId, ErrorKind, LimitOverride, LoadBalancingStrategy, PowerProfile,
    SessionStatus,
};

/// Default minimum change, in watts, before a new limit is sent to a station.
pub const DEFAULT_EPSILON: u32 = 100;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AllocationError {
    #[error("Charging group {group_id} is not active")]
    GroupInactive { group_id: uuid::Uuid },
    #[error("Plan for group {group_id} grants {total} W over a cap of {cap} W")]
    CapExceeded {
        group_id: uuid::Uuid,
        total: u32,
        cap: u32,
    },
}

impl AllocationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::AllocationFailure
    }
}

/// What one session asks of its group at the time of the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDemand {
    pub transaction_id: String,
    pub connector_id: ConnectorId,
    pub started_at: DateTime<Utc>,
    pub priority: i32,
    pub min_power: u32,
    pub max_power: u32,
    pub allocated_power: Option<u32>,
    pub status: SessionStatus,
    pub override_limit: Option<LimitOverride>,
}

/// Everything a pass needs, copied out of the store so that no lock is held
/// while the plan is computed.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub group: ChargingGroup,
    pub sessions: Vec<SessionDemand>,
    /// Power drawn by member stations that do not take part in smart charging.
    pub fixed_load: u32,
    /// Profiles scoped to the group or to one of its stations.
    pub profiles: Vec<PowerProfile>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub transaction_id: String,
    pub connector_id: ConnectorId,
    pub limit: u32,
    pub status: SessionStatus,
    pub previous: Option<u32>,
    /// The limit comes from a temporary override rather than the strategy.
    pub pinned: bool,
}

impl Grant {
    /// Whether the station must be told about this grant.
    pub fn needs_command(&self, epsilon: u32) -> bool {
        match self.previous {
            None => true,
            Some(previous) => self.limit.abs_diff(previous) > epsilon,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationPlan {
    pub group_id: uuid::Uuid,
    pub strategy: LoadBalancingStrategy,
    pub effective_cap: u32,
    pub grants: Vec<Grant>,
}

impl AllocationPlan {
    pub fn total(&self) -> u32 {
        self.grants.iter().map(|g| g.limit).sum()
    }

    /// Grants whose limit moved by more than `epsilon` since the last pass.
    pub fn changes(&self, epsilon: u32) -> impl Iterator<Item = &Grant> {
        self.grants.iter().filter(move |g| g.needs_command(epsilon))
    }
}

/// Per-session bounds once profiles have been applied.
#[derive(Debug, Clone)]
struct Bounds {
    idx: usize,
    min: u32,
    max: u32,
}

/// The most restrictive group-scoped profile in force at `now`.
fn group_profile<'a>(snapshot: &'a GroupSnapshot, now: DateTime<Utc>) -> Option<&'a PowerProfile> {
    snapshot
        .profiles
        .iter()
        .filter(|p| p.group_id == Some(snapshot.group.id) && p.station_id.is_none())
        .filter(|p| p.applies_at(now))
        .min_by_key(|p| p.max_power)
}

fn station_ceiling(snapshot: &GroupSnapshot, station_id: &str, now: DateTime<Utc>) -> Option<u32> {
    snapshot
        .profiles
        .iter()
        .filter(|p| p.station_id.as_deref() == Some(station_id))
        .filter(|p| p.applies_at(now))
        .map(|p| p.max_power)
        .min()
}

/// Power the strategy may hand out: the group maximum, lowered by the
/// active profile and its price tier, minus the fixed load.
pub fn effective_cap(snapshot: &GroupSnapshot, now: DateTime<Utc>) -> u32 {
    let group = &snapshot.group;
    let mut cap = group.max_power;
    if let Some(profile) = group_profile(snapshot, now) {
        cap = cap.min(profile.max_power);
        if group.strategy.is_price_driven() {
            let tier_cap =
                (group.max_power as u64 * profile.price_tier.cap_percent() as u64 / 100) as u32;
            cap = cap.min(tier_cap);
        }
    }
    cap.saturating_sub(snapshot.fixed_load)
}

fn grant_status(limit: u32, max: u32) -> SessionStatus {
    if limit == 0 {
        SessionStatus::Paused
    } else if limit < max {
        SessionStatus::PowerReduced
    } else {
        SessionStatus::Active
    }
}

/// Reserve minimums in order, then fill up in the same order. The first
/// session whose minimum does not fit is paused along with every session
/// ranked after it, so no one is served ahead of a session that outranks it.
fn allocate_ordered(bounds: &[Bounds], cap: u32, granted: &mut [u32]) {
    let mut remaining = cap;
    let mut served = Vec::with_capacity(bounds.len());
    for b in bounds {
        if b.min > remaining {
            break;
        }
        granted[b.idx] = b.min;
        remaining -= b.min;
        served.push(b);
    }
    for b in served {
        let extra = (b.max - granted[b.idx]).min(remaining);
        granted[b.idx] += extra;
        remaining -= extra;
        if remaining == 0 {
            break;
        }
    }
}

/// Equal split with water-filling. `bounds` is ordered oldest first; when
/// the minimums do not fit, the newest sessions are paused.
fn allocate_round_robin(bounds: &[Bounds], cap: u32, granted: &mut [u32]) {
    let mut served: Vec<&Bounds> = bounds.iter().collect();
    while served.iter().map(|b| b.min as u64).sum::<u64>() > cap as u64 {
        served.pop();
    }

    let mut remaining = cap;
    for b in &served {
        granted[b.idx] = b.min;
        remaining -= b.min;
    }

    loop {
        // Sessions which could take more power
        let hungry: Vec<&&Bounds> = served.iter().filter(|b| granted[b.idx] < b.max).collect();
        if remaining == 0 || hungry.is_empty() {
            break;
        }
        let fair_share = remaining / hungry.len() as u32;
        if fair_share == 0 {
            // Fewer watts left than sessions, oldest sessions get one each
            for b in hungry.into_iter().take(remaining as usize) {
                granted[b.idx] += 1;
            }
            break;
        }
        for b in hungry {
            let extra = fair_share.min(b.max - granted[b.idx]);
            granted[b.idx] += extra;
            remaining -= extra;
        }
    }
}

/// Compute a limit for every eligible session of the group.
///
/// Sessions under an active temporary override are served first at their
/// pinned limit (never above their maximum or the cap), the strategy then
/// shares what is left among the others.
pub fn allocate(
    snapshot: &GroupSnapshot,
    now: DateTime<Utc>,
) -> Result<AllocationPlan, AllocationError> {
    let group = &snapshot.group;
    if !group.active {
        return Err(AllocationError::GroupInactive { group_id: group.id });
    }

    let cap = effective_cap(snapshot, now);
    let floor = match group.strategy {
        LoadBalancingStrategy::TimeOfUse => {
            group_profile(snapshot, now).and_then(|profile| profile.min_power)
        }
        _ => None,
    };

    let sessions: Vec<&SessionDemand> = snapshot
        .sessions
        .iter()
        .filter(|s| s.status.is_allocatable())
        .collect();

    let mut maxima = Vec::with_capacity(sessions.len());
    let mut granted = vec![0u32; sessions.len()];
    let mut pinned = vec![false; sessions.len()];
    let mut remaining = cap;
    let mut bounds = Vec::new();

    for (idx, session) in sessions.iter().enumerate() {
        let max = station_ceiling(snapshot, &session.connector_id.station_id, now)
            .map_or(session.max_power, |ceiling| ceiling.min(session.max_power));
        maxima.push(max);

        if let Some(limit) = session
            .override_limit
            .as_ref()
            .filter(|o| o.is_active(now))
            .map(|o| o.limit)
        {
            let limit = limit.min(max).min(remaining);
            granted[idx] = limit;
            pinned[idx] = true;
            remaining -= limit;
            continue;
        }

        let min = floor.map_or(session.min_power, |floor| floor.max(session.min_power));
        // A session that cannot be served at its minimum stays paused
        if max == 0 || min > max {
            continue;
        }
        bounds.push(Bounds { idx, min, max });
    }

    match group.strategy {
        LoadBalancingStrategy::RoundRobin => {
            bounds.sort_by(|a, b| by_start(sessions[a.idx], sessions[b.idx]));
            allocate_round_robin(&bounds, remaining, &mut granted);
        }
        LoadBalancingStrategy::FirstComeFirstServe => {
            bounds.sort_by(|a, b| by_start(sessions[a.idx], sessions[b.idx]));
            allocate_ordered(&bounds, remaining, &mut granted);
        }
        LoadBalancingStrategy::PriorityBased
        | LoadBalancingStrategy::Dynamic
        | LoadBalancingStrategy::TimeOfUse => {
            bounds.sort_by(|a, b| {
                sessions[b.idx]
                    .priority
                    .cmp(&sessions[a.idx].priority)
                    .then_with(|| by_start(sessions[a.idx], sessions[b.idx]))
            });
            allocate_ordered(&bounds, remaining, &mut granted);
        }
    }

    let grants: Vec<Grant> = sessions
        .iter()
        .enumerate()
        .map(|(idx, session)| Grant {
            transaction_id: session.transaction_id.clone(),
            connector_id: session.connector_id.clone(),
            limit: granted[idx],
            status: grant_status(granted[idx], maxima[idx]),
            previous: session.allocated_power,
            pinned: pinned[idx],
        })
        .collect();

    let plan = AllocationPlan {
        group_id: group.id,
        strategy: group.strategy,
        effective_cap: cap,
        grants,
    };
    let total = plan.total();
    if total > cap {
        return Err(AllocationError::CapExceeded {
            group_id: group.id,
            total,
            cap,
        });
    }
    tracing::debug!(
        group_id = %group.id,
        strategy = ?group.strategy,
        cap,
        total,
        sessions = plan.grants.len(),
        "Computed allocation plan"
    );
    Ok(plan)
}

fn by_start(a: &SessionDemand, b: &SessionDemand) -> std::cmp::Ordering {
    a.started_at
        .cmp(&b.started_at)
        .then_with(|| a.transaction_id.cmp(&b.transaction_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AdjustmentReason, PriceTier, DEFAULT_MIN_POWER};
    use chrono::{Duration, NaiveTime, TimeZone, Weekday};

    fn now() -> DateTime<Utc> {
        // A Monday at noon
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    fn group(max_power: u32, strategy: LoadBalancingStrategy) -> ChargingGroup {
        ChargingGroup {
            id: uuid::Uuid::from_u128(7),
            name: "G".into(),
            max_power,
            current_power: 0,
            active: true,
            strategy,
        }
    }

    fn demand(tx: &str, station: &str, started_min: i64, max_power: u32) -> SessionDemand {
        SessionDemand {
            transaction_id: tx.into(),
            connector_id: ConnectorId::new(station, 1),
            started_at: now() - Duration::minutes(60 - started_min),
            priority: 0,
            min_power: DEFAULT_MIN_POWER,
            max_power,
            allocated_power: None,
            status: SessionStatus::Active,
            override_limit: None,
        }
    }

    fn snapshot(group: ChargingGroup, sessions: Vec<SessionDemand>) -> GroupSnapshot {
        GroupSnapshot {
            group,
            sessions,
            fixed_load: 0,
            profiles: vec![],
        }
    }

    fn group_profile(max_power: u32, tier: PriceTier, min_power: Option<u32>) -> PowerProfile {
        PowerProfile {
            id: uuid::Uuid::new_v4(),
            station_id: None,
            group_id: Some(uuid::Uuid::from_u128(7)),
            days: vec![Weekday::Mon],
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            max_power,
            min_power,
            price_tier: tier,
        }
    }

    fn assert_eq_allocated_power(plan: &AllocationPlan, tx: &str, allocated_power: u32) {
        assert_eq!(
            plan.grants
                .iter()
                .find(|g| g.transaction_id == tx)
                .expect("Could not find grant")
                .limit,
            allocated_power,
            "allocated power of {tx}"
        )
    }

    fn status_of(plan: &AllocationPlan, tx: &str) -> SessionStatus {
        plan.grants
            .iter()
            .find(|g| g.transaction_id == tx)
            .expect("Could not find grant")
            .status
    }

    #[test]
    /// Two 22 kW sessions in a 30 kW group split it evenly
    fn test_round_robin_equal_split() {
        let snap = snapshot(
            group(30_000, LoadBalancingStrategy::RoundRobin),
            vec![demand("T1", "S1", 0, 22_000), demand("T2", "S2", 5, 22_000)],
        );
        let plan = allocate(&snap, now()).unwrap();
        assert_eq_allocated_power(&plan, "T1", 15_000);
        assert_eq_allocated_power(&plan, "T2", 15_000);
        assert_eq!(status_of(&plan, "T1"), SessionStatus::PowerReduced);
        assert!(plan.total() <= 30_000);
    }

    #[test]
    /// Surplus from a session capped at its maximum goes to the others
    fn test_round_robin_water_filling() {
        let snap = snapshot(
            group(30_000, LoadBalancingStrategy::RoundRobin),
            vec![
                demand("T1", "S1", 0, 7_000),
                demand("T2", "S2", 1, 22_000),
                demand("T3", "S3", 2, 22_000),
            ],
        );
        let plan = allocate(&snap, now()).unwrap();
        assert_eq_allocated_power(&plan, "T1", 7_000);
        assert_eq!(status_of(&plan, "T1"), SessionStatus::Active);
        assert_eq_allocated_power(&plan, "T2", 11_500);
        assert_eq_allocated_power(&plan, "T3", 11_500);
    }

    #[test]
    /// Latest started sessions are paused when minimums do not fit
    fn test_round_robin_pauses_latest() {
        let snap = snapshot(
            group(3_000, LoadBalancingStrategy::RoundRobin),
            vec![
                demand("T3", "S3", 20, 22_000),
                demand("T1", "S1", 0, 22_000),
                demand("T2", "S2", 10, 22_000),
            ],
        );
        let plan = allocate(&snap, now()).unwrap();
        assert_eq_allocated_power(&plan, "T1", 1_500);
        assert_eq_allocated_power(&plan, "T2", 1_500);
        assert_eq_allocated_power(&plan, "T3", 0);
        assert_eq!(status_of(&plan, "T3"), SessionStatus::Paused);
    }

    #[test]
    /// Leftover watts smaller than the number of sessions still terminate
    fn test_round_robin_indivisible_remainder() {
        let snap = snapshot(
            group(10_001, LoadBalancingStrategy::RoundRobin),
            vec![
                demand("T1", "S1", 0, 22_000),
                demand("T2", "S2", 1, 22_000),
                demand("T3", "S3", 2, 22_000),
            ],
        );
        let plan = allocate(&snap, now()).unwrap();
        assert_eq!(plan.total(), 10_001);
        assert_eq_allocated_power(&plan, "T1", 3_334);
        assert_eq_allocated_power(&plan, "T2", 3_334);
        assert_eq_allocated_power(&plan, "T3", 3_333);
    }

    #[test]
    fn test_first_come_first_serve() {
        let snap = snapshot(
            group(30_000, LoadBalancingStrategy::FirstComeFirstServe),
            vec![demand("T2", "S2", 5, 22_000), demand("T1", "S1", 0, 22_000)],
        );
        let plan = allocate(&snap, now()).unwrap();
        assert_eq_allocated_power(&plan, "T1", 22_000);
        assert_eq_allocated_power(&plan, "T2", 8_000);
        assert_eq!(status_of(&plan, "T1"), SessionStatus::Active);
        assert_eq!(status_of(&plan, "T2"), SessionStatus::PowerReduced);
    }

    #[test]
    /// Minimums are reserved before anyone is topped up
    fn test_first_come_first_serve_reserves_minimums() {
        let snap = snapshot(
            group(23_000, LoadBalancingStrategy::FirstComeFirstServe),
            vec![demand("T1", "S1", 0, 22_000), demand("T2", "S2", 5, 22_000)],
        );
        let plan = allocate(&snap, now()).unwrap();
        assert_eq_allocated_power(&plan, "T2", DEFAULT_MIN_POWER);
        assert_eq_allocated_power(&plan, "T1", 23_000 - DEFAULT_MIN_POWER);
    }

    #[test]
    fn test_priority_based() {
        let mut low = demand("LOW", "S1", 0, 22_000);
        low.priority = 1;
        let mut high = demand("HIGH", "S2", 30, 22_000);
        high.priority = 5;
        let snap = snapshot(
            group(30_000, LoadBalancingStrategy::PriorityBased),
            vec![low, high],
        );
        let plan = allocate(&snap, now()).unwrap();
        assert_eq_allocated_power(&plan, "HIGH", 22_000);
        assert_eq_allocated_power(&plan, "LOW", 8_000);
    }

    #[test]
    /// A higher priority session that cannot get its minimum is not
    /// overtaken by a lower priority one with a smaller minimum
    fn test_priority_never_inverts_on_minimums() {
        let mut high = demand("HIGH", "S1", 0, 50_000);
        high.priority = 5;
        high.min_power = 5_000;
        let mut low = demand("LOW", "S2", 10, 22_000);
        low.priority = 1;
        let snap = snapshot(
            group(4_000, LoadBalancingStrategy::PriorityBased),
            vec![low, high],
        );
        let plan = allocate(&snap, now()).unwrap();
        assert_eq_allocated_power(&plan, "HIGH", 0);
        assert_eq_allocated_power(&plan, "LOW", 0);
        assert_eq!(status_of(&plan, "HIGH"), SessionStatus::Paused);
        assert_eq!(status_of(&plan, "LOW"), SessionStatus::Paused);

        // With room for the higher minimum both are served in rank order
        let mut snap = snap;
        snap.group.max_power = 8_000;
        let plan = allocate(&snap, now()).unwrap();
        assert_eq_allocated_power(&plan, "HIGH", 8_000 - DEFAULT_MIN_POWER);
        assert_eq_allocated_power(&plan, "LOW", DEFAULT_MIN_POWER);
    }

    #[test]
    /// An older session that does not fit holds back the newer ones
    fn test_first_come_first_serve_pauses_in_order() {
        let mut old = demand("T1", "S1", 0, 50_000);
        old.min_power = 6_000;
        let snap = snapshot(
            group(5_000, LoadBalancingStrategy::FirstComeFirstServe),
            vec![old, demand("T2", "S2", 5, 22_000)],
        );
        let plan = allocate(&snap, now()).unwrap();
        assert_eq!(plan.total(), 0);
        assert_eq!(status_of(&plan, "T2"), SessionStatus::Paused);
    }

    #[test]
    /// Equal priorities fall back to start order
    fn test_priority_ties_by_start_time() {
        let snap = snapshot(
            group(25_000, LoadBalancingStrategy::PriorityBased),
            vec![demand("LATE", "S2", 30, 22_000), demand("EARLY", "S1", 0, 22_000)],
        );
        let plan = allocate(&snap, now()).unwrap();
        assert_eq_allocated_power(&plan, "EARLY", 22_000);
        assert_eq_allocated_power(&plan, "LATE", 3_000);
    }

    #[test]
    /// A peak tier halves the group maximum
    fn test_time_of_use_tier_cap() {
        let mut snap = snapshot(
            group(40_000, LoadBalancingStrategy::TimeOfUse),
            vec![demand("T1", "S1", 0, 22_000), demand("T2", "S2", 5, 22_000)],
        );
        snap.profiles = vec![group_profile(40_000, PriceTier::Peak, None)];
        let plan = allocate(&snap, now()).unwrap();
        assert_eq!(plan.effective_cap, 20_000);
        assert_eq_allocated_power(&plan, "T1", 20_000 - DEFAULT_MIN_POWER);
        assert_eq_allocated_power(&plan, "T2", DEFAULT_MIN_POWER);
    }

    #[test]
    /// The profile floor raises every session's minimum
    fn test_time_of_use_floor() {
        let mut snap = snapshot(
            group(40_000, LoadBalancingStrategy::TimeOfUse),
            vec![demand("T1", "S1", 0, 22_000), demand("T2", "S2", 5, 22_000)],
        );
        snap.profiles = vec![group_profile(40_000, PriceTier::Critical, Some(4_000))];
        let plan = allocate(&snap, now()).unwrap();
        assert_eq!(plan.effective_cap, 10_000);
        assert_eq_allocated_power(&plan, "T1", 6_000);
        assert_eq_allocated_power(&plan, "T2", 4_000);
    }

    #[test]
    /// Without a profile in force the group maximum applies
    fn test_dynamic_without_profile() {
        let mut snap = snapshot(
            group(30_000, LoadBalancingStrategy::Dynamic),
            vec![demand("T1", "S1", 0, 22_000)],
        );
        let mut evening = group_profile(5_000, PriceTier::Critical, None);
        evening.start_time = NaiveTime::from_hms_opt(21, 0, 0).unwrap();
        evening.end_time = NaiveTime::from_hms_opt(23, 0, 0).unwrap();
        snap.profiles = vec![evening];
        let plan = allocate(&snap, now()).unwrap();
        assert_eq!(plan.effective_cap, 30_000);
        assert_eq_allocated_power(&plan, "T1", 22_000);
    }

    #[test]
    /// Profiles lower the cap for every strategy, tiers only for price driven ones
    fn test_round_robin_respects_profile_ceiling() {
        let mut snap = snapshot(
            group(30_000, LoadBalancingStrategy::RoundRobin),
            vec![demand("T1", "S1", 0, 22_000), demand("T2", "S2", 5, 22_000)],
        );
        snap.profiles = vec![group_profile(20_000, PriceTier::Critical, None)];
        let plan = allocate(&snap, now()).unwrap();
        assert_eq!(plan.effective_cap, 20_000);
        assert_eq_allocated_power(&plan, "T1", 10_000);
        assert_eq_allocated_power(&plan, "T2", 10_000);
    }

    #[test]
    fn test_station_profile_clips_session_max() {
        let mut snap = snapshot(
            group(30_000, LoadBalancingStrategy::RoundRobin),
            vec![demand("T1", "S1", 0, 22_000), demand("T2", "S2", 5, 22_000)],
        );
        let mut station_profile = group_profile(4_000, PriceTier::Standard, None);
        station_profile.group_id = None;
        station_profile.station_id = Some("S1".into());
        snap.profiles = vec![station_profile];
        let plan = allocate(&snap, now()).unwrap();
        assert_eq_allocated_power(&plan, "T1", 4_000);
        assert_eq!(status_of(&plan, "T1"), SessionStatus::Active);
        assert_eq_allocated_power(&plan, "T2", 22_000);
    }

    #[test]
    fn test_fixed_load_is_subtracted() {
        let mut snap = snapshot(
            group(30_000, LoadBalancingStrategy::RoundRobin),
            vec![demand("T1", "S1", 0, 22_000), demand("T2", "S2", 5, 22_000)],
        );
        snap.fixed_load = 11_000;
        let plan = allocate(&snap, now()).unwrap();
        assert_eq!(plan.effective_cap, 19_000);
        assert_eq_allocated_power(&plan, "T1", 9_500);
        assert_eq_allocated_power(&plan, "T2", 9_500);
    }

    #[test]
    fn test_temporary_override_pins_session() {
        let mut pinned = demand("T1", "S1", 0, 22_000);
        pinned.override_limit = Some(LimitOverride {
            limit: 5_000,
            expires_at: now() + Duration::minutes(10),
            reason: AdjustmentReason::Emergency,
        });
        let snap = snapshot(
            group(30_000, LoadBalancingStrategy::RoundRobin),
            vec![pinned, demand("T2", "S2", 5, 22_000)],
        );
        let plan = allocate(&snap, now()).unwrap();
        assert_eq_allocated_power(&plan, "T1", 5_000);
        assert!(plan.grants.iter().any(|g| g.transaction_id == "T1" && g.pinned));
        assert_eq_allocated_power(&plan, "T2", 22_000);
    }

    #[test]
    fn test_expired_override_is_ignored() {
        let mut pinned = demand("T1", "S1", 0, 22_000);
        pinned.override_limit = Some(LimitOverride {
            limit: 5_000,
            expires_at: now() - Duration::seconds(1),
            reason: AdjustmentReason::Manual,
        });
        let snap = snapshot(
            group(30_000, LoadBalancingStrategy::RoundRobin),
            vec![pinned, demand("T2", "S2", 5, 22_000)],
        );
        let plan = allocate(&snap, now()).unwrap();
        assert_eq_allocated_power(&plan, "T1", 15_000);
        assert_eq_allocated_power(&plan, "T2", 15_000);
    }

    #[test]
    /// Paused sessions are resumed once capacity frees up
    fn test_paused_session_is_eligible() {
        let mut paused = demand("T2", "S2", 5, 22_000);
        paused.status = SessionStatus::Paused;
        paused.allocated_power = Some(0);
        let mut pending = demand("T3", "S3", 6, 22_000);
        pending.status = SessionStatus::Pending;
        let snap = snapshot(
            group(30_000, LoadBalancingStrategy::RoundRobin),
            vec![paused, pending],
        );
        let plan = allocate(&snap, now()).unwrap();
        assert_eq!(plan.grants.len(), 1);
        assert_eq_allocated_power(&plan, "T2", 22_000);
        assert_eq!(status_of(&plan, "T2"), SessionStatus::Active);
    }

    #[test]
    fn test_changes_respect_epsilon() {
        let mut t1 = demand("T1", "S1", 0, 22_000);
        t1.allocated_power = Some(14_950);
        let mut t2 = demand("T2", "S2", 5, 22_000);
        t2.allocated_power = Some(20_000);
        let t3 = demand("T3", "S3", 6, 22_000);
        let snap = snapshot(
            group(45_000, LoadBalancingStrategy::RoundRobin),
            vec![t1, t2, t3],
        );
        let plan = allocate(&snap, now()).unwrap();
        let changed: Vec<&str> = plan
            .changes(DEFAULT_EPSILON)
            .map(|g| g.transaction_id.as_str())
            .collect();
        assert_eq!(changed, vec!["T2", "T3"]);
    }

    #[test]
    fn test_inactive_group_fails() {
        let mut inactive = group(30_000, LoadBalancingStrategy::RoundRobin);
        inactive.active = false;
        let snap = snapshot(inactive, vec![demand("T1", "S1", 0, 22_000)]);
        assert!(matches!(
            allocate(&snap, now()),
            Err(AllocationError::GroupInactive { .. })
        ));
    }

    #[test]
    /// The cap holds for every strategy on the same load
    fn test_total_never_exceeds_cap() {
        for strategy in [
            LoadBalancingStrategy::RoundRobin,
            LoadBalancingStrategy::FirstComeFirstServe,
            LoadBalancingStrategy::PriorityBased,
            LoadBalancingStrategy::Dynamic,
            LoadBalancingStrategy::TimeOfUse,
        ] {
            let sessions = (0..7)
                .map(|i| {
                    let mut d = demand(&format!("T{i}"), &format!("S{i}"), i, 7_400 + 3_000 * i as u32);
                    d.priority = (i % 3) as i32;
                    d
                })
                .collect();
            let mut snap = snapshot(group(31_337, strategy), sessions);
            snap.profiles = vec![group_profile(28_000, PriceTier::Standard, Some(2_000))];
            let plan = allocate(&snap, now()).unwrap();
            assert!(
                plan.total() <= plan.effective_cap,
                "{strategy:?} granted {} over {}",
                plan.total(),
                plan.effective_cap
            );
        }
    }
}
