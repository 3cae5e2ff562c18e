//! Allocation scheduler
//!
//! Runs a pass over every active group on a fixed interval and, between
//! ticks, a pass for any group a lifecycle event touched. Triggers for one
//! group arriving within the debounce window share a single pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use csms_core::SessionStore;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::allocation::{PassError, PassReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub debounce: Duration,
    pub pass_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            interval: Duration::from_secs(60),
            debounce: Duration::from_millis(500),
            pass_timeout: Duration::from_secs(120),
        }
    }
}

/// One allocation pass over one group.
pub type PassFn =
    Arc<dyn Fn(Uuid) -> BoxFuture<'static, Result<PassReport, PassError>> + Send + Sync>;

/// Asks the scheduler for a pass over a group.
#[derive(Debug, Clone)]
pub struct AllocationTrigger {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl AllocationTrigger {
    /// A trigger whose requests land in the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AllocationTrigger { tx }, rx)
    }

    pub fn trigger(&self, group_id: Uuid) {
        if self.tx.send(group_id).is_err() {
            tracing::warn!(group_id = %group_id, "Scheduler stopped, trigger dropped");
        }
    }
}

#[derive(Default)]
struct GroupState {
    lock: tokio::sync::Mutex<()>,
    /// Set when a pass is requested while one is running.
    rerun: AtomicBool,
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<SessionStore>,
    pass: PassFn,
    groups: Mutex<HashMap<Uuid, Arc<GroupState>>>,
}

impl Scheduler {
    pub fn spawn(
        config: SchedulerConfig,
        store: Arc<SessionStore>,
        pass: PassFn,
    ) -> (AllocationTrigger, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler {
            config,
            store,
            pass,
            groups: Mutex::new(HashMap::new()),
        });
        let handle = tokio::spawn(scheduler.run(rx));
        (AllocationTrigger { tx }, handle)
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Uuid>) {
        tracing::info!(
            interval = ?self.config.interval,
            debounce = ?self.config.debounce,
            "Allocation scheduler started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut due: HashMap<Uuid, Instant> = HashMap::new();
        let mut passes = JoinSet::new();

        loop {
            let next_due = due.values().min().copied();
            tokio::select! {
                _ = ticker.tick() => {
                    for group in self.store.groups().into_iter().filter(|g| g.active) {
                        due.remove(&group.id);
                        passes.spawn(self.clone().run_group(group.id));
                    }
                }
                msg = rx.recv() => match msg {
                    Some(group_id) => {
                        due.entry(group_id)
                            .or_insert_with(|| Instant::now() + self.config.debounce);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    let now = Instant::now();
                    let ready: Vec<Uuid> = due
                        .iter()
                        .filter(|(_, at)| **at <= now)
                        .map(|(id, _)| *id)
                        .collect();
                    for group_id in ready {
                        due.remove(&group_id);
                        passes.spawn(self.clone().run_group(group_id));
                    }
                }
                Some(joined) = passes.join_next(), if !passes.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(error = %err, "Allocation pass task failed");
                    }
                }
            }
        }

        passes.shutdown().await;
        tracing::info!("Allocation scheduler stopped");
    }

    fn group_state(&self, group_id: Uuid) -> Arc<GroupState> {
        self.groups.lock().entry(group_id).or_default().clone()
    }

    /// Run passes for one group until no further pass was requested. A
    /// request arriving while a pass runs is folded into one follow-up pass.
    async fn run_group(self: Arc<Self>, group_id: Uuid) {
        let state = self.group_state(group_id);
        state.rerun.store(true, Ordering::SeqCst);
        loop {
            let Ok(guard) = state.lock.try_lock() else {
                // The running pass picks up the request
                return;
            };
            if !state.rerun.swap(false, Ordering::SeqCst) {
                return;
            }
            self.run_pass(group_id).await;
            drop(guard);
            if !state.rerun.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn run_pass(&self, group_id: Uuid) {
        let result = tokio::time::timeout(self.config.pass_timeout, (self.pass)(group_id))
            .await
            .unwrap_or(Err(PassError::Timeout { group_id }));
        if let Err(err) = result {
            tracing::error!(
                group_id = %group_id,
                kind = ?err.kind(),
                error = %err,
                "Allocation pass failed, group keeps its previous allocation"
            );
        }
    }
}
