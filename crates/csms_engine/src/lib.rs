mod allocation;
mod backoff;
mod channel;
mod publisher;
mod scheduler;
mod worker;

pub use crate::allocation::*;
pub use crate::backoff::*;
pub use crate::channel::*;
pub use crate::publisher::*;
pub use crate::scheduler::*;
pub use crate::worker::{ProtocolConfig, StationLink};

use std::sync::Arc;
use std::time::Duration;

use csms_core::{AdjustmentReason, ConnectorId, PowerDistributionEvent, SessionStore, StateMachine};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::worker::WorkerContext;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineConfig {
    pub protocol: ProtocolConfig,
    pub scheduler: SchedulerConfig,
    pub allocation: AllocationConfig,
    /// Retries of SetChargingProfile calls.
    pub delivery: RetryPolicy,
    /// Retries of event bus publishes.
    pub publisher: RetryPolicy,
}

impl EngineConfig {
    /// Longest time delivering one limit can take, retries included.
    /// Passes need at least this long to settle every command they send.
    pub fn delivery_budget(&self) -> Duration {
        self.delivery.worst_case(self.protocol.call_timeout)
    }
}

/// The running charging station management core: station workers, the
/// allocation scheduler and the event publisher around one session store.
pub struct Engine {
    store: Arc<SessionStore>,
    channels: Arc<ChannelManager>,
    runner: Arc<AllocationRunner>,
    trigger: AllocationTrigger,
    workers: WorkerContext,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Start the publisher and the scheduler. Stations, groups and profiles
    /// are expected to be registered in `store` already.
    pub fn start(
        config: EngineConfig,
        store: Arc<SessionStore>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Engine> {
        if config.scheduler.pass_timeout < config.delivery_budget() {
            tracing::warn!(
                pass_timeout = ?config.scheduler.pass_timeout,
                delivery_budget = ?config.delivery_budget(),
                "Passes may time out before their commands are delivered"
            );
        }
        let channels = Arc::new(ChannelManager::new(config.protocol.call_timeout));
        let (publisher, publisher_task) = Publisher::spawn(sink, config.publisher);
        let runner = Arc::new(AllocationRunner::new(
            store.clone(),
            channels.clone(),
            publisher.clone(),
            config.allocation,
            config.delivery,
        ));

        let pass: PassFn = {
            let runner = runner.clone();
            Arc::new(move |group_id| {
                let runner = runner.clone();
                async move { runner.run_pass(group_id).await }.boxed()
            })
        };
        let (trigger, scheduler_task) = Scheduler::spawn(config.scheduler, store.clone(), pass);

        let workers = WorkerContext {
            machine: StateMachine::new(store.clone()),
            channels: channels.clone(),
            publisher,
            trigger: trigger.clone(),
            config: config.protocol,
        };
        tracing::info!(
            stations = store.station_ids().len(),
            groups = store.groups().len(),
            "Engine started"
        );

        Arc::new(Engine {
            store,
            channels,
            runner,
            trigger,
            workers,
            tasks: Mutex::new(vec![publisher_task, scheduler_task]),
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    /// Attach a new station connection and start its worker.
    pub fn connect(&self, station_id: &str) -> StationLink {
        self.workers.spawn_worker(station_id)
    }

    pub fn trigger(&self, group_id: uuid::Uuid) {
        self.trigger.trigger(group_id);
    }

    pub async fn run_pass(&self, group_id: uuid::Uuid) -> Result<PassReport, PassError> {
        self.runner.run_pass(group_id).await
    }

    /// Apply a manual limit. A temporary limit reshapes the connector's
    /// group now and once more when it expires.
    pub async fn set_limit(
        &self,
        connector_id: &ConnectorId,
        limit: u32,
        duration: Option<Duration>,
        reason: AdjustmentReason,
    ) -> Result<PowerDistributionEvent, LimitError> {
        let event = self
            .runner
            .set_limit(connector_id, limit, duration, reason)
            .await?;
        if let (Some(duration), Some(group_id)) =
            (duration, self.store.group_of_station(&connector_id.station_id))
        {
            self.trigger.trigger(group_id);
            let trigger = self.trigger.clone();
            let expiry = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                trigger.trigger(group_id);
            });
            let mut tasks = self.tasks.lock();
            tasks.retain(|task| !task.is_finished());
            tasks.push(expiry);
        }
        Ok(event)
    }

    /// Stop background tasks. Station workers end with their connections.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("Engine stopped");
    }
}
