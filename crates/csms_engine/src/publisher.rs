//! Lifecycle event publisher
//!
//! Records are queued by the station workers and the allocation runner and
//! published in order by a single task. Failed publishes are retried with
//! backoff; the store is never rolled back when a record is finally dropped.

use std::sync::Arc;

use async_trait::async_trait;
use csms_core::{
    ErrorKind, POWER_DISTRIBUTION_TOPIC, PowerDistributionEvent, SESSION_LIFECYCLE_TOPIC,
    SessionLifecycleEvent,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::backoff::RetryPolicy;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Event bus unavailable: {0}")]
    Unavailable(String),
    #[error("Could not encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PublishError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::DeliveryFailure
    }
}

/// A keyed JSON record on a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub topic: &'static str,
    pub key: String,
    pub payload: serde_json::Value,
}

impl EventRecord {
    fn new(topic: &'static str, key: &str, payload: &impl Serialize) -> Result<Self, PublishError> {
        Ok(EventRecord {
            topic,
            key: key.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, record: &EventRecord) -> Result<(), PublishError>;

    fn name(&self) -> &str;
}

/// In-process bus; every subscriber sees every record.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    tx: broadcast::Sender<EventRecord>,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        InMemoryBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for InMemoryBus {
    async fn publish(&self, record: &EventRecord) -> Result<(), PublishError> {
        if self.tx.send(record.clone()).is_err() {
            tracing::trace!(topic = record.topic, "No subscribers for record");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Writes every record to the log.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn publish(&self, record: &EventRecord) -> Result<(), PublishError> {
        tracing::info!(
            target: "csms::events",
            topic = record.topic,
            key = %record.key,
            payload = %record.payload,
            "Event"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// Handle used to queue records for publishing.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<EventRecord>,
}

impl Publisher {
    pub fn spawn(sink: Arc<dyn EventSink>, policy: RetryPolicy) -> (Publisher, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<EventRecord>();
        let handle = tokio::spawn(async move {
            tracing::info!(sink = sink.name(), "Publisher started");
            while let Some(record) = rx.recv().await {
                let result = policy
                    .run(
                        "Publish",
                        |err: &PublishError| matches!(err, PublishError::Unavailable(_)),
                        |_| sink.publish(&record),
                    )
                    .await;
                if let Err(err) = result {
                    tracing::error!(
                        topic = record.topic,
                        key = %record.key,
                        error = %err,
                        "Dropping record after retries"
                    );
                }
            }
            tracing::info!("Publisher stopped");
        });
        (Publisher { tx }, handle)
    }

    fn enqueue(&self, record: Result<EventRecord, PublishError>) {
        match record {
            Ok(record) => {
                if self.tx.send(record).is_err() {
                    tracing::warn!("Publisher stopped, record dropped");
                }
            }
            Err(err) => tracing::error!(error = %err, "Could not build record"),
        }
    }

    pub fn session_event(&self, event: &SessionLifecycleEvent) {
        self.enqueue(EventRecord::new(
            SESSION_LIFECYCLE_TOPIC,
            event.key(),
            event,
        ));
    }

    pub fn power_event(&self, event: &PowerDistributionEvent) {
        self.enqueue(EventRecord::new(
            POWER_DISTRIBUTION_TOPIC,
            &event.station_id,
            event,
        ));
    }
}
