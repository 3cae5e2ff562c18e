//! Station worker
//!
//! One task per station connection. Frames are handled strictly in the
//! order they arrive; the worker also owns the station's heartbeat timeout,
//! so any processed message keeps the station online.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use csms_core::ocpp::{
    Action, AuthorizationStatus, BootNotificationRequest, BootNotificationResponse, Call, CallError,
    CallResult, ErrorCode, FrameError, HeartbeatResponse, IdTagInfo, MeterValuesRequest,
    MeterValuesResponse, OcppMessage, RegistrationStatus, StartTransactionRequest,
    StartTransactionResponse, StatusNotificationRequest, StatusNotificationResponse,
    StopTransactionRequest, StopTransactionResponse,
};
use csms_core::{
    DEFAULT_LOCK_TIMEOUT, Effects, ErrorKind, SessionError, StartRequest, StateMachine,
    StationInfo, StopReason,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::channel::ChannelManager;
use crate::publisher::Publisher;
use crate::scheduler::AllocationTrigger;

const LINK_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Heartbeat interval handed to stations in BootNotification.
    pub heartbeat_interval: Duration,
    /// Silence after which a station is considered offline.
    pub heartbeat_timeout: Duration,
    /// How long a call to a station may wait for its result.
    pub call_timeout: Duration,
    pub lock_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(180),
            call_timeout: Duration::from_secs(30),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Both ends of a station connection as seen by the transport: frames from
/// the station go into `inbound`, frames for the station come out of
/// `outbound`. Dropping `inbound` closes the connection.
#[derive(Debug)]
pub struct StationLink {
    pub inbound: mpsc::Sender<String>,
    pub outbound: mpsc::Receiver<String>,
}

/// Shared pieces every worker needs.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub machine: StateMachine,
    pub channels: Arc<ChannelManager>,
    pub publisher: Publisher,
    pub trigger: AllocationTrigger,
    pub config: ProtocolConfig,
}

impl WorkerContext {
    pub fn spawn_worker(&self, station_id: &str) -> StationLink {
        let (inbound_tx, inbound_rx) = mpsc::channel(LINK_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(LINK_CAPACITY);
        let generation = self.channels.connect(station_id, outbound_tx.clone());
        let worker = StationWorker {
            station_id: station_id.to_string(),
            ctx: self.clone(),
            outbound: outbound_tx,
        };
        tokio::spawn(worker.run(inbound_rx, generation));
        StationLink {
            inbound: inbound_tx,
            outbound: outbound_rx,
        }
    }
}

#[derive(Debug, Error)]
enum HandlerError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{0}")]
    Unsupported(String),
}

struct StationWorker {
    station_id: String,
    ctx: WorkerContext,
    outbound: mpsc::Sender<String>,
}

impl StationWorker {
    async fn run(self, mut inbound: mpsc::Receiver<String>, generation: u64) {
        let timeout = self.ctx.config.heartbeat_timeout;
        let mut deadline = Instant::now() + timeout;
        let mut timed_out = false;

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(text) => {
                        deadline = Instant::now() + timeout;
                        timed_out = false;
                        self.handle_frame(&text).await;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if !timed_out => {
                    timed_out = true;
                    self.heartbeat_timeout();
                }
            }
        }

        self.ctx.channels.disconnect(&self.station_id, generation);
        if !timed_out {
            // A reconnect before the deadline keeps the station online
            tokio::time::sleep_until(deadline).await;
            if !self.ctx.channels.is_connected(&self.station_id) {
                self.heartbeat_timeout();
            }
        }
        tracing::debug!(station_id = %self.station_id, "Worker stopped");
    }

    fn heartbeat_timeout(&self) {
        match self
            .ctx
            .machine
            .on_heartbeat_timeout(&self.station_id, Utc::now())
        {
            Ok(effects) => self.apply(effects),
            Err(err) => {
                tracing::warn!(station_id = %self.station_id, error = %err, "Heartbeat timeout not applied")
            }
        }
    }

    fn apply(&self, effects: Effects) {
        for event in &effects.lifecycle {
            self.ctx.publisher.session_event(event);
        }
        if let Some(group_id) = effects.reallocate {
            self.ctx.trigger.trigger(group_id);
        }
    }

    async fn send(&self, bytes: Result<Vec<u8>, FrameError>) {
        let text = match bytes {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                tracing::error!(station_id = %self.station_id, error = %err, "Could not encode frame");
                return;
            }
        };
        tracing::debug!(station_id = %self.station_id, frame = %text, "Sending frame");
        if self.outbound.send(text).await.is_err() {
            tracing::warn!(station_id = %self.station_id, "Connection closed, frame dropped");
        }
    }

    async fn handle_frame(&self, text: &str) {
        tracing::debug!(station_id = %self.station_id, frame = %text, "Received frame");
        match OcppMessage::parse(text.as_bytes()) {
            Ok(OcppMessage::Call(call)) => {
                let reply = match self.handle_call(&call) {
                    Ok(result) => result.to_bytes(),
                    Err(error) => error.to_bytes(),
                };
                self.send(reply).await;
            }
            Ok(OcppMessage::CallResult(result)) => {
                self.ctx.channels.resolve(&self.station_id, result);
            }
            Ok(OcppMessage::CallError(error)) => {
                self.ctx.channels.reject(&self.station_id, error);
            }
            Err(err) => match err.to_call_error() {
                Some(error) => {
                    tracing::warn!(station_id = %self.station_id, error = %err, "Rejecting frame");
                    self.send(error.to_bytes()).await;
                }
                None => {
                    tracing::warn!(station_id = %self.station_id, error = %err, "Dropping malformed frame");
                }
            },
        }
    }

    fn handle_call(&self, call: &Call) -> Result<CallResult, CallError> {
        let payload = match call.action {
            Action::BootNotification => self.boot_notification(call),
            Action::Heartbeat => self.heartbeat(),
            Action::StatusNotification => self.status_notification(call),
            Action::StartTransaction => self.start_transaction(call),
            Action::MeterValues => self.meter_values(call),
            Action::StopTransaction => self.stop_transaction(call),
            Action::SetChargingProfile => Err(HandlerError::Unsupported(format!(
                "{} is sent by the central system",
                call.action
            ))),
        };
        payload
            .and_then(|value| Ok(CallResult::new(call.message_id.clone(), value)?))
            .map_err(|err| self.call_error(call, err))
    }

    fn call_error(&self, call: &Call, err: HandlerError) -> CallError {
        let code = match &err {
            HandlerError::Frame(frame) => {
                if let Some(error) = frame.to_call_error() {
                    return error;
                }
                ErrorCode::FormationViolation
            }
            HandlerError::Unsupported(_) => ErrorCode::NotSupported,
            HandlerError::Session(session) => match session.kind() {
                ErrorKind::ProtocolViolation => ErrorCode::PropertyConstraintViolation,
                ErrorKind::Timeout => ErrorCode::InternalError,
                _ => ErrorCode::GenericError,
            },
        };
        tracing::warn!(
            station_id = %self.station_id,
            message_id = %call.message_id,
            action = %call.action,
            ?code,
            error = %err,
            "Answering with CALLERROR"
        );
        CallError::new(call.message_id.clone(), code, err.to_string())
    }

    /// Log a `NotFound` outcome and acknowledge anyway; anything else is
    /// answered with a CALLERROR.
    fn ack_not_found(&self, action: Action, err: SessionError) -> Result<(), HandlerError> {
        if err.kind() == ErrorKind::NotFound {
            tracing::warn!(station_id = %self.station_id, %action, error = %err, "Ignoring message");
            Ok(())
        } else {
            Err(err.into())
        }
    }

    fn boot_notification(&self, call: &Call) -> Result<serde_json::Value, HandlerError> {
        let req: BootNotificationRequest = call.parse_payload()?;
        let now = Utc::now();
        let status = if self.ctx.machine.store().contains_station(&self.station_id) {
            self.ctx.machine.on_boot(
                &self.station_id,
                StationInfo {
                    vendor: req.charge_point_vendor,
                    model: req.charge_point_model,
                    serial_number: req.charge_point_serial_number,
                    firmware_version: req.firmware_version,
                },
                now,
            )?;
            RegistrationStatus::Accepted
        } else {
            tracing::warn!(station_id = %self.station_id, "Boot from unknown station rejected");
            RegistrationStatus::Rejected
        };
        payload(BootNotificationResponse {
            status,
            current_time: now,
            interval: self.ctx.config.heartbeat_interval.as_secs(),
        })
    }

    fn heartbeat(&self) -> Result<serde_json::Value, HandlerError> {
        let now = Utc::now();
        if let Err(err) = self.ctx.machine.on_heartbeat(&self.station_id, now) {
            self.ack_not_found(Action::Heartbeat, err)?;
        }
        payload(HeartbeatResponse { current_time: now })
    }

    fn status_notification(&self, call: &Call) -> Result<serde_json::Value, HandlerError> {
        let req: StatusNotificationRequest = call.parse_payload()?;
        if let Err(err) = self.ctx.machine.on_status_notification(
            &self.station_id,
            req.connector_id,
            req.status,
            req.error_code,
            req.timestamp.unwrap_or_else(Utc::now),
        ) {
            self.ack_not_found(Action::StatusNotification, err)?;
        }
        payload(StatusNotificationResponse {})
    }

    fn start_transaction(&self, call: &Call) -> Result<serde_json::Value, HandlerError> {
        let req: StartTransactionRequest = call.parse_payload()?;
        let transaction_id = req
            .transaction_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let started = self.ctx.machine.on_start_session(
            &self.station_id,
            StartRequest {
                connector_idx: req.connector_id,
                transaction_id: transaction_id.clone(),
                meter_start: req.meter_start,
                user_tag: req.id_tag,
                timestamp: req.timestamp,
            },
        );
        let status = match started {
            Ok((_, effects)) => {
                self.apply(effects);
                AuthorizationStatus::Accepted
            }
            Err(SessionError::StationDisabled { .. }) => AuthorizationStatus::Blocked,
            Err(err) if err.kind() == ErrorKind::Conflict => {
                tracing::warn!(station_id = %self.station_id, error = %err, "Start refused");
                AuthorizationStatus::ConcurrentTx
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::warn!(station_id = %self.station_id, error = %err, "Start refused");
                AuthorizationStatus::Invalid
            }
            Err(err) => return Err(err.into()),
        };
        payload(StartTransactionResponse {
            transaction_id,
            id_tag_info: IdTagInfo {
                status,
                expiry_date: None,
            },
        })
    }

    fn meter_values(&self, call: &Call) -> Result<serde_json::Value, HandlerError> {
        let req: MeterValuesRequest = call.parse_payload()?;
        let Some((reading, timestamp)) = req.latest_energy() else {
            return payload(MeterValuesResponse {});
        };
        let transaction_id = req.transaction_id.clone().or_else(|| {
            self.ctx
                .machine
                .store()
                .active_sessions(&self.station_id)
                .into_iter()
                .find(|s| s.connector_id.idx == req.connector_id)
                .map(|s| s.transaction_id)
        });
        let Some(transaction_id) = transaction_id else {
            tracing::warn!(
                station_id = %self.station_id,
                connector_id = req.connector_id,
                "Meter values without a running transaction"
            );
            return payload(MeterValuesResponse {});
        };

        match self.ctx.machine.on_meter_values(
            &self.station_id,
            &transaction_id,
            reading,
            timestamp,
        ) {
            Ok(effects) => self.apply(effects),
            Err(err @ SessionError::MeterRegression { .. }) => {
                tracing::warn!(station_id = %self.station_id, error = %err, "Meter reading dropped");
            }
            Err(err) => self.ack_not_found(Action::MeterValues, err)?,
        }
        payload(MeterValuesResponse {})
    }

    fn stop_transaction(&self, call: &Call) -> Result<serde_json::Value, HandlerError> {
        let req: StopTransactionRequest = call.parse_payload()?;
        let Some(transaction_id) = req.transaction_id else {
            return Err(FrameError::InvalidPayload {
                message_id: call.message_id.clone(),
                action: call.action,
                reason: "transactionId is required".into(),
            }
            .into());
        };
        let id_tag_info = req.id_tag.as_ref().map(|_| IdTagInfo {
            status: AuthorizationStatus::Accepted,
            expiry_date: None,
        });
        match self.ctx.machine.on_stop_session(
            &self.station_id,
            &transaction_id,
            req.meter_stop,
            req.reason.unwrap_or(StopReason::Local),
            req.timestamp,
        ) {
            Ok((_, effects)) => self.apply(effects),
            Err(err) => self.ack_not_found(Action::StopTransaction, err)?,
        }
        payload(StopTransactionResponse { id_tag_info })
    }
}

fn payload(response: impl Serialize) -> Result<serde_json::Value, HandlerError> {
    Ok(serde_json::to_value(response).map_err(FrameError::from)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryPolicy;
    use crate::publisher::{EventRecord, EventSink, InMemoryBus};
    use csms_core::{
        ChargePointStatus, ChargingGroup, Connector, ConnectorType, DEFAULT_MIN_POWER,
        LoadBalancingStrategy, PowerType, SessionStatus, SessionStore, Station,
    };
    use serde_json::{Value, json};
    use tokio::sync::broadcast;

    const GROUP: uuid::Uuid = uuid::Uuid::from_u128(0x5);

    struct Harness {
        ctx: WorkerContext,
        events: broadcast::Receiver<EventRecord>,
        triggers: mpsc::UnboundedReceiver<uuid::Uuid>,
    }

    fn harness() -> Harness {
        let store = Arc::new(SessionStore::default());
        store.register_group(ChargingGroup {
            id: GROUP,
            name: "G".into(),
            max_power: 30_000,
            current_power: 0,
            active: true,
            strategy: LoadBalancingStrategy::RoundRobin,
        });
        store.register_station(Station {
            station_id: "S1".into(),
            serial_number: None,
            owner_id: None,
            location: None,
            vendor: None,
            model: None,
            firmware_version: None,
            group_id: Some(GROUP),
            priority: 0,
            enabled: true,
            smart_charging_enabled: true,
            max_power: None,
            status: ChargePointStatus::Pending,
            last_heartbeat: None,
            connectors: vec![Connector {
                idx: 1,
                connector_type: ConnectorType::Type2,
                power_type: PowerType::Ac3Phase,
                max_voltage: None,
                max_amperage: None,
                max_power: 22_000,
                min_power: DEFAULT_MIN_POWER,
                status: ChargePointStatus::Available,
                last_status_at: None,
            }],
        });
        let bus = InMemoryBus::new(64);
        let events = bus.subscribe();
        let sink: Arc<dyn EventSink> = Arc::new(bus);
        let (publisher, _) = Publisher::spawn(sink, RetryPolicy::default());
        let (trigger, triggers) = AllocationTrigger::detached();
        Harness {
            ctx: WorkerContext {
                machine: StateMachine::new(store),
                channels: Arc::new(ChannelManager::new(Duration::from_secs(5))),
                publisher,
                trigger,
                config: ProtocolConfig::default(),
            },
            events,
            triggers,
        }
    }

    /// Send a CALL and return the frame the worker answered with.
    async fn exchange(link: &mut StationLink, frame: Value) -> Value {
        link.inbound.send(frame.to_string()).await.unwrap();
        let reply = link.outbound.recv().await.unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    fn start(tx: &str, meter_start: u64) -> Value {
        json!([2, "start", "StartTransaction", {
            "connectorId": 1,
            "idTag": "TAG",
            "meterStart": meter_start,
            "timestamp": Utc::now(),
            "transactionId": tx
        }])
    }

    #[tokio::test]
    async fn test_boot_known_and_unknown_stations() {
        let h = harness();
        let mut link = h.ctx.spawn_worker("S1");
        let boot = json!([2, "b1", "BootNotification", {
            "chargePointVendor": "Electra",
            "chargePointModel": "AC22",
            "firmwareVersion": "1.4.2"
        }]);
        let reply = exchange(&mut link, boot.clone()).await;
        assert_eq!(reply[0], 3);
        assert_eq!(reply[1], "b1");
        assert_eq!(reply[2]["status"], "Accepted");
        assert_eq!(reply[2]["interval"], 60);
        let station = h.ctx.machine.store().station("S1").unwrap();
        assert_eq!(station.status, ChargePointStatus::Available);
        assert_eq!(station.firmware_version.as_deref(), Some("1.4.2"));

        let mut stranger = h.ctx.spawn_worker("S9");
        let reply = exchange(&mut stranger, boot).await;
        assert_eq!(reply[2]["status"], "Rejected");
    }

    #[tokio::test]
    async fn test_start_publishes_and_triggers_group() {
        let mut h = harness();
        let mut link = h.ctx.spawn_worker("S1");

        let reply = exchange(&mut link, start("T1", 1000)).await;
        assert_eq!(reply[2]["transactionId"], "T1");
        assert_eq!(reply[2]["idTagInfo"]["status"], "Accepted");
        assert_eq!(h.triggers.recv().await, Some(GROUP));
        let record = h.events.recv().await.unwrap();
        assert_eq!(record.payload["eventType"], "SESSION_STARTED");
        assert_eq!(record.key, "S1");

        // Same transaction again is acknowledged without a second session
        let reply = exchange(&mut link, start("T1", 1000)).await;
        assert_eq!(reply[2]["idTagInfo"]["status"], "Accepted");
        assert_eq!(h.ctx.machine.store().active_sessions("S1").len(), 1);

        let reply = exchange(&mut link, start("T2", 1000)).await;
        assert_eq!(reply[2]["idTagInfo"]["status"], "ConcurrentTx");
    }

    #[tokio::test]
    async fn test_start_without_transaction_id_gets_one_assigned() {
        let h = harness();
        let mut link = h.ctx.spawn_worker("S1");
        let reply = exchange(
            &mut link,
            json!([2, "s", "StartTransaction", {
                "connectorId": 1,
                "meterStart": 0,
                "timestamp": Utc::now()
            }]),
        )
        .await;
        let tx = reply[2]["transactionId"].as_str().unwrap();
        assert!(h.ctx.machine.store().session(tx).is_some());
    }

    #[tokio::test]
    async fn test_disabled_station_start_is_blocked() {
        let h = harness();
        h.ctx
            .machine
            .store()
            .update_station("S1", |s| s.enabled = false)
            .unwrap();
        let mut link = h.ctx.spawn_worker("S1");
        let reply = exchange(&mut link, start("T1", 0)).await;
        assert_eq!(reply[2]["idTagInfo"]["status"], "Blocked");
        assert!(h.ctx.machine.store().session("T1").is_none());
    }

    #[tokio::test]
    async fn test_meter_regression_is_acknowledged_and_dropped() {
        let h = harness();
        let mut link = h.ctx.spawn_worker("S1");
        exchange(&mut link, start("T1", 1000)).await;

        let meter = |id: &str, value: &str| {
            json!([2, id, "MeterValues", {
                "connectorId": 1,
                "transactionId": "T1",
                "meterValue": [{"timestamp": Utc::now(), "sampledValue": [{"value": value}]}]
            }])
        };
        let reply = exchange(&mut link, meter("m1", "1010")).await;
        assert_eq!(reply[0], 3);
        let reply = exchange(&mut link, meter("m2", "1005")).await;
        assert_eq!(reply[0], 3);

        let session = h.ctx.machine.store().session("T1").unwrap();
        assert_eq!(session.meter_last, 1010);
        assert_eq!(session.energy, 10);
    }

    #[tokio::test]
    async fn test_stop_closes_session() {
        let h = harness();
        let mut link = h.ctx.spawn_worker("S1");
        exchange(&mut link, start("T1", 500)).await;
        let reply = exchange(
            &mut link,
            json!([2, "stop", "StopTransaction", {
                "transactionId": "T1",
                "meterStop": 550,
                "timestamp": Utc::now(),
                "idTag": "TAG"
            }]),
        )
        .await;
        assert_eq!(reply[2]["idTagInfo"]["status"], "Accepted");
        let session = h.ctx.machine.store().session("T1").unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.energy, 50);
        assert_eq!(session.stop_reason, Some(StopReason::Local));
    }

    #[tokio::test]
    async fn test_bad_frames_get_call_errors() {
        let h = harness();
        let mut link = h.ctx.spawn_worker("S1");

        let reply = exchange(&mut link, json!([2, "x1", "StartTransaction", {"connectorId": "one"}])).await;
        assert_eq!(reply[0], 4);
        assert_eq!(reply[1], "x1");
        assert_eq!(reply[2], "FormationViolation");

        let reply = exchange(&mut link, json!([2, "x2", "DataTransfer", {}])).await;
        assert_eq!(reply[2], "NotImplemented");

        let reply = exchange(
            &mut link,
            json!([2, "x3", "StatusNotification", {"connectorId": 1, "status": "Offline"}]),
        )
        .await;
        assert_eq!(reply[2], "PropertyConstraintViolation");

        // Unknown connectors are logged and acknowledged
        let reply = exchange(
            &mut link,
            json!([2, "x4", "StatusNotification", {"connectorId": 7, "status": "Available"}]),
        )
        .await;
        assert_eq!(reply[0], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_station_goes_offline() {
        let mut h = harness();
        let mut link = h.ctx.spawn_worker("S1");
        exchange(&mut link, start("T1", 0)).await;
        let _ = h.events.recv().await.unwrap();
        let _ = h.triggers.recv().await;

        tokio::time::sleep(Duration::from_secs(181)).await;
        let store = h.ctx.machine.store();
        assert_eq!(store.station("S1").unwrap().status, ChargePointStatus::Offline);
        let session = store.session("T1").unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.stopped_at.is_some());
        let record = h.events.recv().await.unwrap();
        assert_eq!(record.payload["eventType"], "SESSION_ENDED");
        assert_eq!(h.triggers.recv().await, Some(GROUP));

        // Heard from again
        let reply = exchange(&mut link, json!([2, "h", "Heartbeat", {}])).await;
        assert!(reply[2]["currentTime"].is_string());
        assert_ne!(store.station("S1").unwrap().status, ChargePointStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_after_timeout_brings_station_back() {
        let mut h = harness();
        let mut link = h.ctx.spawn_worker("S1");
        tokio::time::sleep(Duration::from_secs(181)).await;
        let store = h.ctx.machine.store().clone();
        assert_eq!(store.station("S1").unwrap().status, ChargePointStatus::Offline);

        let reply = exchange(&mut link, start("T1", 0)).await;
        assert_eq!(reply[2]["idTagInfo"]["status"], "Accepted");
        assert_eq!(store.station("S1").unwrap().status, ChargePointStatus::Charging);
        assert_eq!(h.triggers.recv().await, Some(GROUP));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keeps_station_online() {
        let h = harness();
        let first = h.ctx.spawn_worker("S1");
        drop(first);
        tokio::time::sleep(Duration::from_secs(60)).await;
        let _second = h.ctx.spawn_worker("S1");
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_ne!(
            h.ctx.machine.store().station("S1").unwrap().status,
            ChargePointStatus::Offline
        );
    }
}
