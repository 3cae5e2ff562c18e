use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use csms_core::ocpp::{CallResult, OcppMessage, SetChargingProfileRequest};
use csms_core::{
    ChargePointStatus, ChargingGroup, Connector, ConnectorType, DEFAULT_MIN_POWER,
    LoadBalancingStrategy, PowerType, SessionStatus, SessionStore, Station,
};
use csms_engine::{Engine, EngineConfig, EventRecord, EventSink, InMemoryBus, SchedulerConfig};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};

const GROUP: uuid::Uuid = uuid::Uuid::from_u128(0x30);

fn station(id: &str) -> Station {
    Station {
        station_id: id.into(),
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
    }
}

/// A charge point on the far side of a station link. It accepts every
/// charging profile and reports the limits it was given.
struct SimStation {
    inbound: mpsc::Sender<String>,
    replies: mpsc::UnboundedReceiver<Value>,
    limits: mpsc::UnboundedReceiver<u32>,
}

impl SimStation {
    fn connect(engine: &Engine, station_id: &str) -> Self {
        let mut link = engine.connect(station_id);
        let inbound = link.inbound.clone();
        let (replies_tx, replies) = mpsc::unbounded_channel();
        let (limits_tx, limits) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(text) = link.outbound.recv().await {
                match OcppMessage::parse(text.as_bytes()).unwrap() {
                    OcppMessage::Call(call) => {
                        let request: SetChargingProfileRequest = call.parse_payload().unwrap();
                        let limit = request.cs_charging_profiles.charging_schedule
                            .charging_schedule_period[0]
                            .limit;
                        let _ = limits_tx.send(limit as u32);
                        let result =
                            CallResult::new(call.message_id, json!({ "status": "Accepted" }))
                                .unwrap();
                        let bytes = result.to_bytes().unwrap();
                        let _ = link
                            .inbound
                            .send(String::from_utf8(bytes).unwrap())
                            .await;
                    }
                    _ => {
                        let _ = replies_tx.send(serde_json::from_str(&text).unwrap());
                    }
                }
            }
        });
        SimStation {
            inbound,
            replies,
            limits,
        }
    }

    async fn call(&mut self, action: &str, payload: Value) -> Value {
        let id = uuid::Uuid::new_v4().to_string();
        self.inbound
            .send(json!([2, id, action, payload]).to_string())
            .await
            .unwrap();
        let reply = self.replies.recv().await.unwrap();
        assert_eq!(reply[1], id.as_str());
        assert_eq!(reply[0], 3, "{action} answered with {reply}");
        reply[2].clone()
    }

    async fn next_limit(&mut self) -> u32 {
        tokio::time::timeout(Duration::from_secs(5), self.limits.recv())
            .await
            .unwrap()
            .unwrap()
    }
}

async fn next_event(events: &mut broadcast::Receiver<EventRecord>, matches: impl Fn(&EventRecord) -> bool) -> EventRecord {
    loop {
        let record = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        if matches(&record) {
            return record;
        }
    }
}

#[tokio::test]
async fn test_two_stations_share_a_group() {
    let store = Arc::new(SessionStore::default());
    store.register_group(ChargingGroup {
        id: GROUP,
        name: "Depot".into(),
        max_power: 30_000,
        current_power: 0,
        active: true,
        strategy: LoadBalancingStrategy::RoundRobin,
    });
    store.register_station(station("S1"));
    store.register_station(station("S2"));

    let bus = InMemoryBus::new(256);
    let mut events = bus.subscribe();
    let sink: Arc<dyn EventSink> = Arc::new(bus);
    let config = EngineConfig {
        // Passes are run by hand below
        scheduler: SchedulerConfig {
            interval: Duration::from_secs(3600),
            debounce: Duration::from_secs(3600),
            pass_timeout: Duration::from_secs(10),
        },
        ..EngineConfig::default()
    };
    let engine = Engine::start(config, store.clone(), sink);

    let mut s1 = SimStation::connect(&engine, "S1");
    let mut s2 = SimStation::connect(&engine, "S2");
    for sim in [&mut s1, &mut s2] {
        let boot = sim
            .call(
                "BootNotification",
                json!({"chargePointVendor": "Electra", "chargePointModel": "AC22"}),
            )
            .await;
        assert_eq!(boot["status"], "Accepted");
    }

    let start = |tx: &str, meter: u64| {
        json!({
            "connectorId": 1,
            "idTag": "TAG",
            "meterStart": meter,
            "timestamp": Utc::now(),
            "transactionId": tx
        })
    };
    let reply = s1.call("StartTransaction", start("T1", 1000)).await;
    assert_eq!(reply["idTagInfo"]["status"], "Accepted");
    let reply = s2.call("StartTransaction", start("T2", 500)).await;
    assert_eq!(reply["idTagInfo"]["status"], "Accepted");

    let report = engine.run_pass(GROUP).await.unwrap();
    assert_eq!(report.total, 30_000);
    assert_eq!(s1.next_limit().await, 15_000);
    assert_eq!(s2.next_limit().await, 15_000);
    assert_eq!(store.session("T1").unwrap().allocated_power, Some(15_000));
    assert_eq!(store.session("T2").unwrap().allocated_power, Some(15_000));
    assert_eq!(store.group(GROUP).unwrap().current_power, 30_000);

    s1.call(
        "MeterValues",
        json!({
            "connectorId": 1,
            "transactionId": "T1",
            "meterValue": [{"timestamp": Utc::now(), "sampledValue": [{"value": "1010"}]}]
        }),
    )
    .await;
    assert_eq!(store.session("T1").unwrap().energy, 10);

    s2.call(
        "StopTransaction",
        json!({"transactionId": "T2", "meterStop": 550, "timestamp": Utc::now()}),
    )
    .await;
    let t2 = store.session("T2").unwrap();
    assert_eq!(t2.status, SessionStatus::Completed);
    assert_eq!(t2.energy, 50);

    let report = engine.run_pass(GROUP).await.unwrap();
    assert_eq!(report.total, 22_000);
    assert_eq!(s1.next_limit().await, 22_000);
    assert_eq!(store.session("T1").unwrap().allocated_power, Some(22_000));
    assert_eq!(
        store.session("T1").unwrap().status,
        SessionStatus::Active
    );

    let ended = next_event(&mut events, |r| r.payload["eventType"] == "SESSION_ENDED").await;
    assert_eq!(ended.key, "S2");
    assert_eq!(ended.payload["transactionId"], "T2");
    assert_eq!(ended.payload["energy"], 50);
    let command = next_event(&mut events, |r| {
        r.topic == csms_core::POWER_DISTRIBUTION_TOPIC && r.payload["powerLimit"] == 22_000
    })
    .await;
    assert_eq!(command.key, "S1");
    assert_eq!(command.payload["reason"], "LOAD_BALANCING");

    engine.shutdown();
}
