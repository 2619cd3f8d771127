//! End-to-end engine tests: inbound MLLP through routing to outbound
//! delivery, against in-process echo responders.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use hermes::config::{Item, ProductionDocument};
use hermes::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use hermes::domain::{Direction, ItemName, MaxMessageSize, MessageState, ProjectId, SessionId};
use hermes::engine::{EngineSettings, ProductionEngine};
use hermes::envelope::{Envelope, Payload};
use hermes::hl7::{AckCode, Hl7Message};
use hermes::host::Host;
use hermes::hosts::{self, HL7_BODY_CLASS};
use hermes::mllp::{MllpDecoder, encode_frame};
use hermes::registry::{Broker, ServiceRegistry};
use hermes::store::{MessageFilter, MessageStore, SessionFilter, SqliteMessageStore, StoreWriter, status};
use hermes::trace::Tracer;
use hermes::wal::Wal;

const READ_TIMEOUT: Duration = Duration::from_secs(10);

fn adt_message(control_id: &str) -> Vec<u8> {
    format!(
        "MSH|^~\\&|SendApp|SendFac|RecvApp|RecvFac|20260101000000||ADT^A01|{control_id}|P|2.4\rPID|1||12345^^^MRN||Doe^John||19800101|M"
    )
    .into_bytes()
}

fn item_name(name: &str) -> ItemName {
    ItemName::try_new(name.to_string()).unwrap()
}

fn project_id() -> ProjectId {
    ProjectId::try_new("demo".to_string()).unwrap()
}

/// MLLP echo responder answering every message with the given ACK code.
/// Records the control ids it saw.
async fn spawn_echo(code: AckCode) -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_writer = Arc::clone(&seen);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                break;
            };
            let seen = Arc::clone(&seen_writer);
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut decoder =
                    MllpDecoder::new(read_half, MaxMessageSize::default(), READ_TIMEOUT);
                while let Ok(Some(payload)) = decoder.read_message().await {
                    let message = Hl7Message::parse(&payload).unwrap();
                    seen.lock()
                        .unwrap()
                        .push(message.control_id().unwrap_or("").to_string());
                    let ack = message.build_ack(code, None);
                    if write_half.write_all(&encode_frame(&ack)).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (port, seen)
}

/// Connects (with retries while the listener binds), sends one framed
/// message and returns the acknowledgement.
async fn send_and_await_ack(port: u16, message: &[u8]) -> Hl7Message {
    let mut stream = None;
    for _ in 0..100 {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(connected) => {
                stream = Some(connected);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let stream = stream.expect("service listener did not come up");
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(&encode_frame(message)).await.unwrap();

    let mut decoder = MllpDecoder::new(read_half, MaxMessageSize::default(), READ_TIMEOUT);
    let ack_raw = decoder
        .read_message()
        .await
        .unwrap()
        .expect("expected an acknowledgement");
    Hl7Message::parse(&ack_raw).unwrap()
}

async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn engine_fixture() -> (tempfile::TempDir, Arc<ProductionEngine>, Arc<Wal>) {
    let dir = tempfile::tempdir().unwrap();
    let wal = Arc::new(Wal::open(dir.path().join("wal")).unwrap());
    let db_path = DatabasePath::parse(dir.path().join("trace.db")).unwrap();
    let connection = DatabaseConnection::initialize(DatabaseConfig::for_testing(db_path))
        .await
        .unwrap();
    let store: Arc<dyn MessageStore> = Arc::new(SqliteMessageStore::new(connection));
    let settings = EngineSettings {
        supervisor_interval: Duration::from_millis(100),
        drain_timeout: Duration::from_secs(2),
        ..EngineSettings::default()
    };
    let engine = ProductionEngine::new(Arc::clone(&wal), store, settings);
    (dir, engine, wal)
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn hl7_production(
    in_port: u16,
    out_port: u16,
    reply_code_actions: &str,
    messaging_pattern: &str,
) -> ProductionDocument {
    serde_json::from_value(serde_json::json!({
        "name": "demo",
        "items": [
            {
                "name": "HL7.In",
                "item_type": "service",
                "class_name": "hl7.tcp_service",
                "adapter_settings": {"port": in_port, "bind_address": "127.0.0.1"},
                "host_settings": {
                    "target_config_names": ["HL7.Router"],
                    "messaging_pattern": messaging_pattern,
                    "ack_mode": "Application"
                }
            },
            {
                "name": "HL7.Router",
                "item_type": "process",
                "class_name": "hl7.router",
                "adapter_settings": {
                    "rules": [{
                        "name": "adt-to-out",
                        "condition": "{MSH-9.1} = \"ADT\"",
                        "action": "send",
                        "target": "HL7.Out"
                    }]
                }
            },
            {
                "name": "HL7.Out",
                "item_type": "operation",
                "class_name": "hl7.tcp_operation",
                "adapter_settings": {"ip_address": "127.0.0.1", "port": out_port},
                "host_settings": {
                    "reply_code_actions": reply_code_actions,
                    "max_retries": 0
                }
            }
        ]
    }))
    .unwrap()
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn inbound_routes_to_outbound_with_positive_ack() {
    let (_dir, engine, wal) = engine_fixture().await;
    let (out_port, seen) = spawn_echo(AckCode::Aa).await;
    let in_port = free_port();

    let document = hl7_production(in_port, out_port, ":?R=F,:*=S", "sync_reliable");
    engine.deploy(project_id(), document).await.unwrap();
    engine.start(&project_id()).await.unwrap();

    let ack = send_and_await_ack(in_port, &adt_message("MSG1")).await;
    assert_eq!(ack.ack_code(), Some(AckCode::Aa));
    assert_eq!(ack.acked_control_id(), Some("MSG1"));
    assert_eq!(seen.lock().unwrap().as_slice(), ["MSG1".to_string()]);

    // Every transition is terminal: nothing left to replay.
    assert!(wal.replay().unwrap().is_empty());

    // Three host visits share one session.
    let store = Arc::clone(engine.store());
    eventually("three trace rows in one session", || {
        let store = Arc::clone(&store);
        async move {
            let sessions = store.list_sessions(&SessionFilter::default()).await.unwrap();
            sessions.len() == 1 && sessions[0].message_count == 3
        }
    })
    .await;

    let sessions = store.list_sessions(&SessionFilter::default()).await.unwrap();
    let trace = store.session_trace(&sessions[0].session_id).await.unwrap();
    assert_eq!(trace.len(), 3);

    // Exactly one ingress row, and it has no source item.
    let inbound: Vec<_> = trace
        .iter()
        .filter(|r| r.direction == Direction::Inbound)
        .collect();
    assert_eq!(inbound.len(), 1);
    assert!(inbound[0].source_item.is_none());
    assert_eq!(inbound[0].item_name, "HL7.In");

    assert!(trace.iter().all(|r| r.status == status::COMPLETED));
    assert!(
        trace
            .iter()
            .all(|r| r.session_id == trace[0].session_id)
    );
    let outbound = trace
        .iter()
        .find(|r| r.direction == Direction::Outbound)
        .unwrap();
    assert_eq!(outbound.ack_type.as_deref(), Some("AA"));

    engine.shutdown(Duration::from_secs(2)).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn remote_reject_fails_message_and_nacks_ingress() {
    let (_dir, engine, _wal) = engine_fixture().await;
    let (out_port, _seen) = spawn_echo(AckCode::Ar).await;
    let in_port = free_port();

    let document = hl7_production(in_port, out_port, ":?R=F,:*=S", "sync_reliable");
    engine.deploy(project_id(), document).await.unwrap();
    engine.start(&project_id()).await.unwrap();

    // The reject propagates back through the synchronous chain as an
    // application error.
    let ack = send_and_await_ack(in_port, &adt_message("MSG1")).await;
    assert_eq!(ack.ack_code(), Some(AckCode::Ae));

    let store = Arc::clone(engine.store());
    eventually("failed outbound row and dead letter row", || {
        let store = Arc::clone(&store);
        async move {
            let failed = store
                .list_messages(&MessageFilter {
                    direction: Some(Direction::Outbound),
                    status: Some(status::FAILED.to_string()),
                    ..MessageFilter::for_project("demo")
                })
                .await
                .unwrap();
            let dead = store
                .list_messages(&MessageFilter {
                    status: Some(status::DEAD_LETTERED.to_string()),
                    ..MessageFilter::for_project("demo")
                })
                .await
                .unwrap();
            !failed.is_empty() && !dead.is_empty()
        }
    })
    .await;

    // No retry was attempted: the echo saw the message exactly once.
    assert_eq!(_seen.lock().unwrap().len(), 1);

    engine.shutdown(Duration::from_secs(2)).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn fanout_produces_one_session_with_three_rows() {
    let (_dir, engine, _wal) = engine_fixture().await;
    let (port_a, seen_a) = spawn_echo(AckCode::Aa).await;
    let (port_b, seen_b) = spawn_echo(AckCode::Aa).await;
    let in_port = free_port();

    let document: ProductionDocument = serde_json::from_value(serde_json::json!({
        "name": "demo",
        "items": [
            {
                "name": "HL7.In",
                "item_type": "service",
                "class_name": "hl7.tcp_service",
                "adapter_settings": {"port": in_port, "bind_address": "127.0.0.1"},
                "host_settings": {
                    "target_config_names": ["Out.A", "Out.B"],
                    "messaging_pattern": "async_reliable",
                    "ack_mode": "Application"
                }
            },
            {
                "name": "Out.A",
                "item_type": "operation",
                "class_name": "hl7.tcp_operation",
                "adapter_settings": {"ip_address": "127.0.0.1", "port": port_a}
            },
            {
                "name": "Out.B",
                "item_type": "operation",
                "class_name": "hl7.tcp_operation",
                "adapter_settings": {"ip_address": "127.0.0.1", "port": port_b}
            }
        ]
    }))
    .unwrap();

    engine.deploy(project_id(), document).await.unwrap();
    engine.start(&project_id()).await.unwrap();

    let ack = send_and_await_ack(in_port, &adt_message("FAN1")).await;
    assert_eq!(ack.ack_code(), Some(AckCode::Aa));

    eventually("both operations deliver", || async {
        seen_a.lock().unwrap().len() == 1 && seen_b.lock().unwrap().len() == 1
    })
    .await;

    let sessions = engine
        .list_sessions(&project_id(), SessionFilter::default())
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);

    let engine2 = Arc::clone(&engine);
    let session_id = sessions[0].session_id.clone();
    eventually("session has three rows", || {
        let engine = Arc::clone(&engine2);
        let session_id = session_id.clone();
        async move {
            let view = engine.get_session_trace(&session_id).await.unwrap();
            view.rows.len() == 3
        }
    })
    .await;

    let view = engine.get_session_trace(&session_id).await.unwrap();
    let inbound = view
        .rows
        .iter()
        .filter(|r| r.direction == Direction::Inbound)
        .count();
    let outbound = view
        .rows
        .iter()
        .filter(|r| r.direction == Direction::Outbound)
        .count();
    assert_eq!(inbound, 1);
    assert_eq!(outbound, 2);
    // Rows come back ordered by visit time.
    assert!(view.rows.windows(2).all(|w| w[0].received_at <= w[1].received_at));

    engine.shutdown(Duration::from_secs(2)).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_send_returns_the_remote_ack() {
    let (_dir, engine, _wal) = engine_fixture().await;
    let (out_port, _seen) = spawn_echo(AckCode::Aa).await;

    let document: ProductionDocument = serde_json::from_value(serde_json::json!({
        "name": "demo",
        "items": [{
            "name": "HL7.Out",
            "item_type": "operation",
            "class_name": "hl7.tcp_operation",
            "adapter_settings": {"ip_address": "127.0.0.1", "port": out_port}
        }]
    }))
    .unwrap();

    engine.deploy(project_id(), document).await.unwrap();
    engine.start(&project_id()).await.unwrap();

    let report = engine
        .test_send(&project_id(), &item_name("HL7.Out"), adt_message("TST1"))
        .await
        .unwrap();

    assert!(report.session_id.starts_with("SES-test-"));
    assert_eq!(report.ack_type.as_deref(), Some("AA"));
    let ack = Hl7Message::parse(report.ack.unwrap().as_bytes()).unwrap();
    assert_eq!(ack.acked_control_id(), Some("TST1"));

    engine.shutdown(Duration::from_secs(2)).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn immediate_mode_commit_acks_after_wal_persist() {
    let (_dir, engine, wal) = engine_fixture().await;
    let in_port = free_port();

    let document: ProductionDocument = serde_json::from_value(serde_json::json!({
        "name": "demo",
        "items": [{
            "name": "HL7.In",
            "item_type": "service",
            "class_name": "hl7.tcp_service",
            "adapter_settings": {"port": in_port, "bind_address": "127.0.0.1"},
            "host_settings": {"ack_mode": "Immediate"}
        }]
    }))
    .unwrap();

    engine.deploy(project_id(), document).await.unwrap();
    engine.start(&project_id()).await.unwrap();

    let ack = send_and_await_ack(in_port, &adt_message("IMM1")).await;
    assert_eq!(ack.ack_code(), Some(AckCode::Ca));
    assert_eq!(ack.acked_control_id(), Some("IMM1"));

    // The commit-accept contract: the record was durable before the ACK.
    let recorded = wal
        .scan()
        .unwrap()
        .iter()
        .any(|r| r.envelope.payload.raw.windows(4).any(|w| w == b"IMM1"));
    assert!(recorded);

    engine.shutdown(Duration::from_secs(2)).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn undecodable_message_is_dead_lettered() {
    let (_dir, engine, _wal) = engine_fixture().await;
    let in_port = free_port();

    let document: ProductionDocument = serde_json::from_value(serde_json::json!({
        "name": "demo",
        "items": [{
            "name": "HL7.In",
            "item_type": "service",
            "class_name": "hl7.tcp_service",
            "adapter_settings": {"port": in_port, "bind_address": "127.0.0.1"},
            "host_settings": {"ack_mode": "Never"}
        }]
    }))
    .unwrap();

    engine.deploy(project_id(), document).await.unwrap();
    engine.start(&project_id()).await.unwrap();

    // A well-framed payload that is not HL7 at all.
    let mut stream = None;
    for _ in 0..100 {
        match TcpStream::connect(("127.0.0.1", in_port)).await {
            Ok(connected) => {
                stream = Some(connected);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let mut stream = stream.expect("listener up");
    stream
        .write_all(&encode_frame(b"this is not an hl7 message"))
        .await
        .unwrap();

    let store = Arc::clone(engine.store());
    eventually("bad message dead-lettered", || {
        let store = Arc::clone(&store);
        async move {
            !store
                .list_messages(&MessageFilter {
                    status: Some(status::DEAD_LETTERED.to_string()),
                    ..MessageFilter::for_project("demo")
                })
                .await
                .unwrap()
                .is_empty()
        }
    })
    .await;

    engine.shutdown(Duration::from_secs(2)).await;
}

#[test_log::test(tokio::test)]
async fn deploy_rejects_invalid_configuration() {
    let (_dir, engine, _wal) = engine_fixture().await;

    let document: ProductionDocument = serde_json::from_value(serde_json::json!({
        "name": "demo",
        "items": [{
            "name": "HL7.In",
            "item_type": "service",
            "class_name": "hl7.tcp_service",
            "adapter_settings": {"port": 0},
            "host_settings": {"target_config_names": ["Missing.Target"]}
        }]
    }))
    .unwrap();

    let err = engine.deploy(project_id(), document).await.unwrap_err();
    match err {
        hermes::EngineError::InvalidConfig { items } => {
            assert!(items.iter().any(|p| p.contains("Missing.Target")));
        }
        other => panic!("expected InvalidConfig, got {other}"),
    }

    engine.shutdown(Duration::from_secs(1)).await;
}

// ---------------------------------------------------------------------------
// Component-level scenarios: broker + hosts without the TCP ingress.
// ---------------------------------------------------------------------------

struct Rig {
    _dir: tempfile::TempDir,
    wal: Arc<Wal>,
    store: Arc<SqliteMessageStore>,
    registry: Arc<ServiceRegistry>,
    broker: Broker,
    tracer: Tracer,
}

async fn rig() -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let wal = Arc::new(Wal::open(dir.path().join("wal")).unwrap());
    let db_path = DatabasePath::parse(dir.path().join("trace.db")).unwrap();
    let connection = DatabaseConnection::initialize(DatabaseConfig::for_testing(db_path))
        .await
        .unwrap();
    let store = Arc::new(SqliteMessageStore::new(connection));
    let (writer, _task) = StoreWriter::spawn(Arc::clone(&store) as Arc<dyn MessageStore>);
    let tracer = Tracer::new("demo", writer);
    let registry = Arc::new(ServiceRegistry::new());
    let broker = Broker::new(Arc::clone(&registry), Arc::clone(&wal), tracer.clone());
    Rig {
        _dir: dir,
        wal,
        store,
        registry,
        broker,
        tracer,
    }
}

impl Rig {
    async fn add_host(&self, item_json: serde_json::Value) -> Arc<Host> {
        let item: Item = serde_json::from_value(item_json).unwrap();
        let behaviour = hosts::build_behaviour(&item).unwrap();
        let host = Host::new(item, behaviour).unwrap();
        host.attach(self.broker.clone(), self.tracer.clone(), Arc::clone(&self.wal));
        self.registry.register(Arc::clone(&host));
        host.init().await.unwrap();
        host
    }
}

fn hl7_envelope(control_id: &str) -> Envelope {
    Envelope::new(HL7_BODY_CLASS, Payload::hl7(adt_message(control_id)))
        .with_session(SessionId::ingress())
        .with_message_type("ADT^A01")
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn overflow_drop_oldest_dead_letters_the_head() {
    let rig = rig().await;
    let (out_port, seen) = spawn_echo(AckCode::Aa).await;

    let host = rig
        .add_host(serde_json::json!({
            "name": "HL7.Out",
            "item_type": "operation",
            "class_name": "hl7.tcp_operation",
            "adapter_settings": {"ip_address": "127.0.0.1", "port": out_port},
            "host_settings": {
                "queue_size": 2,
                "overflow_strategy": "drop_oldest",
                "max_retries": 0
            }
        }))
        .await;

    host.start().await.unwrap();
    host.pause().unwrap();

    let source = item_name("Test.Source");
    let target = item_name("HL7.Out");
    let m1 = hl7_envelope("M1");
    let m1_id = m1.message_id;
    for envelope in [m1, hl7_envelope("M2"), hl7_envelope("M3")] {
        rig.broker
            .send_request_async(&source, &target, envelope)
            .await
            .unwrap();
    }

    // Head displaced, newest two kept.
    assert_eq!(host.queue().len(), 2);

    let store = Arc::clone(&rig.store);
    eventually("displaced head dead-lettered", || {
        let store = Arc::clone(&store);
        async move {
            store
                .get_message(m1_id)
                .await
                .unwrap()
                .is_some_and(|row| row.status == status::DEAD_LETTERED)
        }
    })
    .await;

    // Resume: the survivors deliver in order.
    host.resume().unwrap();
    eventually("m2 and m3 delivered in order", || async {
        seen.lock().unwrap().as_slice() == ["M2".to_string(), "M3".to_string()]
    })
    .await;

    host.stop(Duration::from_secs(2)).await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn routing_loop_is_dead_lettered_at_the_hop_limit() {
    let rig = rig().await;

    let host = rig
        .add_host(serde_json::json!({
            "name": "HL7.Loop",
            "item_type": "process",
            "class_name": "hl7.router",
            "adapter_settings": {
                "rules": [{
                    "name": "echo-chamber",
                    "condition": "{MSH-9.1} = \"ADT\"",
                    "action": "send",
                    "target": "HL7.Loop"
                }]
            },
            "host_settings": {"hop_limit": 10}
        }))
        .await;
    host.start().await.unwrap();

    let source = item_name("Test.Source");
    let target = item_name("HL7.Loop");
    rig.broker
        .send_request_async(&source, &target, hl7_envelope("LOOP1"))
        .await
        .unwrap();

    let store = Arc::clone(&rig.store);
    eventually("loop dead-lettered", || {
        let store = Arc::clone(&store);
        async move {
            let dead = store
                .list_messages(&MessageFilter {
                    status: Some(status::DEAD_LETTERED.to_string()),
                    ..MessageFilter::for_project("demo")
                })
                .await
                .unwrap();
            dead.iter()
                .any(|row| row.error_message.as_deref().is_some_and(|e| e.contains("loop")))
        }
    })
    .await;

    // No enqueue past the hop limit: the WAL shows at most ten enqueued
    // records for the whole chain, and the queue went quiet.
    eventually("queue drained", || async { host.queue().is_empty() }).await;
    let enqueued = rig
        .wal
        .scan()
        .unwrap()
        .into_iter()
        .filter(|r| r.envelope.state == MessageState::Enqueued)
        .count();
    assert!(enqueued <= 10, "expected at most 10 enqueues, saw {enqueued}");

    host.stop(Duration::from_secs(2)).await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn hot_reload_preserves_queued_messages() {
    let rig = rig().await;
    let (out_port, seen) = spawn_echo(AckCode::Aa).await;

    let item_json = serde_json::json!({
        "name": "HL7.Out",
        "item_type": "operation",
        "class_name": "hl7.tcp_operation",
        "adapter_settings": {"ip_address": "127.0.0.1", "port": out_port},
        "host_settings": {"queue_size": 200, "max_retries": 0}
    });
    let host = rig.add_host(item_json.clone()).await;
    host.start().await.unwrap();
    host.pause().unwrap();

    let source = item_name("Test.Source");
    let target = item_name("HL7.Out");
    for i in 0..100 {
        rig.broker
            .send_request_async(&source, &target, hl7_envelope(&format!("R{i:03}")))
            .await
            .unwrap();
    }
    assert_eq!(host.queue().len(), 100);

    // Reload with a bigger pool; the queue must survive untouched.
    let mut reloaded: Item = serde_json::from_value(item_json).unwrap();
    reloaded.pool_size = Some(4);
    host.reload(reloaded).await.unwrap();
    assert_eq!(host.queue().len(), 100);

    host.resume().unwrap();
    eventually("all 100 queued messages deliver", || async {
        seen.lock().unwrap().len() == 100
    })
    .await;

    // Session chains stayed intact across the reload.
    let store = Arc::clone(&rig.store);
    eventually("100 completed outbound rows", || {
        let store = Arc::clone(&store);
        async move {
            store
                .list_messages(&MessageFilter {
                    status: Some(status::COMPLETED.to_string()),
                    limit: 500,
                    ..MessageFilter::for_project("demo")
                })
                .await
                .unwrap()
                .len()
                == 100
        }
    })
    .await;

    host.stop(Duration::from_secs(2)).await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn wal_replay_redelivers_unfinished_messages() {
    let rig = rig().await;
    let (out_port, seen) = spawn_echo(AckCode::Aa).await;

    let host = rig
        .add_host(serde_json::json!({
            "name": "HL7.Out",
            "item_type": "operation",
            "class_name": "hl7.tcp_operation",
            "adapter_settings": {"ip_address": "127.0.0.1", "port": out_port},
            "host_settings": {"max_retries": 0}
        }))
        .await;

    // A record left enqueued by a previous run.
    let stranded = hl7_envelope("LOST1")
        .with_destination(item_name("HL7.Out"))
        .with_state(MessageState::Enqueued);
    rig.wal.append_sync(&stranded).unwrap();

    for envelope in rig.wal.replay().unwrap() {
        let destination = envelope.routing.destination.clone().unwrap();
        let target = rig.registry.get(&destination).unwrap();
        target.queue().try_enqueue(envelope).unwrap();
    }

    host.start().await.unwrap();
    eventually("stranded message delivered", || async {
        seen.lock().unwrap().as_slice() == ["LOST1".to_string()]
    })
    .await;

    host.stop(Duration::from_secs(2)).await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn sync_request_times_out_when_no_worker_answers() {
    let rig = rig().await;

    // A host that is deployed but never started: nothing consumes its queue.
    let _host = rig
        .add_host(serde_json::json!({
            "name": "HL7.Idle",
            "item_type": "process",
            "class_name": "passthrough",
            "adapter_settings": {}
        }))
        .await;

    let source = item_name("Test.Source");
    let target = item_name("HL7.Idle");
    let err = rig
        .broker
        .send_request_sync(
            &source,
            &target,
            hl7_envelope("SYNC1"),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, hermes::EngineError::Timeout { .. }));

    // The slot is cleaned up.
    let replayed = rig.wal.replay().unwrap();
    assert!(
        replayed.is_empty(),
        "timed-out request should be terminal, found {replayed:?}"
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn unknown_target_is_dead_lettered() {
    let rig = rig().await;
    let source = item_name("Test.Source");
    let target = item_name("HL7.Nowhere");

    let err = rig
        .broker
        .send_request_async(&source, &target, hl7_envelope("GONE1"))
        .await
        .unwrap_err();
    assert!(matches!(err, hermes::EngineError::UnknownTarget { .. }));

    let store = Arc::clone(&rig.store);
    eventually("dead letter row written", || {
        let store = Arc::clone(&store);
        async move {
            !store
                .list_messages(&MessageFilter {
                    status: Some(status::DEAD_LETTERED.to_string()),
                    ..MessageFilter::for_project("demo")
                })
                .await
                .unwrap()
                .is_empty()
        }
    })
    .await;
}
