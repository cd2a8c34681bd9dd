use domain::{Direction, ProcessingStatus};
use iotgw_bridge::{
    BridgeConfig, BridgeError, DecodedFrame, DnyFrameDecoder, HandlerError, ProcessOutcome,
    ProtocolBridge, ProtocolHandler,
};
use iotgw_databus::{DataBus, DataBusConfig, EventPublisher, PublisherConfig};
use iotgw_eventbus::{BusEvent, ChannelSubscriber, EventCategory, ProtocolEventKind};
use iotgw_session::{ConnectionInfo, SessionConfig, SessionManager, TcpSession};
use iotgw_storage::InMemoryStorageManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const PHYSICAL_ID: u32 = 0x04A2_28CD;
const ICCID: &str = "89860318123456789012";

struct Harness {
    data_bus: Arc<DataBus>,
    sessions: Arc<SessionManager>,
    bridge: ProtocolBridge,
}

async fn harness(config: BridgeConfig) -> Harness {
    let storage = Arc::new(InMemoryStorageManager::new());
    let data_bus = Arc::new(DataBus::new(storage, DataBusConfig::default()));
    data_bus.start().await.expect("data bus");
    let publisher = Arc::new(EventPublisher::new(
        data_bus.event_bus(),
        PublisherConfig {
            enable_queue: false,
            ..PublisherConfig::default()
        },
    ));
    publisher.start().await;
    let sessions = Arc::new(SessionManager::new(
        SessionConfig::default(),
        data_bus.clone(),
        publisher.clone(),
    ));
    let bridge = ProtocolBridge::new(
        config,
        data_bus.clone(),
        sessions.clone(),
        publisher,
        Arc::new(DnyFrameDecoder::new()),
    );
    Harness {
        data_bus,
        sessions,
        bridge,
    }
}

async fn protocol_events(h: &Harness) -> UnboundedReceiver<BusEvent> {
    let (subscriber, rx) = ChannelSubscriber::new();
    h.data_bus
        .subscribe_with(EventCategory::Protocol, Arc::new(subscriber))
        .await;
    rx
}

async fn collect_kinds(
    rx: &mut UnboundedReceiver<BusEvent>,
    wanted: usize,
) -> Vec<ProtocolEventKind> {
    let mut kinds = Vec::new();
    while kinds.len() < wanted {
        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .expect("event");
        if let BusEvent::Protocol(event) = event {
            kinds.push(event.kind);
        }
    }
    // 留出时间暴露多余事件
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = rx.try_recv() {
        if let BusEvent::Protocol(event) = event {
            kinds.push(event.kind);
        }
    }
    kinds
}

enum Behavior {
    Succeed,
    Fail,
    Hang,
}

struct TestHandler {
    command: u8,
    behavior: Behavior,
    calls: AtomicUsize,
    saw_session: AtomicUsize,
}

impl TestHandler {
    fn new(command: u8, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            command,
            behavior,
            calls: AtomicUsize::new(0),
            saw_session: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl ProtocolHandler for TestHandler {
    async fn handle_protocol_data(
        &self,
        _frame: &DecodedFrame,
        _conn: &ConnectionInfo,
        session: Option<&TcpSession>,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if session.is_some() {
            self.saw_session.fetch_add(1, Ordering::SeqCst);
        }
        match self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(HandlerError::Failed("bad payload".to_string())),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        }
    }

    fn command_id(&self) -> u8 {
        self.command
    }

    fn handler_name(&self) -> &str {
        "test"
    }
}

fn conn(conn_id: u64) -> ConnectionInfo {
    ConnectionInfo::new(conn_id, "10.0.0.8:52011")
}

#[tokio::test]
async fn empty_input_fails_before_any_event() {
    let h = harness(BridgeConfig::default()).await;
    let mut rx = protocol_events(&h).await;
    let err = h
        .bridge
        .process_incoming_data(&conn(1), &[])
        .await
        .expect_err("empty");
    assert!(matches!(err, BridgeError::EmptyData));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    let stats = h.bridge.statistics();
    assert_eq!(stats.frames_rejected, 1);
    assert_eq!(stats.frames_received, 0);
}

#[tokio::test]
async fn oversize_and_malformed_frames_are_reported() {
    let h = harness(BridgeConfig {
        max_payload_size: 16,
        ..BridgeConfig::default()
    })
    .await;
    let big = DnyFrameDecoder::encode(PHYSICAL_ID, 1, 0x21, &[0u8; 32]);
    assert!(matches!(
        h.bridge.process_incoming_data(&conn(1), &big).await,
        Err(BridgeError::PayloadTooLarge { max: 16, .. })
    ));
    assert!(matches!(
        h.bridge.process_incoming_data(&conn(1), b"hello world!!!").await,
        Err(BridgeError::Parse(_))
    ));
    let no_payload = DnyFrameDecoder::encode(PHYSICAL_ID, 2, 0x21, &[]);
    assert!(matches!(
        h.bridge.process_incoming_data(&conn(1), &no_payload).await,
        Err(BridgeError::InvalidFrame(_))
    ));
    let stats = h.bridge.statistics();
    assert_eq!(stats.frames_rejected, 1);
    assert_eq!(stats.parse_errors, 2);
}

#[tokio::test]
async fn unknown_command_records_once_without_dispatch() {
    let h = harness(BridgeConfig::default()).await;
    let handler = TestHandler::new(0x21, Behavior::Succeed);
    h.bridge.register_protocol_handler(handler.clone()).await;
    let mut rx = protocol_events(&h).await;

    let frame = DnyFrameDecoder::encode(PHYSICAL_ID, 9, 0x7E, &[0x01]);
    let outcome = h
        .bridge
        .process_incoming_data(&conn(3), &frame)
        .await
        .expect("process");
    assert_eq!(outcome, ProcessOutcome::UnknownCommand { command: 0x7E });
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

    let record = h.data_bus.get_protocol_data(3, 9).await.expect("record");
    assert_eq!(record.version, 1);
    assert_eq!(record.status, ProcessingStatus::Parsed);
    assert_eq!(record.direction, Direction::Inbound);
    assert_eq!(record.device_id, "04A228CD");

    let kinds = collect_kinds(&mut rx, 2).await;
    assert_eq!(
        kinds.iter().filter(|k| **k == ProtocolEventKind::Received).count(),
        1
    );
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == ProtocolEventKind::UnknownCommand)
            .count(),
        1
    );
    assert_eq!(kinds.len(), 2);
    assert_eq!(h.bridge.statistics().unknown_commands, 1);
}

#[tokio::test]
async fn handler_outcomes_feed_command_stats() {
    let h = harness(BridgeConfig {
        processing_timeout: Duration::from_millis(20),
        ..BridgeConfig::default()
    })
    .await;
    let ok = TestHandler::new(0x21, Behavior::Succeed);
    let failing = TestHandler::new(0x22, Behavior::Fail);
    let hanging = TestHandler::new(0x23, Behavior::Hang);
    for handler in [ok.clone(), failing.clone(), hanging.clone()] {
        h.bridge.register_protocol_handler(handler).await;
    }
    assert_eq!(h.bridge.handler_count().await, 3);

    h.sessions.create_session(conn(4)).await.expect("session");
    h.sessions
        .register_device(4, "04A228CD", "", ICCID, 1)
        .await
        .expect("register");

    for message_id in [1u16, 2] {
        let frame = DnyFrameDecoder::encode(PHYSICAL_ID, message_id, 0x21, &[0x00]);
        let outcome = h
            .bridge
            .process_incoming_data(&conn(4), &frame)
            .await
            .expect("ok");
        assert!(matches!(outcome, ProcessOutcome::Processed { command: 0x21, .. }));
    }
    assert_eq!(ok.saw_session.load(Ordering::SeqCst), 2);

    let frame = DnyFrameDecoder::encode(PHYSICAL_ID, 3, 0x22, &[0x00]);
    let outcome = h
        .bridge
        .process_incoming_data(&conn(4), &frame)
        .await
        .expect("handler failure is not a bridge error");
    assert!(matches!(outcome, ProcessOutcome::HandlerFailed { command: 0x22, .. }));

    let frame = DnyFrameDecoder::encode(PHYSICAL_ID, 4, 0x23, &[0x00]);
    let outcome = h
        .bridge
        .process_incoming_data(&conn(4), &frame)
        .await
        .expect("timeout is not a bridge error");
    assert_eq!(outcome, ProcessOutcome::TimedOut { command: 0x23 });

    let stats = h.bridge.command_stats(0x21).expect("0x21");
    assert_eq!((stats.count, stats.success, stats.error), (2, 2, 0));
    let stats = h.bridge.command_stats(0x22).expect("0x22");
    assert_eq!((stats.count, stats.success, stats.error), (1, 0, 1));
    let stats = h.bridge.command_stats(0x23).expect("0x23");
    assert_eq!((stats.count, stats.error, stats.timeout), (1, 1, 1));

    let record = h.data_bus.get_protocol_data(4, 1).await.expect("processed");
    assert_eq!(record.status, ProcessingStatus::Processed);
    assert_eq!(record.version, 2);
    let record = h.data_bus.get_protocol_data(4, 3).await.expect("failed");
    assert_eq!(record.status, ProcessingStatus::Error);
    assert!(record.error.is_some());
    let record = h.data_bus.get_protocol_data(4, 4).await.expect("timed out");
    assert_eq!(record.status, ProcessingStatus::Timeout);

    let session = h.sessions.get_session(4).await.expect("session");
    assert_eq!(session.message_count, 4);
    assert_eq!(h.bridge.statistics().frames_received, 4);
}

#[tokio::test]
async fn last_registration_wins() {
    let h = harness(BridgeConfig::default()).await;
    let first = TestHandler::new(0x21, Behavior::Fail);
    let second = TestHandler::new(0x21, Behavior::Succeed);
    assert!(h.bridge.register_protocol_handler(first.clone()).await.is_none());
    assert!(h.bridge.register_protocol_handler(second.clone()).await.is_some());
    assert_eq!(h.bridge.handler_count().await, 1);

    let frame = DnyFrameDecoder::encode(PHYSICAL_ID, 1, 0x21, &[0x00]);
    let outcome = h
        .bridge
        .process_incoming_data(&conn(5), &frame)
        .await
        .expect("process");
    assert!(matches!(outcome, ProcessOutcome::Processed { .. }));
    assert_eq!(first.calls.load(Ordering::SeqCst), 0);
    assert_eq!(second.calls.load(Ordering::SeqCst), 1);

    assert!(h.bridge.unregister_protocol_handler(0x21).await.is_some());
    let frame = DnyFrameDecoder::encode(PHYSICAL_ID, 2, 0x21, &[0x00]);
    assert_eq!(
        h.bridge
            .process_incoming_data(&conn(5), &frame)
            .await
            .expect("process"),
        ProcessOutcome::UnknownCommand { command: 0x21 }
    );
}

#[tokio::test]
async fn outgoing_frames_are_recorded_and_announced() {
    let h = harness(BridgeConfig::default()).await;
    let mut rx = protocol_events(&h).await;
    let frame = DnyFrameDecoder::encode(PHYSICAL_ID, 11, 0x82, &[0x01, 0x00]);
    let record = h
        .bridge
        .process_outgoing_data(&conn(6), &frame)
        .await
        .expect("outgoing");
    assert_eq!(record.direction, Direction::Outbound);
    assert_eq!(record.command, 0x82);
    assert_eq!(record.message_id, 11);

    let kinds = collect_kinds(&mut rx, 1).await;
    assert_eq!(kinds, vec![ProtocolEventKind::Sent]);
    assert_eq!(h.bridge.statistics().frames_sent, 1);
    assert!(matches!(
        h.bridge.process_outgoing_data(&conn(6), &[]).await,
        Err(BridgeError::EmptyData)
    ));
}
