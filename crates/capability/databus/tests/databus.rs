use domain::{
    BusinessState, ConnectionState, DeviceData, DeviceState, Direction, OrderData, OrderStatus,
    PortData, ProcessingStatus, ProtocolData, StateSnapshot, StateTransition,
};
use iotgw_databus::{DataBus, DataBusConfig, DataBusError, DataOperation, StateUpdate};
use iotgw_eventbus::{
    BusEvent, ChannelSubscriber, DeviceEventKind, EventCategory, OrderEventKind,
    ProtocolEventKind,
};
use iotgw_storage::InMemoryStorageManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

async fn running_bus(config: DataBusConfig) -> DataBus {
    let storage = Arc::new(InMemoryStorageManager::new());
    let bus = DataBus::new(storage, config);
    bus.start().await.expect("start");
    bus
}

fn device() -> DeviceData {
    DeviceData::new("04A228CD", 0x04A2_28CD, "89860318123456789012", 42, 1)
        .with_remote_addr("10.0.0.8:52011")
}

async fn next_event(rx: &mut UnboundedReceiver<BusEvent>) -> BusEvent {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event timeout")
        .expect("event")
}

async fn channel(bus: &DataBus, category: EventCategory) -> UnboundedReceiver<BusEvent> {
    let (subscriber, rx) = ChannelSubscriber::new();
    bus.subscribe_with(category, Arc::new(subscriber)).await;
    rx
}

#[tokio::test]
async fn operations_fail_when_stopped() {
    let bus = running_bus(DataBusConfig::default()).await;
    bus.start().await.expect("start twice");
    bus.stop().await.expect("stop");
    bus.stop().await.expect("stop twice");
    assert!(!bus.is_running());
    assert!(matches!(
        bus.publish_device_data(device()).await,
        Err(DataBusError::NotRunning)
    ));
    assert!(matches!(
        bus.get_device_data("04A228CD").await,
        Err(DataBusError::NotRunning)
    ));
}

#[tokio::test]
async fn device_publish_emits_registered_then_updated() {
    let bus = running_bus(DataBusConfig::default()).await;
    let mut rx = channel(&bus, EventCategory::Device).await;

    let saved = bus.publish_device_data(device()).await.expect("publish");
    assert_eq!(saved.version, 1);
    let BusEvent::Device(event) = next_event(&mut rx).await else {
        panic!("expected device event");
    };
    assert_eq!(event.kind, DeviceEventKind::Registered);
    assert_eq!(event.device_id, "04A228CD");

    bus.publish_device_data(device()).await.expect("publish");
    let BusEvent::Device(event) = next_event(&mut rx).await else {
        panic!("expected device event");
    };
    assert_eq!(event.kind, DeviceEventKind::Updated);

    let loaded = bus.get_device_data("04A228CD").await.expect("get");
    assert_eq!(loaded.version, 2);
    assert!(
        bus.get_device_data("0000ABCD")
            .await
            .expect_err("missing")
            .is_not_found()
    );
    bus.stop().await.expect("stop");
}

#[tokio::test]
async fn invalid_device_is_rejected_before_persistence() {
    let bus = running_bus(DataBusConfig::default()).await;
    let mut invalid = device();
    invalid.iccid = "12345".to_string();
    assert!(matches!(
        bus.publish_device_data(invalid).await,
        Err(DataBusError::Validation(_))
    ));
    assert!(bus.get_device_data("04A228CD").await.is_err());
    assert_eq!(bus.health().await.consistency.validation_failures, 1);
}

#[tokio::test]
async fn state_change_event_only_on_significant_change() {
    let bus = running_bus(DataBusConfig::default()).await;
    let mut rx = channel(&bus, EventCategory::StateChange).await;

    let outcome = bus
        .publish_state_change(
            "04A228CD",
            StateUpdate::new("registered")
                .connection(ConnectionState::Connected)
                .business(BusinessState::Online),
        )
        .await
        .expect("online");
    assert!(outcome.significant);
    let BusEvent::StateChange(event) = next_event(&mut rx).await else {
        panic!("expected state change");
    };
    assert_eq!(event.current.connection, ConnectionState::Connected);
    assert_eq!(event.previous.connection, ConnectionState::Disconnected);

    for _ in 0..3 {
        bus.publish_state_change("04A228CD", StateUpdate::heartbeat())
            .await
            .expect("heartbeat");
    }
    bus.stop().await.expect("stop");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn ports_are_listed_in_order() {
    let bus = running_bus(DataBusConfig::default()).await;
    for port in [2, 1] {
        let mut data = PortData::new("04A228CD", port);
        data.voltage_v = 220.0;
        bus.publish_port_data(data).await.expect("port");
    }
    let ports = bus.list_device_ports("04A228CD").await.expect("list");
    assert_eq!(
        ports.iter().map(|p| p.port_number).collect::<Vec<_>>(),
        vec![1, 2]
    );
    bus.delete_port_data("04A228CD", 1).await.expect("delete");
    assert!(
        bus.get_port_data("04A228CD", 1)
            .await
            .expect_err("deleted")
            .is_not_found()
    );
}

#[tokio::test]
async fn order_lifecycle_and_ceiling() {
    let bus = running_bus(DataBusConfig {
        max_active_orders: 1,
        ..DataBusConfig::default()
    })
    .await;
    let mut rx = channel(&bus, EventCategory::Order).await;

    let mut order = OrderData::new("ORD-20240101", "04A228CD", 1);
    order.start_time_ms = Some(domain::now_epoch_ms());
    bus.publish_order_data(order).await.expect("create");
    let BusEvent::Order(event) = next_event(&mut rx).await else {
        panic!("expected order event");
    };
    assert_eq!(event.kind, OrderEventKind::Created);

    let err = bus
        .publish_order_data(OrderData::new("ORD-20240102", "04A228CD", 2))
        .await
        .expect_err("ceiling");
    assert!(matches!(err, DataBusError::Capacity(_)));

    let active = bus
        .get_active_order("04A228CD", 1)
        .await
        .expect("active")
        .expect("some");
    assert_eq!(active.order_id, "ORD-20240101");

    let completed = bus.complete_order("ORD-20240101").await.expect("complete");
    assert_eq!(completed.status, OrderStatus::Completed);
    assert!(completed.end_time_ms >= completed.start_time_ms);
    let BusEvent::Order(event) = next_event(&mut rx).await else {
        panic!("expected order event");
    };
    assert_eq!(event.kind, OrderEventKind::Completed);
    assert!(
        bus.get_active_order("04A228CD", 1)
            .await
            .expect("active")
            .is_none()
    );
    bus.stop().await.expect("stop");
}

fn with_history(device_id: &str, entries: i64) -> DeviceState {
    let mut state = DeviceState::new(device_id);
    for idx in 0..entries {
        state.history.push_back(StateTransition {
            from: StateSnapshot::default(),
            to: StateSnapshot::default(),
            reason: format!("imported-{}", idx),
            at_ms: idx,
        });
    }
    state
}

#[tokio::test]
async fn whole_state_writes_respect_history_cap() {
    let bus = running_bus(DataBusConfig {
        state_history_size: 2,
        ..DataBusConfig::default()
    })
    .await;

    let outcome = bus
        .publish_device_state(with_history("04A228CD", 5), "import")
        .await
        .expect("publish");
    assert!(!outcome.significant);
    let stored = bus.get_device_state("04A228CD").await.expect("state");
    let reasons: Vec<_> = stored.history.iter().map(|t| t.reason.as_str()).collect();
    assert_eq!(reasons, vec!["imported-3", "imported-4"]);

    // 显著变化追加的一条同样计入上限
    let mut changed = with_history("04A228CE", 4);
    changed.connection_state = ConnectionState::Connected;
    let result = bus
        .batch_update(vec![DataOperation::SetState(changed)])
        .await
        .expect("batch");
    assert_eq!(result.succeeded, 1);
    let stored = bus.get_device_state("04A228CE").await.expect("state");
    assert_eq!(stored.history.len(), 2);
    assert_eq!(stored.history[1].reason, "batch");

    let outcome = bus
        .publish_state_change(
            "04A228CE",
            StateUpdate::new("online").business(BusinessState::Online),
        )
        .await
        .expect("update");
    assert_eq!(outcome.state.history.len(), 2);
    bus.stop().await.expect("stop");
}

#[tokio::test]
async fn reactivating_orders_respects_ceiling() {
    let bus = running_bus(DataBusConfig {
        max_active_orders: 1,
        ..DataBusConfig::default()
    })
    .await;
    bus.publish_order_data(OrderData::new("ORD-20240101", "04A228CD", 1))
        .await
        .expect("create first");
    bus.complete_order("ORD-20240101").await.expect("complete");
    bus.publish_order_data(OrderData::new("ORD-20240102", "04A228CD", 2))
        .await
        .expect("create second");

    let err = bus
        .update_order("ORD-20240101", |order| order.status = OrderStatus::Active)
        .await
        .expect_err("update reactivation");
    assert!(matches!(err, DataBusError::Capacity(_)));

    let mut reopened = bus.get_order_data("ORD-20240101").await.expect("order");
    reopened.status = OrderStatus::Active;
    let err = bus
        .publish_order_data(reopened.clone())
        .await
        .expect_err("publish reactivation");
    assert!(matches!(err, DataBusError::Capacity(_)));

    let result = bus
        .batch_update(vec![
            DataOperation::SetPort(PortData::new("04A228CD", 1)),
            DataOperation::SetOrder(reopened),
        ])
        .await
        .expect("batch");
    assert_eq!((result.succeeded, result.failed), (1, 1));
    assert_eq!(result.errors[0].0, 1);

    let first = bus.get_order_data("ORD-20240101").await.expect("order");
    assert_eq!(first.status, OrderStatus::Completed);
    assert!(
        bus.get_active_order("04A228CD", 1)
            .await
            .expect("active")
            .is_none()
    );
    assert!(
        bus.get_active_order("04A228CD", 2)
            .await
            .expect("active")
            .is_some()
    );
    bus.stop().await.expect("stop");
}

#[tokio::test]
async fn protocol_records_version_per_status() {
    let bus = running_bus(DataBusConfig::default()).await;
    let mut rx = channel(&bus, EventCategory::Protocol).await;

    let mut record = ProtocolData::new(42, Direction::Inbound, vec![0x44, 0x4E, 0x59]);
    record.message_id = 7;
    record.command = 0x20;
    record.status = ProcessingStatus::Parsed;
    let first = bus.publish_protocol_data(record.clone()).await.expect("parsed");
    let processed = bus
        .publish_protocol_data(first.with_status(ProcessingStatus::Processed, None))
        .await
        .expect("processed");
    assert_eq!(processed.version, 2);

    let kinds = [next_event(&mut rx).await, next_event(&mut rx).await]
        .into_iter()
        .filter_map(|event| match event {
            BusEvent::Protocol(event) => Some(event.kind),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert!(kinds.contains(&ProtocolEventKind::Received));
    assert!(kinds.contains(&ProtocolEventKind::Processed));

    let outbound = ProtocolData::new(42, Direction::Outbound, vec![0x01]);
    bus.publish_protocol_data(outbound).await.expect("outbound");
    let BusEvent::Protocol(event) = next_event(&mut rx).await else {
        panic!("expected protocol event");
    };
    assert_eq!(event.kind, ProtocolEventKind::Sent);
    bus.stop().await.expect("stop");
}

#[tokio::test]
async fn batch_update_continues_past_failures() {
    let bus = running_bus(DataBusConfig::default()).await;
    let mut invalid = PortData::new("04A228CD", 1);
    invalid.power_w = -5.0;
    let result = bus
        .batch_update(vec![
            DataOperation::SetDevice(device()),
            DataOperation::SetPort(invalid.clone()),
            DataOperation::SetPort(PortData::new("04A228CD", 2)),
        ])
        .await
        .expect("batch");
    assert_eq!(result.total, 3);
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.errors[0].0, 1);

    let err = bus
        .batch_update(vec![DataOperation::SetPort(invalid)])
        .await
        .expect_err("all failed");
    assert!(matches!(
        err,
        DataBusError::PartialFailure {
            total: 1,
            failed: 1,
            ..
        }
    ));

    let empty = bus.batch_update(Vec::new()).await.expect("empty");
    assert_eq!(empty.total, 0);
}

#[tokio::test]
async fn transaction_rolls_back_in_reverse() {
    let bus = running_bus(DataBusConfig::default()).await;
    let mut original = device();
    original.device_model = "AP3000".to_string();
    bus.publish_device_data(original).await.expect("seed");

    let mut changed = device();
    changed.device_model = "AP5000".to_string();
    let mut invalid = PortData::new("04A228CD", 1);
    invalid.energy_kwh = -1.0;

    let err = bus
        .transaction(vec![
            DataOperation::SetDevice(changed),
            DataOperation::SetPort(PortData::new("04A228CD", 2)),
            DataOperation::SetPort(invalid),
        ])
        .await
        .expect_err("rollback");
    assert!(matches!(
        err,
        DataBusError::TransactionFailed {
            step: 2,
            rolled_back: 2,
            rollback_failures: 0,
            ..
        }
    ));

    let restored = bus.get_device_data("04A228CD").await.expect("device");
    assert_eq!(restored.device_model, "AP3000");
    assert_eq!(restored.version, 3);
    assert!(bus.get_port_data("04A228CD", 2).await.is_err());

    let ok = bus
        .transaction(vec![DataOperation::SetPort(PortData::new("04A228CD", 3))])
        .await
        .expect("commit");
    assert_eq!(ok.applied, 1);
}

#[tokio::test]
async fn typed_subscription_and_health() {
    let bus = running_bus(DataBusConfig::default()).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    bus.subscribe_device_events("test", move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event.device_id);
        }
    })
    .await;
    bus.publish_device_data(device()).await.expect("publish");
    let received = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timeout")
        .expect("device id");
    assert_eq!(received, "04A228CD");

    let health = bus.health().await;
    assert!(health.running);
    assert!(health.storage_running);
    assert_eq!(health.subscriber_count, 1);
    assert_eq!(health.devices.writes, 1);
    assert_eq!(health.events_failed, 0);
    bus.stop().await.expect("stop");
}
