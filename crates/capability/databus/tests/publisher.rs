use iotgw_databus::{
    EventEnvelope, EventFilter, EventPriority, EventPublisher, PublishError, PublisherConfig,
};
use iotgw_eventbus::{
    BusEvent, ChannelSubscriber, EventBus, EventCategory, SessionEvent, SessionEventKind,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

fn session_event(conn_id: u64) -> BusEvent {
    BusEvent::Session(SessionEvent {
        kind: SessionEventKind::Created,
        conn_id,
        device_id: None,
        remote_addr: "10.0.0.8:52011".to_string(),
        timestamp_ms: domain::now_epoch_ms(),
    })
}

fn fast_config() -> PublisherConfig {
    PublisherConfig {
        worker_count: 2,
        retry_delay: Duration::from_millis(1),
        batch_timeout: Duration::from_millis(5),
        ..PublisherConfig::default()
    }
}

#[tokio::test]
async fn queued_events_reach_subscribers() {
    let bus = Arc::new(EventBus::default());
    let (subscriber, mut rx) = ChannelSubscriber::new();
    bus.subscribe(EventCategory::Session, Arc::new(subscriber)).await;
    bus.start().await.expect("bus");

    let publisher = EventPublisher::new(bus.clone(), fast_config());
    publisher.start().await;
    for conn_id in 1..=3 {
        publisher.publish(session_event(conn_id)).await.expect("publish");
    }
    for _ in 0..3 {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .expect("event");
    }
    publisher.stop().await;
    publisher.stop().await;
    let stats = publisher.stats();
    assert_eq!(stats.enqueued, 3);
    assert_eq!(stats.delivered, 3);
    bus.stop().await.expect("bus stop");
}

#[tokio::test]
async fn envelope_carries_ids_from_event() {
    let envelope = EventEnvelope::new(session_event(42)).with_priority(EventPriority::High);
    assert_eq!(envelope.conn_id, Some(42));
    assert_eq!(envelope.device_id, None);
    assert_eq!(envelope.retry_count, 0);
    assert!(envelope.priority.is_urgent());
    assert!(!EventPriority::Normal.is_urgent());
}

#[tokio::test]
async fn inline_delivery_retries_then_reports_failure() {
    // 总线未启动，每次投递都会失败
    let bus = Arc::new(EventBus::default());
    let publisher = EventPublisher::new(
        bus,
        PublisherConfig {
            enable_queue: false,
            max_retries: 2,
            ..fast_config()
        },
    );
    publisher.start().await;
    let err = publisher
        .publish(session_event(1))
        .await
        .expect_err("delivery");
    assert!(matches!(err, PublishError::Delivery { attempts: 3, .. }));
    let stats = publisher.stats();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.dropped, 1);
    publisher.stop().await;
}

#[tokio::test]
async fn urgent_envelopes_bypass_queue() {
    let bus = Arc::new(EventBus::default());
    bus.start().await.expect("bus");
    let publisher = EventPublisher::new(bus.clone(), fast_config());
    publisher.start().await;
    publisher
        .publish_event(EventEnvelope::new(session_event(9)).with_priority(EventPriority::Critical))
        .await
        .expect("critical");
    let stats = publisher.stats();
    assert_eq!(stats.enqueued, 0);
    assert_eq!(stats.delivered, 1);
    publisher.stop().await;
    bus.stop().await.expect("bus stop");
}

#[tokio::test]
async fn full_queue_is_reported() {
    let bus = Arc::new(EventBus::default());
    bus.start().await.expect("bus");
    let publisher = EventPublisher::new(
        bus.clone(),
        PublisherConfig {
            queue_size: 1,
            ..fast_config()
        },
    );
    publisher.start().await;
    // 单线程运行时下 worker 尚未运行
    publisher.publish(session_event(1)).await.expect("first");
    assert_eq!(
        publisher.publish(session_event(2)).await.expect_err("full"),
        PublishError::QueueFull
    );
    assert_eq!(publisher.stats().rejected_full, 1);
    publisher.stop().await;
    bus.stop().await.expect("bus stop");
}

#[tokio::test]
async fn publish_requires_start() {
    let publisher = EventPublisher::new(Arc::new(EventBus::default()), fast_config());
    assert_eq!(
        publisher.publish(session_event(1)).await.expect_err("stopped"),
        PublishError::NotRunning
    );
}

struct Recorder {
    seen: Mutex<Vec<u64>>,
    reject: u64,
}

impl EventFilter for Recorder {
    fn accept(&self, envelope: &EventEnvelope) -> bool {
        let conn_id = envelope.conn_id.unwrap_or_default();
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(conn_id);
        }
        conn_id != self.reject
    }
}

#[tokio::test]
async fn batch_is_ordered_by_priority_and_filtered() {
    let bus = Arc::new(EventBus::default());
    bus.start().await.expect("bus");
    let recorder = Arc::new(Recorder {
        seen: Mutex::new(Vec::new()),
        reject: 4,
    });
    let publisher = EventPublisher::new(
        bus.clone(),
        PublisherConfig {
            enable_queue: false,
            ..fast_config()
        },
    )
    .with_filter(recorder.clone());
    publisher.start().await;

    let result = publisher
        .publish_batch(vec![
            EventEnvelope::new(session_event(1)).with_priority(EventPriority::Low),
            EventEnvelope::new(session_event(2)).with_priority(EventPriority::Critical),
            EventEnvelope::new(session_event(3)),
            EventEnvelope::new(session_event(4)),
        ])
        .await;
    assert_eq!(result.accepted, 4);
    assert_eq!(result.failed, 0);
    assert_eq!(
        recorder.seen.lock().expect("seen").clone(),
        vec![2, 3, 4, 1]
    );
    let stats = publisher.stats();
    assert_eq!(stats.filtered, 1);
    assert_eq!(stats.delivered, 3);
    publisher.stop().await;
    bus.stop().await.expect("bus stop");
}
