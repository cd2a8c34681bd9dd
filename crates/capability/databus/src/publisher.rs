//! 事件发布适配器
//!
//! 在事件总线外包一层信封（ID、优先级、重试次数），提供两种投递方式：
//! - 队列投递：N 个 worker 共享一个有界通道，按批收取，批内按优先级排序
//! - 直接投递：队列关闭时，或 High/Critical 优先级的信封
//!
//! 投递失败按固定间隔重试，超过 `max_retries` 后丢弃并记录日志。
//! 队列满直接返回给调用方，不阻塞。

use crate::error::PublishError;
use iotgw_eventbus::{BusEvent, EventBus};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 事件优先级
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl EventPriority {
    /// 绕过队列直接投递
    pub fn is_urgent(&self) -> bool {
        *self >= Self::High
    }
}

/// 事件信封
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub priority: EventPriority,
    pub conn_id: Option<u64>,
    pub device_id: Option<String>,
    pub event: BusEvent,
    pub timestamp_ms: i64,
    pub retry_count: u32,
}

impl EventEnvelope {
    pub fn new(event: BusEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority: EventPriority::Normal,
            conn_id: event.conn_id(),
            device_id: event.device_id().map(str::to_string),
            timestamp_ms: domain::now_epoch_ms(),
            event,
            retry_count: 0,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// 投递前过滤；返回 false 的信封被静默丢弃。
pub trait EventFilter: Send + Sync {
    fn accept(&self, envelope: &EventEnvelope) -> bool;
}

/// 默认过滤器：全部接受
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl EventFilter for AcceptAll {
    fn accept(&self, _envelope: &EventEnvelope) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    pub enable_queue: bool,
    pub worker_count: usize,
    pub queue_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// 每个 worker 每批最多处理的信封数
    pub batch_size: usize,
    /// 凑批等待上限
    pub batch_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enable_queue: true,
            worker_count: 4,
            queue_size: 1000,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            batch_size: 50,
            batch_timeout: Duration::from_millis(100),
        }
    }
}

impl PublisherConfig {
    pub fn sanitized(mut self) -> Self {
        self.worker_count = self.worker_count.max(1);
        self.queue_size = self.queue_size.max(1);
        self.batch_size = self.batch_size.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dropped: u64,
    pub filtered: u64,
    pub rejected_full: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    filtered: AtomicU64,
    rejected_full: AtomicU64,
}

/// 批量发布结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPublishResult {
    pub accepted: usize,
    pub failed: usize,
}

struct Workers {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct EventPublisher {
    bus: Arc<EventBus>,
    config: PublisherConfig,
    filter: Arc<dyn EventFilter>,
    sender: RwLock<Option<mpsc::Sender<EventEnvelope>>>,
    workers: Mutex<Option<Workers>>,
    running: AtomicBool,
    counters: Arc<Counters>,
}

impl EventPublisher {
    pub fn new(bus: Arc<EventBus>, config: PublisherConfig) -> Self {
        Self {
            bus,
            config: config.sanitized(),
            filter: Arc::new(AcceptAll),
            sender: RwLock::new(None),
            workers: Mutex::new(None),
            running: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn EventFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// 启动 worker 池（队列关闭时只置运行标志）。
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if self.is_running() {
            return;
        }
        if self.config.enable_queue {
            let (sender, receiver) = mpsc::channel(self.config.queue_size);
            let receiver = Arc::new(Mutex::new(receiver));
            let shutdown = CancellationToken::new();
            let handles = (0..self.config.worker_count)
                .map(|worker_id| {
                    tokio::spawn(worker_loop(
                        worker_id,
                        receiver.clone(),
                        self.bus.clone(),
                        self.config.clone(),
                        self.counters.clone(),
                        shutdown.clone(),
                    ))
                })
                .collect();
            *self.sender.write().await = Some(sender);
            *workers = Some(Workers { shutdown, handles });
        }
        self.running.store(true, Ordering::SeqCst);
        info!(
            target: "iotgw.publisher",
            queue = self.config.enable_queue,
            workers = self.config.worker_count,
            "event_publisher_started"
        );
    }

    /// 关闭队列，worker 把剩余信封各投递一次后退出；等待全部 worker 结束。
    pub async fn stop(&self) {
        let mut workers = self.workers.lock().await;
        if !self.is_running() {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        self.sender.write().await.take();
        if let Some(Workers { shutdown, handles }) = workers.take() {
            shutdown.cancel();
            for handle in handles {
                if let Err(err) = handle.await {
                    error!(target: "iotgw.publisher", error = %err, "publisher_worker_join_failed");
                }
            }
        }
        info!(target: "iotgw.publisher", "event_publisher_stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 以默认优先级发布。
    pub async fn publish(&self, event: BusEvent) -> Result<(), PublishError> {
        self.publish_event(EventEnvelope::new(event)).await
    }

    pub async fn publish_event(&self, envelope: EventEnvelope) -> Result<(), PublishError> {
        if !self.filter.accept(&envelope) {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            debug!(target: "iotgw.publisher", id = %envelope.id, "event_filtered");
            return Ok(());
        }
        if !self.is_running() {
            return Err(PublishError::NotRunning);
        }
        if !self.config.enable_queue || envelope.priority.is_urgent() {
            return deliver(
                &self.bus,
                &self.config,
                &self.counters,
                envelope,
                &CancellationToken::new(),
            )
            .await;
        }
        let sender = self.sender.read().await;
        let Some(sender) = sender.as_ref() else {
            return Err(PublishError::NotRunning);
        };
        match sender.try_send(envelope) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                self.counters.rejected_full.fetch_add(1, Ordering::Relaxed);
                warn!(target: "iotgw.publisher", id = %envelope.id, "publish_queue_full");
                Err(PublishError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PublishError::NotRunning),
        }
    }

    /// 按优先级从高到低逐个发布，同优先级保持原顺序。
    pub async fn publish_batch(&self, mut envelopes: Vec<EventEnvelope>) -> BatchPublishResult {
        envelopes.sort_by(|a, b| b.priority.cmp(&a.priority));
        let mut result = BatchPublishResult::default();
        for envelope in envelopes {
            match self.publish_event(envelope).await {
                Ok(()) => result.accepted += 1,
                Err(err) => {
                    result.failed += 1;
                    debug!(target: "iotgw.publisher", error = %err, "batch_publish_item_failed");
                }
            }
        }
        result
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            filtered: self.counters.filtered.load(Ordering::Relaxed),
            rejected_full: self.counters.rejected_full.load(Ordering::Relaxed),
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<EventEnvelope>>>,
    bus: Arc<EventBus>,
    config: PublisherConfig,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
) {
    debug!(target: "iotgw.publisher", worker_id, "publisher_worker_started");
    loop {
        let mut batch = {
            let mut receiver = receiver.lock().await;
            let Some(first) = receiver.recv().await else {
                break;
            };
            let mut batch = Vec::with_capacity(config.batch_size);
            batch.push(first);
            let deadline = Instant::now() + config.batch_timeout;
            while batch.len() < config.batch_size {
                match tokio::time::timeout_at(deadline, receiver.recv()).await {
                    Ok(Some(envelope)) => batch.push(envelope),
                    Ok(None) | Err(_) => break,
                }
            }
            batch
        };
        batch.sort_by(|a, b| b.priority.cmp(&a.priority));
        for envelope in batch {
            // 失败已在 deliver 中记录
            let _ = deliver(&bus, &config, &counters, envelope, &shutdown).await;
        }
    }
    debug!(target: "iotgw.publisher", worker_id, "publisher_worker_stopped");
}

/// 投递单个信封，失败按固定间隔重试；停止信号到达后不再重试。
async fn deliver(
    bus: &EventBus,
    config: &PublisherConfig,
    counters: &Counters,
    mut envelope: EventEnvelope,
    shutdown: &CancellationToken,
) -> Result<(), PublishError> {
    loop {
        let err = match bus.publish(envelope.event.clone()) {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                iotgw_telemetry::record_event_published();
                return Ok(());
            }
            Err(err) => err,
        };
        if envelope.retry_count >= config.max_retries || shutdown.is_cancelled() {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            iotgw_telemetry::record_event_dropped();
            warn!(
                target: "iotgw.publisher",
                id = %envelope.id,
                category = %envelope.event.category(),
                attempts = envelope.retry_count + 1,
                error = %err,
                "event_dropped"
            );
            return Err(PublishError::Delivery {
                attempts: envelope.retry_count + 1,
                reason: err.to_string(),
            });
        }
        envelope.retry_count += 1;
        counters.retried.fetch_add(1, Ordering::Relaxed);
        iotgw_telemetry::record_event_retried();
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(config.retry_delay) => {}
        }
    }
}
