//! 事件总线
//!
//! 单个有界 mpsc 通道 + 一个分发循环：
//! - `publish` 使用 `try_send`，通道满立即失败
//! - 分发循环把事件扇出给同分类订阅者和通配订阅者，每次调用一个任务
//! - `stop` 取消分发循环，排空通道中剩余事件并等待在途调用结束

use crate::error::EventBusError;
use crate::event::{BusEvent, EventCategory};
use crate::subscriber::EventSubscriber;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type SubscriptionId = u64;

/// 事件总线配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusConfig {
    /// 通道容量
    pub buffer_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { buffer_size: 1000 }
    }
}

impl EventBusConfig {
    pub fn sanitized(mut self) -> Self {
        self.buffer_size = self.buffer_size.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventBusStats {
    pub published: u64,
    pub rejected_full: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    rejected_full: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

struct Subscription {
    id: SubscriptionId,
    category: EventCategory,
    subscriber: Arc<dyn EventSubscriber>,
}

type Subscriptions = Arc<RwLock<Vec<Subscription>>>;

struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<mpsc::Receiver<BusEvent>>,
}

pub struct EventBus {
    sender: mpsc::Sender<BusEvent>,
    receiver: Mutex<Option<mpsc::Receiver<BusEvent>>>,
    subscriptions: Subscriptions,
    next_id: AtomicU64,
    running: AtomicBool,
    worker: Mutex<Option<Running>>,
    counters: Arc<Counters>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let config = config.sanitized();
        let (sender, receiver) = mpsc::channel(config.buffer_size);
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    /// 启动分发循环；重复调用无副作用。
    pub async fn start(&self) -> Result<(), EventBusError> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Ok(());
        }
        let receiver = self.receiver.lock().await.take().ok_or_else(|| {
            EventBusError::Unavailable("dispatch receiver lost".to_string())
        })?;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(dispatch_loop(
            receiver,
            self.subscriptions.clone(),
            self.counters.clone(),
            shutdown.clone(),
        ));
        *worker = Some(Running { shutdown, handle });
        self.running.store(true, Ordering::SeqCst);
        info!(target: "iotgw.eventbus", "event_bus_started");
        Ok(())
    }

    /// 停止分发循环并等待其退出；重复调用无副作用。
    pub async fn stop(&self) -> Result<(), EventBusError> {
        let mut worker = self.worker.lock().await;
        let Some(running) = worker.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);
        running.shutdown.cancel();
        match running.handle.await {
            Ok(receiver) => {
                *self.receiver.lock().await = Some(receiver);
            }
            Err(err) => {
                error!(target: "iotgw.eventbus", error = %err, "event_dispatch_join_failed");
                return Err(EventBusError::Unavailable(err.to_string()));
            }
        }
        info!(target: "iotgw.eventbus", "event_bus_stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 发布事件，不阻塞。
    pub fn publish(&self, event: BusEvent) -> Result<(), EventBusError> {
        if !self.is_running() {
            return Err(EventBusError::NotRunning);
        }
        match self.sender.try_send(event) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.counters.rejected_full.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "iotgw.eventbus",
                    category = %event.category(),
                    "event_channel_full"
                );
                Err(EventBusError::ChannelFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EventBusError::NotRunning),
        }
    }

    pub async fn subscribe(
        &self,
        category: EventCategory,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "iotgw.eventbus",
            id,
            category = %category,
            name = subscriber.name(),
            "event_subscribed"
        );
        self.subscriptions.write().await.push(Subscription {
            id,
            category,
            subscriber,
        });
        id
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        before != subscriptions.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            rejected_full: self.counters.rejected_full.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

async fn dispatch_loop(
    mut receiver: mpsc::Receiver<BusEvent>,
    subscriptions: Subscriptions,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
) -> mpsc::Receiver<BusEvent> {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = receiver.recv() => match event {
                Some(event) => dispatch(&subscriptions, &counters, event, &mut tasks).await,
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
        }
    }
    while let Ok(event) = receiver.try_recv() {
        dispatch(&subscriptions, &counters, event, &mut tasks).await;
    }
    while let Some(joined) = tasks.join_next().await {
        log_join(joined);
    }
    receiver
}

async fn dispatch(
    subscriptions: &Subscriptions,
    counters: &Arc<Counters>,
    event: BusEvent,
    tasks: &mut JoinSet<()>,
) {
    let category = event.category();
    let subscriptions = subscriptions.read().await;
    for subscription in subscriptions
        .iter()
        .filter(|subscription| subscription.category.accepts(category))
    {
        let subscriber = subscription.subscriber.clone();
        let counters = counters.clone();
        let event = event.clone();
        tasks.spawn(async move {
            match subscriber.on_event(event).await {
                Ok(()) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "iotgw.eventbus",
                        subscriber = subscriber.name(),
                        category = %category,
                        error = %err,
                        "subscriber_failed"
                    );
                }
            }
        });
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(target: "iotgw.eventbus", error = %err, "subscriber_task_panicked");
    }
}
