//! 数据总线门面
//!
//! 统一的发布/查询/订阅入口。每次发布：校验 → 写入管理器（缓存 + 存储）→ 发出一个事件。
//! 事件发布失败只记录日志并计数，不回滚已完成的写入。
//!
//! 启动顺序：存储 → 一致性管理器 → 事件总线 → 各数据管理器；停止顺序相反。

use crate::config::DataBusConfig;
use crate::error::DataBusError;
use crate::manager::{DataManager, ManagerStats};
use crate::order::OrderDataManager;
use crate::state::{DeviceStateManager, StateChangeOutcome, StateUpdate};
use domain::keys::{device_key, device_ports_prefix, port_key, protocol_key};
use domain::{
    DeviceData, DeviceState, Direction, EntityKind, OrderData, OrderStatus, PortData,
    ProcessingStatus, ProtocolData,
};
use iotgw_eventbus::{
    BusEvent, DeviceEvent, DeviceEventKind, EventBus, EventBusConfig, EventBusStats,
    EventCategory, EventSubscriber, FnSubscriber, OrderEvent, OrderEventKind, PortEvent,
    PortEventKind, ProtocolEvent, ProtocolEventKind, SessionEvent, StateChangeEvent,
    SubscriptionId,
};
use iotgw_storage::{
    ConsistencyManager, ConsistencyStats, Inconsistency, RepairPolicy, StorageManager,
};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// 健康报告
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub running: bool,
    pub storage_running: bool,
    pub subscriber_count: usize,
    pub event_bus: EventBusStats,
    pub events_failed: u64,
    pub devices: ManagerStats,
    pub states: ManagerStats,
    pub ports: ManagerStats,
    pub orders: ManagerStats,
    pub protocols: ManagerStats,
    pub active_orders: usize,
    pub consistency: ConsistencyStats,
}

pub struct DataBus {
    storage: Arc<dyn StorageManager>,
    consistency: Arc<ConsistencyManager>,
    event_bus: Arc<EventBus>,
    pub(crate) devices: DataManager<DeviceData>,
    pub(crate) states: DeviceStateManager,
    pub(crate) ports: DataManager<PortData>,
    pub(crate) orders: OrderDataManager,
    pub(crate) protocols: DataManager<ProtocolData>,
    running: AtomicBool,
    lifecycle: Mutex<()>,
    events_failed: AtomicU64,
}

impl DataBus {
    pub fn new(storage: Arc<dyn StorageManager>, config: DataBusConfig) -> Self {
        let config = config.sanitized();
        Self {
            consistency: Arc::new(ConsistencyManager::new(storage.clone())),
            event_bus: Arc::new(EventBus::new(EventBusConfig {
                buffer_size: config.event_buffer_size,
            })),
            devices: DataManager::new(storage.clone()),
            states: DeviceStateManager::new(storage.clone(), config.state_history_size),
            ports: DataManager::new(storage.clone()),
            orders: OrderDataManager::new(storage.clone(), config.max_active_orders),
            protocols: DataManager::new(storage.clone()),
            storage,
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            events_failed: AtomicU64::new(0),
        }
    }

    /// 替换一致性修复策略（默认不做任何修复）。
    pub fn with_repair_policy(mut self, policy: Arc<dyn RepairPolicy>) -> Self {
        self.consistency =
            Arc::new(ConsistencyManager::new(self.storage.clone()).with_repair_policy(policy));
        self
    }

    pub async fn start(&self) -> Result<(), DataBusError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }
        self.storage.start().await?;
        self.consistency.start();
        self.event_bus.start().await?;
        self.devices.start();
        self.states.start();
        self.ports.start();
        self.orders.start().await?;
        self.protocols.start();
        self.running.store(true, Ordering::SeqCst);
        info!(target: "iotgw.databus", "data_bus_started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), DataBusError> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.is_running() {
            return Ok(());
        }
        self.running.store(false, Ordering::SeqCst);
        self.protocols.stop();
        self.orders.stop();
        self.ports.stop();
        self.states.stop();
        self.devices.stop();
        self.event_bus.stop().await?;
        self.consistency.stop();
        self.storage.stop().await?;
        info!(target: "iotgw.databus", "data_bus_stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_running(&self) -> Result<(), DataBusError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(DataBusError::NotRunning)
        }
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn consistency(&self) -> Arc<ConsistencyManager> {
        self.consistency.clone()
    }

    pub fn storage(&self) -> Arc<dyn StorageManager> {
        self.storage.clone()
    }

    // ---- 设备 ----

    pub async fn publish_device_data(
        &self,
        device: DeviceData,
    ) -> Result<DeviceData, DataBusError> {
        self.ensure_running()?;
        self.consistency.validate(&device)?;
        let (saved, previous) = self.devices.set(device).await?;
        let kind = if previous.is_some() {
            DeviceEventKind::Updated
        } else {
            DeviceEventKind::Registered
        };
        self.emit(BusEvent::Device(DeviceEvent {
            kind,
            device_id: saved.device_id.clone(),
            device: Some(saved.clone()),
            timestamp_ms: domain::now_epoch_ms(),
        }));
        Ok(saved)
    }

    pub async fn get_device_data(&self, device_id: &str) -> Result<DeviceData, DataBusError> {
        self.ensure_running()?;
        self.devices
            .get(&device_key(device_id))
            .await?
            .ok_or_else(|| DataBusError::not_found(EntityKind::Device, device_id))
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceData>, DataBusError> {
        self.ensure_running()?;
        self.devices.list().await
    }

    /// 显式删除设备（只由运维操作触发）。
    pub async fn delete_device_data(&self, device_id: &str) -> Result<DeviceData, DataBusError> {
        self.ensure_running()?;
        let removed = self
            .devices
            .delete(&device_key(device_id))
            .await?
            .ok_or_else(|| DataBusError::not_found(EntityKind::Device, device_id))?;
        info!(target: "iotgw.databus", device_id, "device_deleted");
        self.emit(BusEvent::Device(DeviceEvent {
            kind: DeviceEventKind::Deleted,
            device_id: removed.device_id.clone(),
            device: Some(removed.clone()),
            timestamp_ms: domain::now_epoch_ms(),
        }));
        Ok(removed)
    }

    /// 比较缓存副本与存储副本，发现的不一致会被记录。
    pub async fn verify_device_data(
        &self,
        device_id: &str,
    ) -> Result<Option<Inconsistency>, DataBusError> {
        let cached = self.get_device_data(device_id).await?;
        Ok(self.consistency.check(&cached).await?)
    }

    // ---- 状态 ----

    /// 应用状态更新；仅显著变化发出事件。
    pub async fn publish_state_change(
        &self,
        device_id: &str,
        update: StateUpdate,
    ) -> Result<StateChangeOutcome, DataBusError> {
        self.ensure_running()?;
        let reason = update.reason.clone();
        let outcome = self.states.update_device_state(device_id, update).await?;
        self.emit_state_change(&outcome, reason);
        Ok(outcome)
    }

    /// 整体写入设备状态；仅显著变化发出事件。
    pub async fn publish_device_state(
        &self,
        state: DeviceState,
        reason: &str,
    ) -> Result<StateChangeOutcome, DataBusError> {
        self.ensure_running()?;
        self.consistency.validate(&state)?;
        let outcome = self.states.replace_state(state, reason).await?;
        self.emit_state_change(&outcome, reason.to_string());
        Ok(outcome)
    }

    pub async fn get_device_state(&self, device_id: &str) -> Result<DeviceState, DataBusError> {
        self.ensure_running()?;
        self.states
            .get_state(device_id)
            .await?
            .ok_or_else(|| DataBusError::not_found(EntityKind::State, device_id))
    }

    fn emit_state_change(&self, outcome: &StateChangeOutcome, reason: String) {
        if !outcome.significant {
            return;
        }
        self.emit(BusEvent::StateChange(StateChangeEvent {
            device_id: outcome.state.device_id.clone(),
            previous: outcome.previous,
            current: outcome.current,
            reason,
            state: Some(outcome.state.clone()),
            timestamp_ms: domain::now_epoch_ms(),
        }));
    }

    // ---- 端口 ----

    pub async fn publish_port_data(&self, port: PortData) -> Result<PortData, DataBusError> {
        self.ensure_running()?;
        self.consistency.validate(&port)?;
        let (saved, _) = self.ports.set(port).await?;
        self.emit(BusEvent::Port(PortEvent {
            kind: PortEventKind::Updated,
            device_id: saved.device_id.clone(),
            port_number: saved.port_number,
            port: Some(saved.clone()),
            timestamp_ms: domain::now_epoch_ms(),
        }));
        Ok(saved)
    }

    pub async fn get_port_data(
        &self,
        device_id: &str,
        port_number: u32,
    ) -> Result<PortData, DataBusError> {
        self.ensure_running()?;
        let key = port_key(device_id, port_number);
        self.ports
            .get(&key)
            .await?
            .ok_or_else(|| DataBusError::not_found(EntityKind::Port, key))
    }

    /// 设备的全部端口，按端口号升序。
    pub async fn list_device_ports(&self, device_id: &str) -> Result<Vec<PortData>, DataBusError> {
        self.ensure_running()?;
        let mut ports = self
            .ports
            .list_prefix(&device_ports_prefix(device_id))
            .await?;
        ports.sort_by_key(|port| port.port_number);
        Ok(ports)
    }

    pub async fn delete_port_data(
        &self,
        device_id: &str,
        port_number: u32,
    ) -> Result<PortData, DataBusError> {
        self.ensure_running()?;
        let key = port_key(device_id, port_number);
        let removed = self
            .ports
            .delete(&key)
            .await?
            .ok_or_else(|| DataBusError::not_found(EntityKind::Port, key))?;
        self.emit(BusEvent::Port(PortEvent {
            kind: PortEventKind::Deleted,
            device_id: removed.device_id.clone(),
            port_number: removed.port_number,
            port: Some(removed.clone()),
            timestamp_ms: domain::now_epoch_ms(),
        }));
        Ok(removed)
    }

    // ---- 订单 ----

    /// 新订单走创建流程（去重 + 活跃上限），已有订单直接写入新版本。
    pub async fn publish_order_data(&self, order: OrderData) -> Result<OrderData, DataBusError> {
        self.ensure_running()?;
        self.consistency.validate(&order)?;
        let existing = self.orders.get_order(&order.order_id).await?;
        let (saved, kind) = match existing {
            None => (self.orders.create_order(order).await?, OrderEventKind::Created),
            Some(previous) => {
                let (saved, _) = self.orders.set_order(order).await?;
                let kind = match saved.status {
                    _ if previous.status == saved.status => OrderEventKind::Updated,
                    OrderStatus::Completed => OrderEventKind::Completed,
                    OrderStatus::Cancelled => OrderEventKind::Cancelled,
                    _ => OrderEventKind::Updated,
                };
                (saved, kind)
            }
        };
        self.emit_order(kind, &saved);
        Ok(saved)
    }

    pub async fn get_order_data(&self, order_id: &str) -> Result<OrderData, DataBusError> {
        self.ensure_running()?;
        self.orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| DataBusError::not_found(EntityKind::Order, order_id))
    }

    pub async fn update_order<F>(
        &self,
        order_id: &str,
        mutator: F,
    ) -> Result<OrderData, DataBusError>
    where
        F: FnOnce(&mut OrderData),
    {
        self.ensure_running()?;
        let saved = self.orders.update_order(order_id, mutator).await?;
        self.emit_order(OrderEventKind::Updated, &saved);
        Ok(saved)
    }

    pub async fn complete_order(&self, order_id: &str) -> Result<OrderData, DataBusError> {
        self.ensure_running()?;
        let saved = self.orders.complete_order(order_id).await?;
        self.emit_order(OrderEventKind::Completed, &saved);
        Ok(saved)
    }

    pub async fn cancel_order(
        &self,
        order_id: &str,
        reason: Option<String>,
    ) -> Result<OrderData, DataBusError> {
        self.ensure_running()?;
        let saved = self.orders.cancel_order(order_id, reason).await?;
        self.emit_order(OrderEventKind::Cancelled, &saved);
        Ok(saved)
    }

    pub async fn delete_order_data(&self, order_id: &str) -> Result<OrderData, DataBusError> {
        self.ensure_running()?;
        let removed = self
            .orders
            .delete_order(order_id)
            .await?
            .ok_or_else(|| DataBusError::not_found(EntityKind::Order, order_id))?;
        self.emit_order(OrderEventKind::Deleted, &removed);
        Ok(removed)
    }

    pub async fn get_orders_by_device_port(
        &self,
        device_id: &str,
        port_number: u32,
    ) -> Result<Vec<OrderData>, DataBusError> {
        self.ensure_running()?;
        self.orders
            .get_orders_by_device_port(device_id, port_number)
            .await
    }

    pub async fn get_active_order(
        &self,
        device_id: &str,
        port_number: u32,
    ) -> Result<Option<OrderData>, DataBusError> {
        self.ensure_running()?;
        self.orders.get_active_order(device_id, port_number).await
    }

    fn emit_order(&self, kind: OrderEventKind, order: &OrderData) {
        self.emit(BusEvent::Order(OrderEvent {
            kind,
            order_id: order.order_id.clone(),
            device_id: order.device_id.clone(),
            port_number: order.port_number,
            order: Some(order.clone()),
            timestamp_ms: domain::now_epoch_ms(),
        }));
    }

    // ---- 协议记录 ----

    /// 记录协议帧；同一 (conn_id, message_id) 的新状态写为新版本。
    pub async fn publish_protocol_data(
        &self,
        record: ProtocolData,
    ) -> Result<ProtocolData, DataBusError> {
        self.ensure_running()?;
        self.consistency.validate(&record)?;
        let (saved, _) = self.protocols.set(record).await?;
        let kind = match (saved.direction, saved.status) {
            (Direction::Outbound, _) => ProtocolEventKind::Sent,
            (_, ProcessingStatus::Received | ProcessingStatus::Parsed) => {
                ProtocolEventKind::Received
            }
            (_, ProcessingStatus::Processed) => ProtocolEventKind::Processed,
            (_, ProcessingStatus::Error) => ProtocolEventKind::Failed,
            (_, ProcessingStatus::Timeout) => ProtocolEventKind::Timeout,
        };
        self.emit(protocol_event(kind, &saved));
        Ok(saved)
    }

    pub async fn get_protocol_data(
        &self,
        conn_id: u64,
        message_id: u16,
    ) -> Result<ProtocolData, DataBusError> {
        self.ensure_running()?;
        let key = protocol_key(conn_id, message_id);
        self.protocols
            .get(&key)
            .await?
            .ok_or_else(|| DataBusError::not_found(EntityKind::Protocol, key))
    }

    pub async fn delete_protocol_data(
        &self,
        conn_id: u64,
        message_id: u16,
    ) -> Result<ProtocolData, DataBusError> {
        self.ensure_running()?;
        let key = protocol_key(conn_id, message_id);
        self.protocols
            .delete(&key)
            .await?
            .ok_or_else(|| DataBusError::not_found(EntityKind::Protocol, key))
    }

    /// 直接向总线发出事件（未知命令等不伴随写入的事件）。
    pub fn publish_event(&self, event: BusEvent) -> Result<(), DataBusError> {
        self.ensure_running()?;
        self.event_bus.publish(event)?;
        Ok(())
    }

    // ---- 订阅 ----

    pub async fn subscribe_device_events<F, Fut>(
        &self,
        name: &str,
        callback: F,
    ) -> SubscriptionId
    where
        F: Fn(DeviceEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_typed(EventCategory::Device, name, extract_device, callback)
            .await
    }

    pub async fn subscribe_state_change_events<F, Fut>(
        &self,
        name: &str,
        callback: F,
    ) -> SubscriptionId
    where
        F: Fn(StateChangeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_typed(EventCategory::StateChange, name, extract_state, callback)
            .await
    }

    pub async fn subscribe_port_events<F, Fut>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(PortEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_typed(EventCategory::Port, name, extract_port, callback)
            .await
    }

    pub async fn subscribe_order_events<F, Fut>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(OrderEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_typed(EventCategory::Order, name, extract_order, callback)
            .await
    }

    pub async fn subscribe_protocol_events<F, Fut>(
        &self,
        name: &str,
        callback: F,
    ) -> SubscriptionId
    where
        F: Fn(ProtocolEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_typed(EventCategory::Protocol, name, extract_protocol, callback)
            .await
    }

    pub async fn subscribe_session_events<F, Fut>(
        &self,
        name: &str,
        callback: F,
    ) -> SubscriptionId
    where
        F: Fn(SessionEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_typed(EventCategory::Session, name, extract_session, callback)
            .await
    }

    pub async fn subscribe_all_events<F, Fut>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.event_bus
            .subscribe(EventCategory::All, Arc::new(FnSubscriber::new(name, callback)))
            .await
    }

    pub async fn subscribe_with(
        &self,
        category: EventCategory,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionId {
        self.event_bus.subscribe(category, subscriber).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.event_bus.unsubscribe(id).await
    }

    async fn subscribe_typed<T, F, Fut>(
        &self,
        category: EventCategory,
        name: &str,
        extract: fn(BusEvent) -> Option<T>,
        callback: F,
    ) -> SubscriptionId
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let subscriber = FnSubscriber::new(name, move |event: BusEvent| {
            let pending = extract(event).map(&callback);
            async move {
                if let Some(pending) = pending {
                    pending.await;
                }
            }
        });
        self.event_bus.subscribe(category, Arc::new(subscriber)).await
    }

    // ---- 健康 ----

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            running: self.is_running(),
            storage_running: self.storage.is_running(),
            subscriber_count: self.event_bus.subscriber_count().await,
            event_bus: self.event_bus.stats(),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            devices: self.devices.stats().await,
            states: self.states.manager().stats().await,
            ports: self.ports.stats().await,
            orders: self.orders.manager().stats().await,
            protocols: self.protocols.stats().await,
            active_orders: self.orders.active_order_count().await,
            consistency: self.consistency.stats(),
        }
    }

    pub(crate) fn emit(&self, event: BusEvent) {
        if let Err(err) = self.event_bus.publish(event) {
            self.events_failed.fetch_add(1, Ordering::Relaxed);
            warn!(target: "iotgw.databus", error = %err, "event_publish_failed");
        }
    }
}

fn protocol_event(kind: ProtocolEventKind, record: &ProtocolData) -> BusEvent {
    BusEvent::Protocol(ProtocolEvent {
        kind,
        conn_id: record.conn_id,
        device_id: record.device_id.clone(),
        command: record.command,
        message_id: record.message_id,
        record: Some(record.clone()),
        error: record.error.clone(),
        timestamp_ms: domain::now_epoch_ms(),
    })
}

fn extract_device(event: BusEvent) -> Option<DeviceEvent> {
    match event {
        BusEvent::Device(event) => Some(event),
        _ => None,
    }
}

fn extract_state(event: BusEvent) -> Option<StateChangeEvent> {
    match event {
        BusEvent::StateChange(event) => Some(event),
        _ => None,
    }
}

fn extract_port(event: BusEvent) -> Option<PortEvent> {
    match event {
        BusEvent::Port(event) => Some(event),
        _ => None,
    }
}

fn extract_order(event: BusEvent) -> Option<OrderEvent> {
    match event {
        BusEvent::Order(event) => Some(event),
        _ => None,
    }
}

fn extract_protocol(event: BusEvent) -> Option<ProtocolEvent> {
    match event {
        BusEvent::Protocol(event) => Some(event),
        _ => None,
    }
}

fn extract_session(event: BusEvent) -> Option<SessionEvent> {
    match event {
        BusEvent::Session(event) => Some(event),
        _ => None,
    }
}
