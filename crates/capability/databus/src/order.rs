//! 订单数据管理器
//!
//! 在通用管理器之上维护：
//! - `device:port -> [order_id]` 索引（创建/删除/换端口时同步）
//! - 活跃订单（created/active）上限，创建及由非活跃转为活跃时检查

use crate::error::DataBusError;
use crate::manager::DataManager;
use domain::keys::{ORDER_PREFIX, order_key};
use domain::order::device_port_key;
use domain::{Entity, EntityKind, OrderData, OrderStatus};
use iotgw_storage::StorageManager;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

pub struct OrderDataManager {
    inner: DataManager<OrderData>,
    index: RwLock<HashMap<String, Vec<String>>>,
    /// 串行化创建与状态迁移，保证上限检查与写入之间没有竞争
    write_gate: Mutex<()>,
    max_active_orders: usize,
}

impl OrderDataManager {
    pub fn new(storage: Arc<dyn StorageManager>, max_active_orders: usize) -> Self {
        Self {
            inner: DataManager::new(storage),
            index: RwLock::new(HashMap::new()),
            write_gate: Mutex::new(()),
            max_active_orders: max_active_orders.max(1),
        }
    }

    /// 启动并从存储重建缓存与索引。
    pub async fn start(&self) -> Result<(), DataBusError> {
        self.inner.start();
        let orders = self.inner.list_prefix(ORDER_PREFIX).await?;
        let mut index = self.index.write().await;
        index.clear();
        for order in &orders {
            index
                .entry(order.device_port_key())
                .or_default()
                .push(order.order_id.clone());
        }
        info!(target: "iotgw.databus", orders = orders.len(), "order_index_rebuilt");
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn manager(&self) -> &DataManager<OrderData> {
        &self.inner
    }

    /// 创建订单：重复 ID 失败，活跃订单达到上限失败。
    pub async fn create_order(&self, mut order: OrderData) -> Result<OrderData, DataBusError> {
        let _gate = self.write_gate.lock().await;
        let key = order.storage_key();
        if self.inner.exists(&key).await? {
            return Err(DataBusError::AlreadyExists {
                kind: EntityKind::Order,
                key,
            });
        }
        if order.is_active() {
            self.ensure_capacity(&order.order_id).await?;
        }
        if order.created_at_ms.is_none() {
            order.created_at_ms = Some(domain::now_epoch_ms());
        }
        let (saved, _) = self.inner.set(order).await?;
        self.index_insert(&saved.device_port_key(), &saved.order_id)
            .await;
        Ok(saved)
    }

    /// 写入已有订单的新内容（不做存在性检查）；端口变化时同步索引。
    pub async fn set_order(
        &self,
        order: OrderData,
    ) -> Result<(OrderData, Option<OrderData>), DataBusError> {
        let _gate = self.write_gate.lock().await;
        let existing = self.inner.get(&order.storage_key()).await?;
        if order.is_active() && !existing.as_ref().is_some_and(OrderData::is_active) {
            self.ensure_capacity(&order.order_id).await?;
        }
        let (saved, previous) = self.inner.set(order).await?;
        self.reindex(previous.as_ref(), &saved).await;
        Ok((saved, previous))
    }

    /// 用闭包修改订单；订单 ID 不可修改。
    pub async fn update_order<F>(
        &self,
        order_id: &str,
        mutator: F,
    ) -> Result<OrderData, DataBusError>
    where
        F: FnOnce(&mut OrderData),
    {
        let _gate = self.write_gate.lock().await;
        let key = order_key(order_id);
        let current = self
            .inner
            .get(&key)
            .await?
            .ok_or_else(|| DataBusError::not_found(EntityKind::Order, order_id))?;
        let mut next = current.clone();
        mutator(&mut next);
        if next.order_id != current.order_id {
            return Err(DataBusError::InvalidState(
                "order_id cannot be changed".to_string(),
            ));
        }
        if next.is_active() && !current.is_active() {
            self.ensure_capacity(order_id).await?;
        }
        let (saved, _) = self.inner.set(next).await?;
        self.reindex(Some(&current), &saved).await;
        Ok(saved)
    }

    pub async fn complete_order(&self, order_id: &str) -> Result<OrderData, DataBusError> {
        self.finish(order_id, OrderStatus::Completed, None).await
    }

    pub async fn cancel_order(
        &self,
        order_id: &str,
        reason: Option<String>,
    ) -> Result<OrderData, DataBusError> {
        self.finish(order_id, OrderStatus::Cancelled, reason).await
    }

    async fn finish(
        &self,
        order_id: &str,
        status: OrderStatus,
        reason: Option<String>,
    ) -> Result<OrderData, DataBusError> {
        let _gate = self.write_gate.lock().await;
        let key = order_key(order_id);
        let mut order = self
            .inner
            .get(&key)
            .await?
            .ok_or_else(|| DataBusError::not_found(EntityKind::Order, order_id))?;
        if order.status.is_terminal() {
            return Err(DataBusError::InvalidState(format!(
                "order {} already {}",
                order_id, order.status
            )));
        }
        order.finish(status, domain::now_epoch_ms());
        if reason.is_some() {
            order.stop_reason = reason;
        }
        let (saved, _) = self.inner.set(order).await?;
        info!(
            target: "iotgw.databus",
            order_id,
            status = %saved.status,
            duration_secs = saved.charge_duration_secs,
            "order_finished"
        );
        Ok(saved)
    }

    pub async fn delete_order(&self, order_id: &str) -> Result<Option<OrderData>, DataBusError> {
        let _gate = self.write_gate.lock().await;
        let removed = self.inner.delete(&order_key(order_id)).await?;
        if let Some(order) = &removed {
            self.index_remove(&order.device_port_key(), &order.order_id)
                .await;
        }
        Ok(removed)
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Option<OrderData>, DataBusError> {
        self.inner.get(&order_key(order_id)).await
    }

    /// 设备端口上的全部订单，按创建顺序。
    pub async fn get_orders_by_device_port(
        &self,
        device_id: &str,
        port_number: u32,
    ) -> Result<Vec<OrderData>, DataBusError> {
        let ids = self
            .index
            .read()
            .await
            .get(&device_port_key(device_id, port_number))
            .cloned()
            .unwrap_or_default();
        let mut orders = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(order) = self.inner.get(&order_key(&id)).await? {
                orders.push(order);
            }
        }
        Ok(orders)
    }

    /// 设备端口上最近创建的活跃订单。
    pub async fn get_active_order(
        &self,
        device_id: &str,
        port_number: u32,
    ) -> Result<Option<OrderData>, DataBusError> {
        let orders = self.get_orders_by_device_port(device_id, port_number).await?;
        Ok(orders.into_iter().rev().find(OrderData::is_active))
    }

    pub async fn active_order_count(&self) -> usize {
        self.inner
            .cached()
            .await
            .iter()
            .filter(|order| order.is_active())
            .count()
    }

    /// 再多一个活跃订单是否会超出上限；调用方需持有 `write_gate`。
    async fn ensure_capacity(&self, order_id: &str) -> Result<(), DataBusError> {
        let active = self.active_order_count().await;
        if active >= self.max_active_orders {
            warn!(
                target: "iotgw.databus",
                order_id,
                active,
                limit = self.max_active_orders,
                "active_order_limit_reached"
            );
            return Err(DataBusError::Capacity(format!(
                "active orders {} reached limit {}",
                active, self.max_active_orders
            )));
        }
        Ok(())
    }

    async fn reindex(&self, previous: Option<&OrderData>, current: &OrderData) {
        let next_key = current.device_port_key();
        if let Some(previous) = previous {
            let prev_key = previous.device_port_key();
            if prev_key == next_key {
                return;
            }
            self.index_remove(&prev_key, &previous.order_id).await;
        }
        self.index_insert(&next_key, &current.order_id).await;
    }

    async fn index_insert(&self, key: &str, order_id: &str) {
        let mut index = self.index.write().await;
        let ids = index.entry(key.to_string()).or_default();
        if !ids.iter().any(|id| id == order_id) {
            ids.push(order_id.to_string());
        }
    }

    async fn index_remove(&self, key: &str, order_id: &str) {
        let mut index = self.index.write().await;
        if let Some(ids) = index.get_mut(key) {
            ids.retain(|id| id != order_id);
            if ids.is_empty() {
                index.remove(key);
            }
        }
    }
}
