//! 存储接口 Trait 定义
//!
//! - StorageManager：键值存储契约（字节值 + 可选 TTL + 前缀枚举）
//! - ExtendedStorageManager：按实体类型的保存/读取/删除
//!
//! 设计原则：
//! - 所有接口返回 StorageError
//! - 使用 async_trait 支持动态分发
//! - 实体以 `to_map` 的 JSON 形式落盘，读取时经 `from_map` 还原

use crate::error::StorageError;
use async_trait::async_trait;
use domain::keys::{device_key, order_key, port_key, protocol_key, state_key};
use domain::{DeviceData, DeviceState, Entity, EntityMap, OrderData, PortData, ProtocolData};
use std::time::Duration;

/// 键值存储接口
#[async_trait]
pub trait StorageManager: Send + Sync {
    async fn start(&self) -> Result<(), StorageError>;

    async fn stop(&self) -> Result<(), StorageError>;

    fn is_running(&self) -> bool;

    /// 读取原始值，不存在或已过期返回 None
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// 写入原始值；`ttl` 为空时使用实现自身的默认 TTL
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError>;

    /// 删除键，返回删除前是否存在
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// 按前缀列出键（升序）
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// 保存实体。
pub async fn save_entity<S, E>(
    storage: &S,
    entity: &E,
    ttl: Option<Duration>,
) -> Result<(), StorageError>
where
    S: StorageManager + ?Sized,
    E: Entity,
{
    let data = serde_json::to_vec(&entity.to_map())?;
    storage.set(&entity.storage_key(), data, ttl).await
}

/// 读取实体。
pub async fn load_entity<S, E>(storage: &S, key: &str) -> Result<Option<E>, StorageError>
where
    S: StorageManager + ?Sized,
    E: Entity,
{
    let Some(data) = storage.get(key).await? else {
        return Ok(None);
    };
    let map: EntityMap = serde_json::from_slice(&data)?;
    let entity = E::from_map(&map).map_err(|err| StorageError::Serialization(err.to_string()))?;
    Ok(Some(entity))
}

/// 删除实体。
pub async fn delete_entity<S>(storage: &S, key: &str) -> Result<bool, StorageError>
where
    S: StorageManager + ?Sized,
{
    storage.delete(key).await
}

/// 按实体类型的存储接口
///
/// 对所有 StorageManager 自动实现。
#[async_trait]
pub trait ExtendedStorageManager: StorageManager {
    async fn save_device_data(&self, device: &DeviceData) -> Result<(), StorageError> {
        save_entity(self, device, None).await
    }

    async fn load_device_data(&self, device_id: &str) -> Result<Option<DeviceData>, StorageError> {
        load_entity(self, &device_key(device_id)).await
    }

    async fn delete_device_data(&self, device_id: &str) -> Result<bool, StorageError> {
        delete_entity(self, &device_key(device_id)).await
    }

    async fn save_device_state(&self, state: &DeviceState) -> Result<(), StorageError> {
        save_entity(self, state, None).await
    }

    async fn load_device_state(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceState>, StorageError> {
        load_entity(self, &state_key(device_id)).await
    }

    async fn delete_device_state(&self, device_id: &str) -> Result<bool, StorageError> {
        delete_entity(self, &state_key(device_id)).await
    }

    async fn save_port_data(&self, port: &PortData) -> Result<(), StorageError> {
        save_entity(self, port, None).await
    }

    async fn load_port_data(
        &self,
        device_id: &str,
        port_number: u32,
    ) -> Result<Option<PortData>, StorageError> {
        load_entity(self, &port_key(device_id, port_number)).await
    }

    async fn delete_port_data(
        &self,
        device_id: &str,
        port_number: u32,
    ) -> Result<bool, StorageError> {
        delete_entity(self, &port_key(device_id, port_number)).await
    }

    async fn save_order_data(&self, order: &OrderData) -> Result<(), StorageError> {
        save_entity(self, order, None).await
    }

    async fn load_order_data(&self, order_id: &str) -> Result<Option<OrderData>, StorageError> {
        load_entity(self, &order_key(order_id)).await
    }

    async fn delete_order_data(&self, order_id: &str) -> Result<bool, StorageError> {
        delete_entity(self, &order_key(order_id)).await
    }

    async fn save_protocol_data(&self, record: &ProtocolData) -> Result<(), StorageError> {
        save_entity(self, record, None).await
    }

    async fn load_protocol_data(
        &self,
        conn_id: u64,
        message_id: u16,
    ) -> Result<Option<ProtocolData>, StorageError> {
        load_entity(self, &protocol_key(conn_id, message_id)).await
    }

    async fn delete_protocol_data(
        &self,
        conn_id: u64,
        message_id: u16,
    ) -> Result<bool, StorageError> {
        delete_entity(self, &protocol_key(conn_id, message_id)).await
    }
}

impl<T: StorageManager + ?Sized> ExtendedStorageManager for T {}
