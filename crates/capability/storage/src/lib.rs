//! # 网关存储模块
//!
//! 数据总线的持久化抽象层。
//!
//! ## 模块说明
//!
//! - [`traits`]：`StorageManager` 键值契约与 `ExtendedStorageManager` 实体存取
//! - [`in_memory`]：内存 L1，可选 TTL，可挂接 L2（write-through / read-through）
//! - [`redis`]：Redis 实现（键前缀、可选 TTL、SCAN 前缀枚举）
//! - [`consistency`]：缓存与存储副本的一致性检查，修复策略可插拔
//! - [`error`]：存储错误类型
//!
//! ## 键约定
//!
//! | 实体 | 键 |
//! |------|----|
//! | DeviceData | `device:<device_id>` |
//! | DeviceState | `state:<device_id>` |
//! | PortData | `port:<device_id>:<port_number>` |
//! | OrderData | `order:<order_id>` |
//! | ProtocolData | `protocol:<conn_id>:<message_id>` |
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use iotgw_storage::{ExtendedStorageManager, InMemoryStorageManager, StorageManager};
//!
//! let storage = InMemoryStorageManager::new();
//! storage.start().await?;
//! storage.save_device_data(&device).await?;
//! let loaded = storage.load_device_data("04A228CD").await?;
//! ```

pub mod consistency;
pub mod error;
pub mod in_memory;
pub mod redis;
pub mod traits;

pub use consistency::{
    ConsistencyManager, ConsistencyStats, Inconsistency, InconsistencyKind, NoopRepairPolicy,
    RepairPolicy,
};
pub use error::StorageError;
pub use in_memory::{InMemoryStorageManager, StorageStats};
pub use redis::RedisStorageManager;
pub use traits::{ExtendedStorageManager, StorageManager, delete_entity, load_entity, save_entity};
