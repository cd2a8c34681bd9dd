//! # 网关数据总线
//!
//! 面向类型化实体的统一访问层。
//!
//! ## 模块说明
//!
//! - [`manager`]：通用数据管理器（校验、版本号、缓存 + 存储）
//! - [`order`]：订单管理器（设备端口索引、活跃订单上限）
//! - [`state`]：设备状态管理器（显著变化判定、状态历史）
//! - [`facade`]：`DataBus` 门面，发布/查询/订阅、生命周期、健康报告
//! - [`batch`]：批量更新与补偿式事务
//! - [`publisher`]：事件发布适配器（优先级信封、队列 worker、固定间隔重试）
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let bus = DataBus::new(storage, DataBusConfig::default());
//! bus.start().await?;
//! bus.subscribe_device_events("audit", |event| async move {
//!     tracing::info!(device_id = %event.device_id, "device_event");
//! })
//! .await;
//! bus.publish_device_data(device).await?;
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod facade;
pub mod manager;
pub mod order;
pub mod publisher;
pub mod state;

pub use batch::{BatchResult, DataOperation, TransactionResult};
pub use config::DataBusConfig;
pub use error::{DataBusError, PublishError};
pub use facade::{DataBus, HealthReport};
pub use manager::{BatchSetOutcome, DataManager, ManagerStats};
pub use order::OrderDataManager;
pub use publisher::{
    AcceptAll, BatchPublishResult, EventEnvelope, EventFilter, EventPriority, EventPublisher,
    PublisherConfig, PublisherStats,
};
pub use state::{DeviceStateManager, StateChangeOutcome, StateUpdate};
