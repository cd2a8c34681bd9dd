//! # 网关领域模型
//!
//! 数据总线上流转的全部实体类型：
//! - [`DeviceData`]：设备身份与连接描述
//! - [`DeviceState`]：连接/业务/健康三维状态与状态历史
//! - [`PortData`]：端口遥测
//! - [`OrderData`]：充电订单生命周期
//! - [`ProtocolData`]：单次协议帧交换记录
//!
//! 所有实体实现 [`Entity`]：统一的校验、版本号、存储键与 map 转换。
//! 实体只由对应的数据管理器持有，外部拿到的永远是副本。

pub mod device;
pub mod entity;
pub mod keys;
pub mod map;
pub mod order;
pub mod port;
pub mod protocol;
pub mod state;
pub mod validation;

pub use device::DeviceData;
pub use entity::{Entity, EntityKind};
pub use map::EntityMap;
pub use order::{OrderData, OrderStatus};
pub use port::PortData;
pub use protocol::{Direction, ProcessingStatus, ProtocolData};
pub use state::{
    BusinessState, ConnectionState, DeviceState, HealthState, StateSnapshot, StateTransition,
};
pub use validation::ValidationError;

/// 获取当前时间戳（毫秒）
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
