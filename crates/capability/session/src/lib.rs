//! # TCP 会话管理
//!
//! 每条设备连接一个会话记录：
//! - 连接 ID ↔ 设备 ID 双向映射，活跃期间双向唯一
//! - 消息/心跳/错误计数与最近活动时间
//! - 会话数上限与空闲超时清理（后台任务）
//!
//! 设备注册、心跳与断开都会同步到数据总线（设备数据与设备状态），
//! 会话事件经事件发布适配器发出。

pub mod error;
pub mod manager;
pub mod session;

pub use error::SessionError;
pub use manager::{SessionConfig, SessionManager};
pub use session::{ActivityKind, ConnectionInfo, SessionState, TcpSession};
