//! 协议桥错误类型

use iotgw_databus::DataBusError;
use iotgw_session::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("empty data")]
    EmptyData,
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("checksum mismatch: expected {expected:#06x}, actual {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("data bus error: {0}")]
    DataBus(#[from] DataBusError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// 处理器错误：记录日志与统计，不中断协议桥
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),
    #[error("data bus error: {0}")]
    DataBus(#[from] DataBusError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}
