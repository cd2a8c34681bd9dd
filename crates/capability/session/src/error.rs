//! 会话错误类型

use domain::ValidationError;
use iotgw_databus::DataBusError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: conn {0}")]
    NotFound(u64),
    #[error("no session bound to device {0}")]
    DeviceNotFound(String),
    #[error("session already exists: conn {0}")]
    AlreadyExists(u64),
    #[error("session limit reached: {0}")]
    Capacity(usize),
    #[error("invalid session state: {0}")]
    InvalidState(String),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("data bus error: {0}")]
    DataBus(#[from] DataBusError),
}

impl SessionError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::DeviceNotFound(_))
    }
}
