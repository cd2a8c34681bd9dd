//! 存储层错误类型
//!
//! 封装底层错误：
//! - 后端连接/命令错误
//! - 序列化错误
//! - 锁中毒

use domain::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage not running")]
    NotRunning,
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("lock failed")]
    LockFailed,
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
