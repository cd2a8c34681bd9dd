//! 数据总线错误类型

use domain::{EntityKind, ValidationError};
use iotgw_eventbus::EventBusError;
use iotgw_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum DataBusError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("{kind} not found: {key}")]
    NotFound { kind: EntityKind, key: String },
    #[error("data bus not running")]
    NotRunning,
    #[error("capacity exceeded: {0}")]
    Capacity(String),
    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: EntityKind, key: String },
    #[error("version conflict on {key}: expected {expected}, actual {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("event delivery failed: {0}")]
    Delivery(#[from] EventBusError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("batch failed: {failed} of {total} operations failed, first error: {first_error}")]
    PartialFailure {
        total: usize,
        failed: usize,
        first_error: String,
    },
    #[error(
        "transaction failed at step {step}: {reason} (rolled back {rolled_back}, rollback failures {rollback_failures})"
    )]
    TransactionFailed {
        step: usize,
        reason: String,
        rolled_back: usize,
        rollback_failures: usize,
    },
}

impl DataBusError {
    pub fn not_found(kind: EntityKind, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// 事件发布适配器错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("publisher not running")]
    NotRunning,
    #[error("publish queue full")]
    QueueFull,
    #[error("delivery failed after {attempts} attempts: {reason}")]
    Delivery { attempts: u32, reason: String },
}
