//! 事件总线错误类型

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus not running")]
    NotRunning,
    #[error("event channel full")]
    ChannelFull,
    #[error("subscriber error: {0}")]
    Subscriber(String),
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}
