//! 订阅者接口

use crate::error::EventBusError;
use crate::event::BusEvent;
use std::future::Future;
use tokio::sync::mpsc;

/// 事件订阅者
///
/// 每次调用在独立任务中执行，返回错误只记录日志。
#[async_trait::async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: BusEvent) -> Result<(), EventBusError>;

    fn name(&self) -> &str {
        "subscriber"
    }
}

/// 闭包订阅者
pub struct FnSubscriber<F> {
    name: String,
    callback: F,
}

impl<F, Fut> FnSubscriber<F>
where
    F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(name: impl Into<String>, callback: F) -> Self {
        Self {
            name: name.into(),
            callback,
        }
    }
}

#[async_trait::async_trait]
impl<F, Fut> EventSubscriber for FnSubscriber<F>
where
    F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_event(&self, event: BusEvent) -> Result<(), EventBusError> {
        (self.callback)(event).await;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 转发到无界通道的订阅者
pub struct ChannelSubscriber {
    sender: mpsc::UnboundedSender<BusEvent>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BusEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait::async_trait]
impl EventSubscriber for ChannelSubscriber {
    async fn on_event(&self, event: BusEvent) -> Result<(), EventBusError> {
        self.sender
            .send(event)
            .map_err(|_| EventBusError::Subscriber("receiver dropped".to_string()))
    }

    fn name(&self) -> &str {
        "channel"
    }
}
