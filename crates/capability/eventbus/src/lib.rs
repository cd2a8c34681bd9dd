//! # 网关事件总线
//!
//! - [`event`]：事件联合类型 [`BusEvent`] 与分类 [`EventCategory`]
//! - [`bus`]：有界通道 + 单分发循环的 [`EventBus`]
//! - [`subscriber`]：订阅者接口与闭包/通道适配
//!
//! 发布从不阻塞：通道满时立即返回 [`EventBusError::ChannelFull`]。

pub mod bus;
pub mod error;
pub mod event;
pub mod subscriber;

pub use bus::{EventBus, EventBusConfig, EventBusStats, SubscriptionId};
pub use error::EventBusError;
pub use event::{
    BusEvent, DeviceEvent, DeviceEventKind, EventCategory, OrderEvent, OrderEventKind, PortEvent,
    PortEventKind, ProtocolEvent, ProtocolEventKind, SessionEvent, SessionEventKind,
    StateChangeEvent,
};
pub use subscriber::{ChannelSubscriber, EventSubscriber, FnSubscriber};
