//! 事件类型
//!
//! 每类实体一个事件结构，统一包在 [`BusEvent`] 中按分类分发。

use domain::{DeviceData, DeviceState, OrderData, PortData, ProtocolData, StateSnapshot};

/// 事件分类，`All` 为通配订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Device,
    StateChange,
    Port,
    Order,
    Protocol,
    Session,
    All,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::StateChange => "state_change",
            Self::Port => "port",
            Self::Order => "order",
            Self::Protocol => "protocol",
            Self::Session => "session",
            Self::All => "all",
        }
    }

    /// 订阅分类是否接收该事件分类
    pub fn accepts(&self, category: EventCategory) -> bool {
        *self == Self::All || *self == category
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    Registered,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub device_id: String,
    pub device: Option<DeviceData>,
    pub timestamp_ms: i64,
}

/// 状态显著变化事件
#[derive(Debug, Clone, PartialEq)]
pub struct StateChangeEvent {
    pub device_id: String,
    pub previous: StateSnapshot,
    pub current: StateSnapshot,
    pub reason: String,
    pub state: Option<DeviceState>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEventKind {
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortEvent {
    pub kind: PortEventKind,
    pub device_id: String,
    pub port_number: u32,
    pub port: Option<PortData>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEventKind {
    Created,
    Updated,
    Completed,
    Cancelled,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderEvent {
    pub kind: OrderEventKind,
    pub order_id: String,
    pub device_id: String,
    pub port_number: u32,
    pub order: Option<OrderData>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolEventKind {
    /// 入站帧已解析并记录
    Received,
    Processed,
    Failed,
    Timeout,
    /// 未注册处理器的命令
    UnknownCommand,
    /// 出站帧已记录
    Sent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolEvent {
    pub kind: ProtocolEventKind,
    pub conn_id: u64,
    pub device_id: String,
    pub command: u8,
    pub message_id: u16,
    pub record: Option<ProtocolData>,
    pub error: Option<String>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Created,
    Registered,
    Removed,
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub conn_id: u64,
    pub device_id: Option<String>,
    pub remote_addr: String,
    pub timestamp_ms: i64,
}

/// 总线事件
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Device(DeviceEvent),
    StateChange(StateChangeEvent),
    Port(PortEvent),
    Order(OrderEvent),
    Protocol(ProtocolEvent),
    Session(SessionEvent),
}

impl BusEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::Device(_) => EventCategory::Device,
            Self::StateChange(_) => EventCategory::StateChange,
            Self::Port(_) => EventCategory::Port,
            Self::Order(_) => EventCategory::Order,
            Self::Protocol(_) => EventCategory::Protocol,
            Self::Session(_) => EventCategory::Session,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Device(event) => Some(&event.device_id),
            Self::StateChange(event) => Some(&event.device_id),
            Self::Port(event) => Some(&event.device_id),
            Self::Order(event) => Some(&event.device_id),
            Self::Protocol(event) if event.device_id.is_empty() => None,
            Self::Protocol(event) => Some(&event.device_id),
            Self::Session(event) => event.device_id.as_deref(),
        }
    }

    pub fn conn_id(&self) -> Option<u64> {
        match self {
            Self::Device(event) => event.device.as_ref().map(|device| device.conn_id),
            Self::Protocol(event) => Some(event.conn_id),
            Self::Session(event) => Some(event.conn_id),
            _ => None,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        match self {
            Self::Device(event) => event.timestamp_ms,
            Self::StateChange(event) => event.timestamp_ms,
            Self::Port(event) => event.timestamp_ms,
            Self::Order(event) => event.timestamp_ms,
            Self::Protocol(event) => event.timestamp_ms,
            Self::Session(event) => event.timestamp_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_accepts_every_category() {
        assert!(EventCategory::All.accepts(EventCategory::Order));
        assert!(EventCategory::Order.accepts(EventCategory::Order));
        assert!(!EventCategory::Order.accepts(EventCategory::Port));
    }

    #[test]
    fn session_event_exposes_ids() {
        let event = BusEvent::Session(SessionEvent {
            kind: SessionEventKind::Created,
            conn_id: 42,
            device_id: None,
            remote_addr: "10.0.0.8:52011".to_string(),
            timestamp_ms: 1,
        });
        assert_eq!(event.category(), EventCategory::Session);
        assert_eq!(event.conn_id(), Some(42));
        assert_eq!(event.device_id(), None);
    }
}
