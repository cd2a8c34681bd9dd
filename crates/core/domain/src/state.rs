//! 设备三维状态
//!
//! 连接状态、业务状态、健康状态任一维度变化即为“显著变化”，
//! 只有显著变化才写入状态历史并产生事件；单纯的心跳刷新不算。

use crate::entity::{Entity, EntityKind};
use crate::keys::state_key;
use crate::map::{
    EntityMap, i64_or_default, optional_i64, required_str, u64_or_default,
};
use crate::validation::{ValidationError, validate_device_id};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::VecDeque;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Timeout,
    Error,
}

/// 业务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessState {
    Online,
    Offline,
    Charging,
    Idle,
    Fault,
}

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Normal,
    Warning,
    Error,
    Critical,
}

macro_rules! state_strings {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

state_strings!(ConnectionState {
    Connected => "connected",
    Disconnected => "disconnected",
    Timeout => "timeout",
    Error => "error",
});

state_strings!(BusinessState {
    Online => "online",
    Offline => "offline",
    Charging => "charging",
    Idle => "idle",
    Fault => "fault",
});

state_strings!(HealthState {
    Normal => "normal",
    Warning => "warning",
    Error => "error",
    Critical => "critical",
});

/// 三维状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub connection: ConnectionState,
    pub business: BusinessState,
    pub health: HealthState,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            business: BusinessState::Offline,
            health: HealthState::Normal,
        }
    }
}

/// 状态历史条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: StateSnapshot,
    pub to: StateSnapshot,
    pub reason: String,
    pub at_ms: i64,
}

/// 设备状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub connection_state: ConnectionState,
    pub business_state: BusinessState,
    pub health_state: HealthState,
    pub heartbeat_count: u64,
    pub reconnect_count: u64,
    pub error_count: u64,
    pub last_heartbeat_ms: Option<i64>,
    pub last_state_change_ms: i64,
    /// 最近的状态迁移，最旧的在前
    pub history: VecDeque<StateTransition>,
    pub version: u64,
    pub updated_at_ms: i64,
}

impl DeviceState {
    /// 新设备的初始状态：断开/离线/正常。
    pub fn new(device_id: impl Into<String>) -> Self {
        let snapshot = StateSnapshot::default();
        Self {
            device_id: device_id.into(),
            connection_state: snapshot.connection,
            business_state: snapshot.business,
            health_state: snapshot.health,
            heartbeat_count: 0,
            reconnect_count: 0,
            error_count: 0,
            last_heartbeat_ms: None,
            last_state_change_ms: 0,
            history: VecDeque::new(),
            version: 0,
            updated_at_ms: crate::now_epoch_ms(),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            connection: self.connection_state,
            business: self.business_state,
            health: self.health_state,
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: StateSnapshot) {
        self.connection_state = snapshot.connection;
        self.business_state = snapshot.business;
        self.health_state = snapshot.health;
    }

    /// 与另一状态相比是否为显著变化。
    pub fn is_significant_change(&self, other: &DeviceState) -> bool {
        self.snapshot() != other.snapshot()
    }

    /// 追加一条历史，超过上限时从最旧的一条开始淘汰。
    pub fn push_history(&mut self, transition: StateTransition, cap: usize) {
        if cap == 0 {
            self.history.clear();
            return;
        }
        self.history.push_back(transition);
        self.truncate_history(cap);
    }

    /// 把历史裁剪到上限内，淘汰最旧的记录。
    pub fn truncate_history(&mut self, cap: usize) {
        while self.history.len() > cap {
            self.history.pop_front();
        }
    }

    pub fn is_online(&self) -> bool {
        self.connection_state == ConnectionState::Connected
            && self.business_state != BusinessState::Offline
    }
}

impl Entity for DeviceState {
    const KIND: EntityKind = EntityKind::State;

    fn storage_key(&self) -> String {
        state_key(&self.device_id)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        validate_device_id(&self.device_id)
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn updated_at_ms(&self) -> i64 {
        self.updated_at_ms
    }

    fn set_updated_at_ms(&mut self, ts_ms: i64) {
        self.updated_at_ms = ts_ms;
    }

    fn to_map(&self) -> EntityMap {
        let mut map = EntityMap::new();
        map.insert("device_id".into(), json!(self.device_id));
        map.insert("connection_state".into(), json!(self.connection_state.as_str()));
        map.insert("business_state".into(), json!(self.business_state.as_str()));
        map.insert("health_state".into(), json!(self.health_state.as_str()));
        map.insert("heartbeat_count".into(), json!(self.heartbeat_count));
        map.insert("reconnect_count".into(), json!(self.reconnect_count));
        map.insert("error_count".into(), json!(self.error_count));
        map.insert("last_heartbeat_ms".into(), json!(self.last_heartbeat_ms));
        map.insert("last_state_change_ms".into(), json!(self.last_state_change_ms));
        map.insert(
            "history".into(),
            serde_json::to_value(&self.history).unwrap_or(Value::Array(Vec::new())),
        );
        map.insert("version".into(), json!(self.version));
        map.insert("updated_at_ms".into(), json!(self.updated_at_ms));
        map
    }

    fn from_map(map: &EntityMap) -> Result<Self, ValidationError> {
        let connection_state = parse_state(map, "connection_state", ConnectionState::parse)?;
        let business_state = parse_state(map, "business_state", BusinessState::parse)?;
        let health_state = parse_state(map, "health_state", HealthState::parse)?;
        let history = match map.get("history") {
            Some(Value::Null) | None => VecDeque::new(),
            Some(value) => serde_json::from_value(value.clone()).map_err(|err| {
                ValidationError::Invalid {
                    field: "history",
                    reason: err.to_string(),
                }
            })?,
        };
        Ok(Self {
            device_id: required_str(map, "device_id")?,
            connection_state,
            business_state,
            health_state,
            heartbeat_count: u64_or_default(map, "heartbeat_count")?,
            reconnect_count: u64_or_default(map, "reconnect_count")?,
            error_count: u64_or_default(map, "error_count")?,
            last_heartbeat_ms: optional_i64(map, "last_heartbeat_ms")?,
            last_state_change_ms: i64_or_default(map, "last_state_change_ms")?,
            history,
            version: u64_or_default(map, "version")?,
            updated_at_ms: i64_or_default(map, "updated_at_ms")?,
        })
    }
}

fn parse_state<T>(
    map: &EntityMap,
    field: &'static str,
    parse: fn(&str) -> Option<T>,
) -> Result<T, ValidationError> {
    let text = required_str(map, field)?;
    parse(&text).ok_or(ValidationError::InvalidFormat { field, value: text })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(reason: &str, at_ms: i64) -> StateTransition {
        StateTransition {
            from: StateSnapshot::default(),
            to: StateSnapshot {
                connection: ConnectionState::Connected,
                business: BusinessState::Online,
                health: HealthState::Normal,
            },
            reason: reason.to_string(),
            at_ms,
        }
    }

    #[test]
    fn history_evicts_oldest_first() {
        let mut state = DeviceState::new("04A228CD");
        for idx in 0..5 {
            state.push_history(transition(&format!("t{}", idx), idx), 3);
        }
        assert_eq!(state.history.len(), 3);
        let reasons: Vec<_> = state.history.iter().map(|t| t.reason.as_str()).collect();
        assert_eq!(reasons, vec!["t2", "t3", "t4"]);
    }

    #[test]
    fn truncate_history_keeps_newest_entries() {
        let mut state = DeviceState::new("04A228CD");
        for idx in 0..5 {
            state.history.push_back(transition(&format!("t{}", idx), idx));
        }
        state.truncate_history(2);
        let reasons: Vec<_> = state.history.iter().map(|t| t.reason.as_str()).collect();
        assert_eq!(reasons, vec!["t3", "t4"]);
        state.truncate_history(0);
        assert!(state.history.is_empty());
    }

    #[test]
    fn counters_alone_are_not_significant() {
        let before = DeviceState::new("04A228CD");
        let mut after = before.clone();
        after.heartbeat_count += 1;
        after.last_heartbeat_ms = Some(10);
        assert!(!before.is_significant_change(&after));
        after.health_state = HealthState::Warning;
        assert!(before.is_significant_change(&after));
    }

    #[test]
    fn map_roundtrip_keeps_history() {
        let mut state = DeviceState::new("04A228CD");
        state.push_history(transition("registered", 5), 10);
        state.connection_state = ConnectionState::Connected;
        let restored = DeviceState::from_map(&state.to_map()).expect("from map");
        assert_eq!(restored, state);
    }

    #[test]
    fn unknown_state_text_is_rejected() {
        let mut map = DeviceState::new("04A228CD").to_map();
        map.insert("health_state".into(), json!("exploded"));
        assert!(DeviceState::from_map(&map).is_err());
    }
}
