//! 会话记录

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

/// 会话状态：awaiting_iccid → registered → closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingIccid,
    Registered,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingIccid => "awaiting_iccid",
            Self::Registered => "registered",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 活动类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Message,
    Heartbeat,
    Error,
}

impl FromStr for ActivityKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "message" => Ok(Self::Message),
            "heartbeat" => Ok(Self::Heartbeat),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown activity kind: {}", other)),
        }
    }
}

/// 新连接的描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub conn_id: u64,
    pub remote_addr: String,
}

impl ConnectionInfo {
    pub fn new(conn_id: u64, remote_addr: impl Into<String>) -> Self {
        Self {
            conn_id,
            remote_addr: remote_addr.into(),
        }
    }
}

/// 一条 TCP 连接的运行时记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TcpSession {
    pub conn_id: u64,
    pub device_id: Option<String>,
    pub physical_id: Option<u32>,
    pub iccid: Option<String>,
    pub device_type: Option<u16>,
    pub remote_addr: String,
    pub state: SessionState,
    pub created_at_ms: i64,
    pub registered_at_ms: Option<i64>,
    pub last_activity_ms: i64,
    pub last_heartbeat_ms: Option<i64>,
    pub message_count: u64,
    pub heartbeat_count: u64,
    pub error_count: u64,
    pub properties: BTreeMap<String, Value>,
}

impl TcpSession {
    pub fn new(info: &ConnectionInfo, now_ms: i64) -> Self {
        Self {
            conn_id: info.conn_id,
            device_id: None,
            physical_id: None,
            iccid: None,
            device_type: None,
            remote_addr: info.remote_addr.clone(),
            state: SessionState::AwaitingIccid,
            created_at_ms: now_ms,
            registered_at_ms: None,
            last_activity_ms: now_ms,
            last_heartbeat_ms: None,
            message_count: 0,
            heartbeat_count: 0,
            error_count: 0,
            properties: BTreeMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != SessionState::Closed
    }

    pub fn is_registered(&self) -> bool {
        self.state == SessionState::Registered
    }

    /// 空闲时长（毫秒）
    pub fn idle_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.last_activity_ms).max(0)
    }

    pub(crate) fn record(&mut self, kind: ActivityKind, now_ms: i64) {
        self.last_activity_ms = now_ms;
        match kind {
            ActivityKind::Message => self.message_count += 1,
            ActivityKind::Heartbeat => {
                self.heartbeat_count += 1;
                self.last_heartbeat_ms = Some(now_ms);
            }
            ActivityKind::Error => self.error_count += 1,
        }
    }

    pub(crate) fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}
