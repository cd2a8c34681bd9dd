//! 协议帧交换记录

use crate::entity::{Entity, EntityKind};
use crate::keys::protocol_key;
use crate::map::{
    EntityMap, bytes_hex, encode_hex, i64_or_default, object, object_value, optional_str,
    required_str, required_u64, str_or_default, u64_or_default,
};
use crate::validation::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// 数据方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
    Request,
    Response,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Request => "request",
            Self::Response => "response",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            "request" => Some(Self::Request),
            "response" => Some(Self::Response),
            _ => None,
        }
    }
}

/// 处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Received,
    Parsed,
    Processed,
    Error,
    Timeout,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Parsed => "parsed",
            Self::Processed => "processed",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "received" => Some(Self::Received),
            "parsed" => Some(Self::Parsed),
            "processed" => Some(Self::Processed),
            "error" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// 协议数据
///
/// 每帧创建一次，不在原地修改；状态推进时以新版本写入同一键。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolData {
    pub conn_id: u64,
    pub device_id: String,
    pub direction: Direction,
    /// 原始帧字节
    pub raw: Vec<u8>,
    /// 命令码
    pub command: u8,
    /// 消息 ID
    pub message_id: u16,
    pub payload: Vec<u8>,
    /// 解析出的字段
    pub parsed_fields: BTreeMap<String, Value>,
    pub status: ProcessingStatus,
    pub error: Option<String>,
    pub timestamp_ms: i64,
    pub version: u64,
    pub updated_at_ms: i64,
}

impl ProtocolData {
    pub fn new(conn_id: u64, direction: Direction, raw: Vec<u8>) -> Self {
        let now = crate::now_epoch_ms();
        Self {
            conn_id,
            device_id: String::new(),
            direction,
            raw,
            command: 0,
            message_id: 0,
            payload: Vec::new(),
            parsed_fields: BTreeMap::new(),
            status: ProcessingStatus::Received,
            error: None,
            timestamp_ms: now,
            version: 0,
            updated_at_ms: now,
        }
    }

    /// 以新状态派生一条记录。
    pub fn with_status(&self, status: ProcessingStatus, error: Option<String>) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.error = error;
        next
    }
}

impl Entity for ProtocolData {
    const KIND: EntityKind = EntityKind::Protocol;

    fn storage_key(&self) -> String {
        protocol_key(self.conn_id, self.message_id)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.conn_id == 0 {
            return Err(ValidationError::NotPositive { field: "conn_id" });
        }
        if self.raw.is_empty() {
            return Err(ValidationError::MissingField("raw"));
        }
        Ok(())
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
        map.insert("conn_id".into(), json!(self.conn_id));
        map.insert("device_id".into(), json!(self.device_id));
        map.insert("direction".into(), json!(self.direction.as_str()));
        map.insert("raw".into(), json!(encode_hex(&self.raw)));
        map.insert("command".into(), json!(self.command));
        map.insert("message_id".into(), json!(self.message_id));
        map.insert("payload".into(), json!(encode_hex(&self.payload)));
        map.insert("parsed_fields".into(), object_value(&self.parsed_fields));
        map.insert("status".into(), json!(self.status.as_str()));
        map.insert("error".into(), json!(self.error));
        map.insert("timestamp_ms".into(), json!(self.timestamp_ms));
        map.insert("version".into(), json!(self.version));
        map.insert("updated_at_ms".into(), json!(self.updated_at_ms));
        map
    }

    fn from_map(map: &EntityMap) -> Result<Self, ValidationError> {
        let direction_text = required_str(map, "direction")?;
        let direction = Direction::parse(&direction_text).ok_or(ValidationError::InvalidFormat {
            field: "direction",
            value: direction_text,
        })?;
        let status_text = required_str(map, "status")?;
        let status =
            ProcessingStatus::parse(&status_text).ok_or(ValidationError::InvalidFormat {
                field: "status",
                value: status_text,
            })?;
        let command = u8::try_from(u64_or_default(map, "command")?).map_err(|_| {
            ValidationError::Invalid {
                field: "command",
                reason: "out of range".to_string(),
            }
        })?;
        let message_id = u16::try_from(u64_or_default(map, "message_id")?).map_err(|_| {
            ValidationError::Invalid {
                field: "message_id",
                reason: "out of range".to_string(),
            }
        })?;
        Ok(Self {
            conn_id: required_u64(map, "conn_id")?,
            device_id: str_or_default(map, "device_id")?,
            direction,
            raw: bytes_hex(map, "raw")?,
            command,
            message_id,
            payload: bytes_hex(map, "payload")?,
            parsed_fields: object(map, "parsed_fields")?,
            status,
            error: optional_str(map, "error")?,
            timestamp_ms: i64_or_default(map, "timestamp_ms")?,
            version: u64_or_default(map, "version")?,
            updated_at_ms: i64_or_default(map, "updated_at_ms")?,
        })
    }
}
