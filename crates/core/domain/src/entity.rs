//! 实体公共接口。

use crate::map::EntityMap;
use crate::validation::ValidationError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// 实体种类。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Device,
    State,
    Port,
    Order,
    Protocol,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::State => "state",
            Self::Port => "port",
            Self::Order => "order",
            Self::Protocol => "protocol",
        }
    }

    /// 该类实体全部存储键的公共前缀。
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Self::Device => crate::keys::DEVICE_PREFIX,
            Self::State => crate::keys::STATE_PREFIX,
            Self::Port => crate::keys::PORT_PREFIX,
            Self::Order => crate::keys::ORDER_PREFIX,
            Self::Protocol => crate::keys::PROTOCOL_PREFIX,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 数据总线实体。
///
/// 版本号只增不减，由数据管理器在每次写入时递增。
pub trait Entity: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    /// 确定性的存储键（见 [`crate::keys`]）。
    fn storage_key(&self) -> String;

    fn validate(&self) -> Result<(), ValidationError>;

    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);

    fn updated_at_ms(&self) -> i64;

    fn set_updated_at_ms(&mut self, ts_ms: i64);

    fn to_map(&self) -> EntityMap;

    fn from_map(map: &EntityMap) -> Result<Self, ValidationError>;

    fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
