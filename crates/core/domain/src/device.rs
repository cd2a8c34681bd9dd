//! 设备身份与连接描述

use crate::entity::{Entity, EntityKind};
use crate::keys::device_key;
use crate::map::{
    EntityMap, i64_or_default, object, object_value, required_str, required_u64, str_or_default,
    string_list, u64_or_default,
};
use crate::validation::{ValidationError, validate_device_id, validate_iccid};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// 设备数据
///
/// 注册时创建，元数据变化时更新；只有运维显式操作才会删除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceData {
    /// 设备 ID（8 位十六进制，大写）
    pub device_id: String,
    /// 物理 ID
    pub physical_id: u32,
    /// SIM 卡 ICCID
    pub iccid: String,
    /// 当前连接 ID
    pub conn_id: u64,
    /// 远端地址
    pub remote_addr: String,
    /// 设备类型
    pub device_type: u16,
    pub device_model: String,
    pub firmware_version: String,
    /// 端口数量
    pub port_count: u32,
    pub capabilities: Vec<String>,
    /// 自由扩展属性
    pub properties: BTreeMap<String, Value>,
    pub registered_at_ms: i64,
    pub last_seen_ms: i64,
    pub version: u64,
    pub updated_at_ms: i64,
}

impl DeviceData {
    pub fn new(
        device_id: impl Into<String>,
        physical_id: u32,
        iccid: impl Into<String>,
        conn_id: u64,
        device_type: u16,
    ) -> Self {
        let now = crate::now_epoch_ms();
        Self {
            device_id: crate::validation::canonical_device_id(&device_id.into()),
            physical_id,
            iccid: iccid.into(),
            conn_id,
            remote_addr: String::new(),
            device_type,
            device_model: String::new(),
            firmware_version: String::new(),
            port_count: 0,
            capabilities: Vec::new(),
            properties: BTreeMap::new(),
            registered_at_ms: now,
            last_seen_ms: now,
            version: 0,
            updated_at_ms: now,
        }
    }

    pub fn with_remote_addr(mut self, remote_addr: impl Into<String>) -> Self {
        self.remote_addr = remote_addr.into();
        self
    }

    pub fn with_port_count(mut self, port_count: u32) -> Self {
        self.port_count = port_count;
        self
    }
}

impl Entity for DeviceData {
    const KIND: EntityKind = EntityKind::Device;

    fn storage_key(&self) -> String {
        device_key(&self.device_id)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        validate_device_id(&self.device_id)?;
        if self.physical_id == 0 {
            return Err(ValidationError::NotPositive {
                field: "physical_id",
            });
        }
        validate_iccid(&self.iccid)?;
        if self.conn_id == 0 {
            return Err(ValidationError::NotPositive { field: "conn_id" });
        }
        if self.device_type == 0 {
            return Err(ValidationError::NotPositive {
                field: "device_type",
            });
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
        map.insert("device_id".into(), json!(self.device_id));
        map.insert("physical_id".into(), json!(self.physical_id));
        map.insert("iccid".into(), json!(self.iccid));
        map.insert("conn_id".into(), json!(self.conn_id));
        map.insert("remote_addr".into(), json!(self.remote_addr));
        map.insert("device_type".into(), json!(self.device_type));
        map.insert("device_model".into(), json!(self.device_model));
        map.insert("firmware_version".into(), json!(self.firmware_version));
        map.insert("port_count".into(), json!(self.port_count));
        map.insert("capabilities".into(), json!(self.capabilities));
        map.insert("properties".into(), object_value(&self.properties));
        map.insert("registered_at_ms".into(), json!(self.registered_at_ms));
        map.insert("last_seen_ms".into(), json!(self.last_seen_ms));
        map.insert("version".into(), json!(self.version));
        map.insert("updated_at_ms".into(), json!(self.updated_at_ms));
        map
    }

    fn from_map(map: &EntityMap) -> Result<Self, ValidationError> {
        let physical_id = u32::try_from(required_u64(map, "physical_id")?).map_err(|_| {
            ValidationError::Invalid {
                field: "physical_id",
                reason: "out of range".to_string(),
            }
        })?;
        let device_type = u16::try_from(u64_or_default(map, "device_type")?).map_err(|_| {
            ValidationError::Invalid {
                field: "device_type",
                reason: "out of range".to_string(),
            }
        })?;
        let port_count = u32::try_from(u64_or_default(map, "port_count")?).map_err(|_| {
            ValidationError::Invalid {
                field: "port_count",
                reason: "out of range".to_string(),
            }
        })?;
        Ok(Self {
            device_id: required_str(map, "device_id")?,
            physical_id,
            iccid: required_str(map, "iccid")?,
            conn_id: required_u64(map, "conn_id")?,
            remote_addr: str_or_default(map, "remote_addr")?,
            device_type,
            device_model: str_or_default(map, "device_model")?,
            firmware_version: str_or_default(map, "firmware_version")?,
            port_count,
            capabilities: string_list(map, "capabilities")?,
            properties: object(map, "properties")?,
            registered_at_ms: i64_or_default(map, "registered_at_ms")?,
            last_seen_ms: i64_or_default(map, "last_seen_ms")?,
            version: u64_or_default(map, "version")?,
            updated_at_ms: i64_or_default(map, "updated_at_ms")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeviceData {
        DeviceData::new("04a228cd", 0x04A2_28CD, "89860318123456789012", 42, 1)
            .with_remote_addr("10.0.0.8:52011")
            .with_port_count(2)
    }

    #[test]
    fn valid_device_passes() {
        let device = sample();
        assert_eq!(device.device_id, "04A228CD");
        device.validate().expect("valid");
    }

    #[test]
    fn each_required_field_is_checked() {
        let mut device = sample();
        device.device_id = String::new();
        assert!(device.validate().is_err());

        let mut device = sample();
        device.device_id = "XYZ".to_string();
        assert!(device.validate().is_err());

        let mut device = sample();
        device.physical_id = 0;
        assert!(device.validate().is_err());

        let mut device = sample();
        device.iccid = "12345678901234567890".to_string();
        assert!(device.validate().is_err());

        let mut device = sample();
        device.conn_id = 0;
        assert!(device.validate().is_err());

        let mut device = sample();
        device.device_type = 0;
        assert!(device.validate().is_err());
    }

    #[test]
    fn map_roundtrip_keeps_identity() {
        let mut device = sample();
        device
            .properties
            .insert("signal".to_string(), serde_json::json!(23));
        device.capabilities.push("dual_port".to_string());
        let restored = DeviceData::from_map(&device.to_map()).expect("from map");
        assert_eq!(restored.device_id, device.device_id);
        assert_eq!(restored.physical_id, device.physical_id);
        assert_eq!(restored.iccid, device.iccid);
        assert_eq!(restored.conn_id, device.conn_id);
        assert_eq!(restored, device);
    }

    #[test]
    fn from_map_rejects_missing_identity() {
        let mut map = sample().to_map();
        map.remove("iccid");
        assert_eq!(
            DeviceData::from_map(&map).expect_err("missing"),
            ValidationError::MissingField("iccid")
        );
    }
}
