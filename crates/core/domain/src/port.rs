//! 端口遥测数据

use crate::entity::{Entity, EntityKind};
use crate::keys::port_key;
use crate::map::{
    EntityMap, bool_or_default, f64_or_default, i64_or_default, optional_str, required_str,
    required_u64, u64_or_default,
};
use crate::validation::{ValidationError, ensure_non_negative, validate_device_id};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// 端口数据
///
/// `port_number` 为对外 API 使用的 1 起编号，`protocol_port` 为协议帧中的 0 起编号，
/// 两者分开保存。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortData {
    pub device_id: String,
    /// 端口号（1 起）
    pub port_number: u32,
    /// 协议端口号（0 起）
    pub protocol_port: u8,
    pub is_charging: bool,
    pub is_enabled: bool,
    /// 功率（W）
    pub power_w: f64,
    /// 电压（V）
    pub voltage_v: f64,
    /// 电流（A）
    pub current_a: f64,
    /// 温度（℃），可为负
    pub temperature_c: f64,
    /// 累计电量（kWh）
    pub energy_kwh: f64,
    /// 充电时长（秒）
    pub charge_duration_secs: i64,
    /// 当前关联订单
    pub order_id: Option<String>,
    pub version: u64,
    pub updated_at_ms: i64,
}

impl PortData {
    pub fn new(device_id: impl Into<String>, port_number: u32) -> Self {
        Self {
            device_id: device_id.into(),
            port_number,
            protocol_port: port_number.saturating_sub(1).min(u8::MAX as u32) as u8,
            is_charging: false,
            is_enabled: true,
            power_w: 0.0,
            voltage_v: 0.0,
            current_a: 0.0,
            temperature_c: 0.0,
            energy_kwh: 0.0,
            charge_duration_secs: 0,
            order_id: None,
            version: 0,
            updated_at_ms: crate::now_epoch_ms(),
        }
    }

    /// 由协议端口号（0 起）构造。
    pub fn from_protocol_port(device_id: impl Into<String>, protocol_port: u8) -> Self {
        let mut port = Self::new(device_id, protocol_port as u32 + 1);
        port.protocol_port = protocol_port;
        port
    }
}

impl Entity for PortData {
    const KIND: EntityKind = EntityKind::Port;

    fn storage_key(&self) -> String {
        port_key(&self.device_id, self.port_number)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        validate_device_id(&self.device_id)?;
        if self.port_number == 0 {
            return Err(ValidationError::NotPositive {
                field: "port_number",
            });
        }
        ensure_non_negative("power_w", self.power_w)?;
        ensure_non_negative("voltage_v", self.voltage_v)?;
        ensure_non_negative("current_a", self.current_a)?;
        ensure_non_negative("energy_kwh", self.energy_kwh)?;
        if self.charge_duration_secs < 0 {
            return Err(ValidationError::Negative {
                field: "charge_duration_secs",
                value: self.charge_duration_secs as f64,
            });
        }
        if !self.temperature_c.is_finite() {
            return Err(ValidationError::Invalid {
                field: "temperature_c",
                reason: "not finite".to_string(),
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
        map.insert("port_number".into(), json!(self.port_number));
        map.insert("protocol_port".into(), json!(self.protocol_port));
        map.insert("is_charging".into(), json!(self.is_charging));
        map.insert("is_enabled".into(), json!(self.is_enabled));
        map.insert("power_w".into(), json!(self.power_w));
        map.insert("voltage_v".into(), json!(self.voltage_v));
        map.insert("current_a".into(), json!(self.current_a));
        map.insert("temperature_c".into(), json!(self.temperature_c));
        map.insert("energy_kwh".into(), json!(self.energy_kwh));
        map.insert("charge_duration_secs".into(), json!(self.charge_duration_secs));
        map.insert("order_id".into(), json!(self.order_id));
        map.insert("version".into(), json!(self.version));
        map.insert("updated_at_ms".into(), json!(self.updated_at_ms));
        map
    }

    fn from_map(map: &EntityMap) -> Result<Self, ValidationError> {
        let port_number =
            u32::try_from(required_u64(map, "port_number")?).map_err(|_| ValidationError::Invalid {
                field: "port_number",
                reason: "out of range".to_string(),
            })?;
        let protocol_port = u8::try_from(u64_or_default(map, "protocol_port")?).map_err(|_| {
            ValidationError::Invalid {
                field: "protocol_port",
                reason: "out of range".to_string(),
            }
        })?;
        Ok(Self {
            device_id: required_str(map, "device_id")?,
            port_number,
            protocol_port,
            is_charging: bool_or_default(map, "is_charging")?,
            is_enabled: bool_or_default(map, "is_enabled")?,
            power_w: f64_or_default(map, "power_w")?,
            voltage_v: f64_or_default(map, "voltage_v")?,
            current_a: f64_or_default(map, "current_a")?,
            temperature_c: f64_or_default(map, "temperature_c")?,
            energy_kwh: f64_or_default(map, "energy_kwh")?,
            charge_duration_secs: i64_or_default(map, "charge_duration_secs")?,
            order_id: optional_str(map, "order_id")?,
            version: u64_or_default(map, "version")?,
            updated_at_ms: i64_or_default(map, "updated_at_ms")?,
        })
    }
}
