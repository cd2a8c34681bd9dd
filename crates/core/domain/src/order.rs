//! 充电订单

use crate::entity::{Entity, EntityKind};
use crate::keys::order_key;
use crate::map::{
    EntityMap, f64_or_default, i64_or_default, optional_i64, optional_str, required_str,
    required_u64, u64_or_default,
};
use crate::validation::{ValidationError, ensure_non_negative, validate_device_id};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const MIN_ORDER_ID_LEN: usize = 8;

/// 订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Active,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// 计入活跃订单上限的状态。
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Created | Self::Active)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 订单数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderData {
    pub order_id: String,
    pub device_id: String,
    pub port_number: u32,
    pub status: OrderStatus,
    pub created_at_ms: Option<i64>,
    pub start_time_ms: Option<i64>,
    pub end_time_ms: Option<i64>,
    /// 充电电量（kWh）
    pub energy_kwh: f64,
    /// 最大功率（W）
    pub max_power_w: f64,
    /// 总费用
    pub total_fee: f64,
    pub charge_duration_secs: i64,
    pub card_number: Option<String>,
    pub stop_reason: Option<String>,
    pub version: u64,
    pub updated_at_ms: i64,
}

impl OrderData {
    pub fn new(
        order_id: impl Into<String>,
        device_id: impl Into<String>,
        port_number: u32,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            device_id: device_id.into(),
            port_number,
            status: OrderStatus::Created,
            created_at_ms: None,
            start_time_ms: None,
            end_time_ms: None,
            energy_kwh: 0.0,
            max_power_w: 0.0,
            total_fee: 0.0,
            charge_duration_secs: 0,
            card_number: None,
            stop_reason: None,
            version: 0,
            updated_at_ms: crate::now_epoch_ms(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// 索引键：`<device_id>:<port_number>`。
    pub fn device_port_key(&self) -> String {
        device_port_key(&self.device_id, self.port_number)
    }

    /// 设置终态与结束时间；结束时间不早于开始时间。
    pub fn finish(&mut self, status: OrderStatus, now_ms: i64) {
        self.status = status;
        let end = match self.start_time_ms {
            Some(start) if start > now_ms => start,
            _ => now_ms,
        };
        self.end_time_ms = Some(end);
        if let Some(start) = self.start_time_ms {
            self.charge_duration_secs = (end - start) / 1000;
        }
    }
}

pub fn device_port_key(device_id: &str, port_number: u32) -> String {
    format!("{}:{}", device_id, port_number)
}

impl Entity for OrderData {
    const KIND: EntityKind = EntityKind::Order;

    fn storage_key(&self) -> String {
        order_key(&self.order_id)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.order_id.trim().is_empty() {
            return Err(ValidationError::MissingField("order_id"));
        }
        if self.order_id.len() < MIN_ORDER_ID_LEN {
            return Err(ValidationError::Invalid {
                field: "order_id",
                reason: format!("must be at least {} characters", MIN_ORDER_ID_LEN),
            });
        }
        validate_device_id(&self.device_id)?;
        if self.port_number == 0 {
            return Err(ValidationError::NotPositive {
                field: "port_number",
            });
        }
        if let (Some(start), Some(end)) = (self.start_time_ms, self.end_time_ms) {
            if end < start {
                return Err(ValidationError::Invalid {
                    field: "end_time_ms",
                    reason: "end time precedes start time".to_string(),
                });
            }
        }
        ensure_non_negative("energy_kwh", self.energy_kwh)?;
        ensure_non_negative("max_power_w", self.max_power_w)?;
        ensure_non_negative("total_fee", self.total_fee)?;
        if self.charge_duration_secs < 0 {
            return Err(ValidationError::Negative {
                field: "charge_duration_secs",
                value: self.charge_duration_secs as f64,
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
        map.insert("order_id".into(), json!(self.order_id));
        map.insert("device_id".into(), json!(self.device_id));
        map.insert("port_number".into(), json!(self.port_number));
        map.insert("status".into(), json!(self.status.as_str()));
        map.insert("created_at_ms".into(), json!(self.created_at_ms));
        map.insert("start_time_ms".into(), json!(self.start_time_ms));
        map.insert("end_time_ms".into(), json!(self.end_time_ms));
        map.insert("energy_kwh".into(), json!(self.energy_kwh));
        map.insert("max_power_w".into(), json!(self.max_power_w));
        map.insert("total_fee".into(), json!(self.total_fee));
        map.insert("charge_duration_secs".into(), json!(self.charge_duration_secs));
        map.insert("card_number".into(), json!(self.card_number));
        map.insert("stop_reason".into(), json!(self.stop_reason));
        map.insert("version".into(), json!(self.version));
        map.insert("updated_at_ms".into(), json!(self.updated_at_ms));
        map
    }

    fn from_map(map: &EntityMap) -> Result<Self, ValidationError> {
        let status_text = required_str(map, "status")?;
        let status = OrderStatus::parse(&status_text).ok_or(ValidationError::InvalidFormat {
            field: "status",
            value: status_text,
        })?;
        let port_number =
            u32::try_from(required_u64(map, "port_number")?).map_err(|_| ValidationError::Invalid {
                field: "port_number",
                reason: "out of range".to_string(),
            })?;
        Ok(Self {
            order_id: required_str(map, "order_id")?,
            device_id: required_str(map, "device_id")?,
            port_number,
            status,
            created_at_ms: optional_i64(map, "created_at_ms")?,
            start_time_ms: optional_i64(map, "start_time_ms")?,
            end_time_ms: optional_i64(map, "end_time_ms")?,
            energy_kwh: f64_or_default(map, "energy_kwh")?,
            max_power_w: f64_or_default(map, "max_power_w")?,
            total_fee: f64_or_default(map, "total_fee")?,
            charge_duration_secs: i64_or_default(map, "charge_duration_secs")?,
            card_number: optional_str(map, "card_number")?,
            stop_reason: optional_str(map, "stop_reason")?,
            version: u64_or_default(map, "version")?,
            updated_at_ms: i64_or_default(map, "updated_at_ms")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_id_needs_eight_chars() {
        let order = OrderData::new("ORD-0001", "04A228CD", 1);
        order.validate().expect("valid");
        let short = OrderData::new("ORD-1", "04A228CD", 1);
        assert!(short.validate().is_err());
    }

    #[test]
    fn end_before_start_is_rejected() {
        let mut order = OrderData::new("ORD-0001", "04A228CD", 1);
        order.start_time_ms = Some(2_000);
        order.end_time_ms = Some(1_000);
        assert!(order.validate().is_err());
    }

    #[test]
    fn finish_never_precedes_start() {
        let mut order = OrderData::new("ORD-0001", "04A228CD", 1);
        order.start_time_ms = Some(10_000);
        order.finish(OrderStatus::Completed, 5_000);
        assert_eq!(order.end_time_ms, Some(10_000));
        order.validate().expect("valid");

        order.finish(OrderStatus::Completed, 70_000);
        assert_eq!(order.charge_duration_secs, 60);
    }

    #[test]
    fn active_statuses() {
        assert!(OrderStatus::Created.is_active());
        assert!(OrderStatus::Active.is_active());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert_eq!(OrderStatus::parse("timeout"), Some(OrderStatus::Timeout));
    }
}
