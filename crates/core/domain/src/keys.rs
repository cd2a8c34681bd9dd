//! 存储键规则。
//!
//! 键格式固定，存储层与数据管理器共用同一套规则。

pub const DEVICE_PREFIX: &str = "device:";
pub const STATE_PREFIX: &str = "state:";
pub const PORT_PREFIX: &str = "port:";
pub const ORDER_PREFIX: &str = "order:";
pub const PROTOCOL_PREFIX: &str = "protocol:";

pub fn device_key(device_id: &str) -> String {
    format!("device:{}", device_id)
}

pub fn state_key(device_id: &str) -> String {
    format!("state:{}", device_id)
}

pub fn port_key(device_id: &str, port_number: u32) -> String {
    format!("port:{}:{}", device_id, port_number)
}

/// 某个设备全部端口的键前缀。
pub fn device_ports_prefix(device_id: &str) -> String {
    format!("port:{}:", device_id)
}

pub fn order_key(order_id: &str) -> String {
    format!("order:{}", order_id)
}

pub fn protocol_key(conn_id: u64, message_id: u16) -> String {
    format!("protocol:{}:{}", conn_id, message_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_fixed_scheme() {
        assert_eq!(device_key("04A228CD"), "device:04A228CD");
        assert_eq!(state_key("04A228CD"), "state:04A228CD");
        assert_eq!(port_key("04A228CD", 2), "port:04A228CD:2");
        assert_eq!(order_key("ORD-0001"), "order:ORD-0001");
        assert_eq!(protocol_key(42, 7), "protocol:42:7");
        assert!(port_key("04A228CD", 2).starts_with(&device_ports_prefix("04A228CD")));
    }
}
