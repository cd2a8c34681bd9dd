//! 数据总线配置

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBusConfig {
    /// 事件总线通道容量
    pub event_buffer_size: usize,
    /// 活跃订单（created/active）上限
    pub max_active_orders: usize,
    /// 每台设备保留的状态历史条数
    pub state_history_size: usize,
}

impl Default for DataBusConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            max_active_orders: 1000,
            state_history_size: 100,
        }
    }
}

impl DataBusConfig {
    pub fn sanitized(mut self) -> Self {
        self.event_buffer_size = self.event_buffer_size.max(1);
        self.max_active_orders = self.max_active_orders.max(1);
        self
    }
}
