//! 连接生命周期钩子
//!
//! 传输层在连接的各个节点调用，由组合根实现。

use crate::error::BridgeError;
use iotgw_session::ConnectionInfo;

#[async_trait::async_trait]
pub trait ConnectionHooks: Send + Sync {
    async fn on_connection_established(&self, conn: &ConnectionInfo) -> Result<(), BridgeError>;

    async fn on_connection_closed(&self, conn: &ConnectionInfo) -> Result<(), BridgeError>;

    async fn on_device_registered(
        &self,
        conn: &ConnectionInfo,
        device_id: &str,
        physical_id: &str,
        iccid: &str,
        device_type: u16,
    ) -> Result<(), BridgeError>;

    async fn on_data_received(&self, conn: &ConnectionInfo, data: &[u8]) -> Result<(), BridgeError>;

    async fn on_data_sent(&self, conn: &ConnectionInfo, data: &[u8]) -> Result<(), BridgeError>;

    async fn on_heartbeat_received(
        &self,
        conn: &ConnectionInfo,
        device_id: &str,
    ) -> Result<(), BridgeError>;
}
