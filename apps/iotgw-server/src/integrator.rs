//! 网关组合根：把传输层的连接生命周期接到会话管理与协议桥上。

use crate::outbox::Outbox;
use iotgw_bridge::{BridgeError, ConnectionHooks, ICCID_LEN, ProcessOutcome, ProtocolBridge};
use iotgw_session::{ActivityKind, ConnectionInfo, SessionError, SessionManager};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Integrator {
    sessions: Arc<SessionManager>,
    bridge: Arc<ProtocolBridge>,
    outbox: Arc<Outbox>,
}

impl Integrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        bridge: Arc<ProtocolBridge>,
        outbox: Arc<Outbox>,
    ) -> Self {
        Self {
            sessions,
            bridge,
            outbox,
        }
    }

    pub fn bridge(&self) -> &Arc<ProtocolBridge> {
        &self.bridge
    }

    /// 向连接下发一帧；连接已断开时返回 false。
    pub fn reply(&self, conn_id: u64, frame: Vec<u8>) -> bool {
        self.outbox.send(conn_id, frame)
    }
}

/// 识别 ICCID 上报块。
pub fn iccid_chunk(data: &[u8]) -> Option<&str> {
    if data.len() != ICCID_LEN || !data.starts_with(b"89") {
        return None;
    }
    std::str::from_utf8(data)
        .ok()
        .filter(|text| text.bytes().all(|b| b.is_ascii_hexdigit()))
}

#[async_trait::async_trait]
impl ConnectionHooks for Integrator {
    async fn on_connection_established(&self, conn: &ConnectionInfo) -> Result<(), BridgeError> {
        self.sessions.create_session(conn.clone()).await?;
        info!(
            target: "iotgw.integrator",
            conn_id = conn.conn_id,
            remote_addr = %conn.remote_addr,
            "connection_established"
        );
        Ok(())
    }

    async fn on_connection_closed(&self, conn: &ConnectionInfo) -> Result<(), BridgeError> {
        match self.sessions.remove_session(conn.conn_id).await {
            // 会话可能已被清理任务回收
            Ok(_) | Err(SessionError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        info!(target: "iotgw.integrator", conn_id = conn.conn_id, "connection_closed");
        Ok(())
    }

    async fn on_device_registered(
        &self,
        conn: &ConnectionInfo,
        device_id: &str,
        physical_id: &str,
        iccid: &str,
        device_type: u16,
    ) -> Result<(), BridgeError> {
        self.sessions
            .register_device(conn.conn_id, device_id, physical_id, iccid, device_type)
            .await?;
        info!(
            target: "iotgw.integrator",
            conn_id = conn.conn_id,
            device_id,
            device_type,
            "device_registered"
        );
        Ok(())
    }

    async fn on_data_received(
        &self,
        conn: &ConnectionInfo,
        data: &[u8],
    ) -> Result<(), BridgeError> {
        if let Some(iccid) = iccid_chunk(data) {
            self.sessions.set_session_iccid(conn.conn_id, iccid).await?;
            self.sessions
                .update_session_activity(conn.conn_id, ActivityKind::Message)
                .await?;
            return Ok(());
        }
        match self.bridge.process_incoming_data(conn, data).await? {
            ProcessOutcome::Processed {
                command,
                elapsed_ms,
            } => {
                debug!(
                    target: "iotgw.integrator",
                    conn_id = conn.conn_id,
                    command = format_args!("{:#04x}", command),
                    elapsed_ms,
                    "frame_handled"
                );
            }
            ProcessOutcome::UnknownCommand { .. } => {}
            ProcessOutcome::HandlerFailed { command, error } => {
                warn!(
                    target: "iotgw.integrator",
                    conn_id = conn.conn_id,
                    command = format_args!("{:#04x}", command),
                    error = %error,
                    "frame_handler_failed"
                );
            }
            ProcessOutcome::TimedOut { command } => {
                warn!(
                    target: "iotgw.integrator",
                    conn_id = conn.conn_id,
                    command = format_args!("{:#04x}", command),
                    "frame_handler_timed_out"
                );
            }
        }
        Ok(())
    }

    async fn on_data_sent(&self, conn: &ConnectionInfo, data: &[u8]) -> Result<(), BridgeError> {
        self.bridge.process_outgoing_data(conn, data).await?;
        Ok(())
    }

    async fn on_heartbeat_received(
        &self,
        conn: &ConnectionInfo,
        device_id: &str,
    ) -> Result<(), BridgeError> {
        let session = self.sessions.get_session(conn.conn_id).await?;
        if session.device_id.as_deref() != Some(device_id) {
            warn!(
                target: "iotgw.integrator",
                conn_id = conn.conn_id,
                device_id,
                bound = ?session.device_id,
                "heartbeat_device_mismatch"
            );
            return Err(SessionError::DeviceNotFound(device_id.to_string()).into());
        }
        self.sessions
            .update_session_activity(conn.conn_id, ActivityKind::Heartbeat)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_iccid_chunks() {
        assert_eq!(
            iccid_chunk(b"89860318123456789012"),
            Some("89860318123456789012")
        );
        assert!(iccid_chunk(b"8986031812345678901").is_none());
        assert!(iccid_chunk(b"DNY86031812345678901").is_none());
        assert!(iccid_chunk(b"8986031812345678901Z").is_none());
    }
}
