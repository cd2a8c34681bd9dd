//! 参考命令处理器：设备注册（0x20）与心跳（0x01、0x21）。
//!
//! 注册负载：固件版本 u16 LE | 端口数 u8 | 设备类型 u8
//!
//! 0x21 心跳负载：电压 u16 LE（0.1V）| 端口数 u8 | 各端口状态 u8 ...
//! 0x01 为旧版心跳，负载内容不解析。

use crate::integrator::Integrator;
use domain::PortData;
use iotgw_bridge::{ConnectionHooks, DecodedFrame, DnyFrameDecoder, HandlerError, ProtocolHandler};
use iotgw_databus::DataBus;
use iotgw_session::{ConnectionInfo, TcpSession};
use std::sync::{Arc, Weak};
use tracing::debug;

pub const CMD_REGISTER: u8 = 0x20;
pub const CMD_HEARTBEAT_LEGACY: u8 = 0x01;
pub const CMD_HEARTBEAT: u8 = 0x21;

/// 注册应答：成功
pub const ACK_OK: u8 = 0x00;

/// 端口状态：充电中
const PORT_CHARGING: u8 = 0x01;
/// 端口状态：故障/禁用
const PORT_FAULT: u8 = 0x03;

fn integrator(weak: &Weak<Integrator>) -> Result<Arc<Integrator>, HandlerError> {
    weak.upgrade()
        .ok_or_else(|| HandlerError::Failed("gateway is shutting down".to_string()))
}

fn hooks_error(err: iotgw_bridge::BridgeError) -> HandlerError {
    HandlerError::Failed(err.to_string())
}

pub struct RegisterHandler {
    integrator: Weak<Integrator>,
    data_bus: Arc<DataBus>,
}

impl RegisterHandler {
    pub fn new(integrator: Weak<Integrator>, data_bus: Arc<DataBus>) -> Self {
        Self {
            integrator,
            data_bus,
        }
    }
}

#[async_trait::async_trait]
impl ProtocolHandler for RegisterHandler {
    async fn handle_protocol_data(
        &self,
        frame: &DecodedFrame,
        conn: &ConnectionInfo,
        session: Option<&TcpSession>,
    ) -> Result<(), HandlerError> {
        if frame.payload.len() < 4 {
            return Err(HandlerError::Failed(format!(
                "register payload too short: {} bytes",
                frame.payload.len()
            )));
        }
        let iccid = session
            .and_then(|session| session.iccid.clone())
            .ok_or_else(|| HandlerError::Failed("iccid not reported before register".to_string()))?;
        let firmware = u16::from_le_bytes([frame.payload[0], frame.payload[1]]);
        let port_count = u32::from(frame.payload[2]);
        let device_type = u16::from(frame.payload[3]);

        let integrator = integrator(&self.integrator)?;
        integrator
            .on_device_registered(
                conn,
                &frame.device_id,
                &format!("{:08X}", frame.physical_id),
                &iccid,
                device_type,
            )
            .await
            .map_err(hooks_error)?;

        let mut device = self.data_bus.get_device_data(&frame.device_id).await?;
        device.firmware_version = format!("{}.{}", firmware >> 8, firmware & 0xFF);
        device.port_count = port_count;
        self.data_bus.publish_device_data(device).await?;

        let ack = DnyFrameDecoder::encode(
            frame.physical_id,
            frame.message_id,
            CMD_REGISTER,
            &[ACK_OK],
        );
        if !integrator.reply(conn.conn_id, ack) {
            debug!(target: "iotgw.handlers", conn_id = conn.conn_id, "register_ack_dropped");
        }
        Ok(())
    }

    fn command_id(&self) -> u8 {
        CMD_REGISTER
    }

    fn handler_name(&self) -> &str {
        "register"
    }
}

pub struct HeartbeatHandler {
    command: u8,
    integrator: Weak<Integrator>,
    data_bus: Arc<DataBus>,
}

impl HeartbeatHandler {
    pub fn new(command: u8, integrator: Weak<Integrator>, data_bus: Arc<DataBus>) -> Self {
        Self {
            command,
            integrator,
            data_bus,
        }
    }

    async fn update_ports(&self, device_id: &str, payload: &[u8]) -> Result<(), HandlerError> {
        if payload.len() < 3 {
            return Err(HandlerError::Failed(format!(
                "heartbeat payload too short: {} bytes",
                payload.len()
            )));
        }
        let voltage_v = f64::from(u16::from_le_bytes([payload[0], payload[1]])) / 10.0;
        let count = payload[2] as usize;
        let statuses = payload.get(3..3 + count).ok_or_else(|| {
            HandlerError::Failed(format!("heartbeat declares {} ports, payload too short", count))
        })?;
        for (index, status) in statuses.iter().enumerate() {
            let mut port = match self.data_bus.get_port_data(device_id, index as u32 + 1).await {
                Ok(port) => port,
                Err(err) if err.is_not_found() => {
                    PortData::from_protocol_port(device_id, index as u8)
                }
                Err(err) => return Err(err.into()),
            };
            port.voltage_v = voltage_v;
            port.is_charging = *status == PORT_CHARGING;
            port.is_enabled = *status != PORT_FAULT;
            self.data_bus.publish_port_data(port).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProtocolHandler for HeartbeatHandler {
    async fn handle_protocol_data(
        &self,
        frame: &DecodedFrame,
        conn: &ConnectionInfo,
        session: Option<&TcpSession>,
    ) -> Result<(), HandlerError> {
        if !session.is_some_and(TcpSession::is_registered) {
            return Err(HandlerError::Failed(format!(
                "heartbeat from unregistered device {}",
                frame.device_id
            )));
        }
        integrator(&self.integrator)?
            .on_heartbeat_received(conn, &frame.device_id)
            .await
            .map_err(hooks_error)?;
        if self.command == CMD_HEARTBEAT {
            self.update_ports(&frame.device_id, &frame.payload).await?;
        }
        Ok(())
    }

    fn command_id(&self) -> u8 {
        self.command
    }

    fn handler_name(&self) -> &str {
        "heartbeat"
    }
}

/// 注册全部参考处理器。
pub async fn register_all(integrator: &Arc<Integrator>, data_bus: &Arc<DataBus>) {
    let bridge = integrator.bridge();
    bridge
        .register_protocol_handler(Arc::new(RegisterHandler::new(
            Arc::downgrade(integrator),
            data_bus.clone(),
        )))
        .await;
    for command in [CMD_HEARTBEAT_LEGACY, CMD_HEARTBEAT] {
        bridge
            .register_protocol_handler(Arc::new(HeartbeatHandler::new(
                command,
                Arc::downgrade(integrator),
                data_bus.clone(),
            )))
            .await;
    }
}
