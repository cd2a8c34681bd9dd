//! 协议处理器契约

use crate::decoder::DecodedFrame;
use crate::error::HandlerError;
use iotgw_session::{ConnectionInfo, TcpSession};

/// 单个命令码的处理器
///
/// 在处理超时约束下调用；返回错误只记录统计与事件，不影响后续帧。
#[async_trait::async_trait]
pub trait ProtocolHandler: Send + Sync {
    async fn handle_protocol_data(
        &self,
        frame: &DecodedFrame,
        conn: &ConnectionInfo,
        session: Option<&TcpSession>,
    ) -> Result<(), HandlerError>;

    fn command_id(&self) -> u8;

    fn handler_name(&self) -> &str;
}
