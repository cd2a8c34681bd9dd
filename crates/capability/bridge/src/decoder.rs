//! 帧解码边界

use crate::error::BridgeError;

/// 解码后的协议帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// 设备 ID（物理 ID 的 8 位十六进制）
    pub device_id: String,
    pub physical_id: u32,
    pub command: u8,
    pub message_id: u16,
    pub payload: Vec<u8>,
    /// 整帧原始字节
    pub raw: Vec<u8>,
    /// 帧中物理 ID 的原始字节
    pub raw_physical_id: [u8; 4],
}

/// 字节 → 帧
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<DecodedFrame, BridgeError>;
}
