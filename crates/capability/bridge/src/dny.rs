//! DNY 帧编解码
//!
//! 帧格式（多字节字段均为小端）：
//!
//! | 字段 | 长度 |
//! |------|------|
//! | 包头 `"DNY"` | 3 |
//! | 长度（其后全部字节数，含校验） | 2 |
//! | 物理 ID | 4 |
//! | 消息 ID | 2 |
//! | 命令 | 1 |
//! | 数据 | n |
//! | 校验（此前全部字节累加和） | 2 |

use crate::decoder::{DecodedFrame, FrameDecoder};
use crate::error::BridgeError;
use domain::validation::device_id_from_physical;

pub const HEADER: &[u8; 3] = b"DNY";
/// 空数据帧的长度
pub const MIN_FRAME_LEN: usize = 14;

#[derive(Debug, Clone, Copy, Default)]
pub struct DnyFrameDecoder;

impl DnyFrameDecoder {
    pub fn new() -> Self {
        Self
    }

    /// 组帧。
    pub fn encode(physical_id: u32, message_id: u16, command: u8, data: &[u8]) -> Vec<u8> {
        let body_len = 4 + 2 + 1 + data.len() + 2;
        let mut frame = Vec::with_capacity(5 + body_len);
        frame.extend_from_slice(HEADER);
        frame.extend_from_slice(&(body_len as u16).to_le_bytes());
        frame.extend_from_slice(&physical_id.to_le_bytes());
        frame.extend_from_slice(&message_id.to_le_bytes());
        frame.push(command);
        frame.extend_from_slice(data);
        let sum = checksum(&frame);
        frame.extend_from_slice(&sum.to_le_bytes());
        frame
    }
}

pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, byte| acc.wrapping_add(u16::from(*byte)))
}

impl FrameDecoder for DnyFrameDecoder {
    fn decode(&self, data: &[u8]) -> Result<DecodedFrame, BridgeError> {
        if data.len() < MIN_FRAME_LEN {
            return Err(BridgeError::Parse(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }
        if &data[..3] != HEADER {
            return Err(BridgeError::Parse("missing DNY header".to_string()));
        }
        let declared = u16::from_le_bytes([data[3], data[4]]) as usize;
        if declared != data.len() - 5 {
            return Err(BridgeError::Parse(format!(
                "length mismatch: declared {}, actual {}",
                declared,
                data.len() - 5
            )));
        }
        let body_end = data.len() - 2;
        let expected = u16::from_le_bytes([data[body_end], data[body_end + 1]]);
        let actual = checksum(&data[..body_end]);
        if expected != actual {
            return Err(BridgeError::Checksum { expected, actual });
        }
        let raw_physical_id = [data[5], data[6], data[7], data[8]];
        let physical_id = u32::from_le_bytes(raw_physical_id);
        Ok(DecodedFrame {
            device_id: device_id_from_physical(physical_id),
            physical_id,
            message_id: u16::from_le_bytes([data[9], data[10]]),
            command: data[11],
            payload: data[12..body_end].to_vec(),
            raw: data.to_vec(),
            raw_physical_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_frame_decodes() {
        let frame = DnyFrameDecoder::encode(0x04A2_28CD, 7, 0x21, &[0x01, 0x02]);
        assert_eq!(frame.len(), MIN_FRAME_LEN + 2);
        let decoded = DnyFrameDecoder.decode(&frame).expect("decode");
        assert_eq!(decoded.device_id, "04A228CD");
        assert_eq!(decoded.physical_id, 0x04A2_28CD);
        assert_eq!(decoded.message_id, 7);
        assert_eq!(decoded.command, 0x21);
        assert_eq!(decoded.payload, vec![0x01, 0x02]);
        assert_eq!(decoded.raw_physical_id, [0xCD, 0x28, 0xA2, 0x04]);
    }

    #[test]
    fn corrupted_frames_are_rejected() {
        let mut frame = DnyFrameDecoder::encode(0x04A2_28CD, 7, 0x21, &[0x01]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            DnyFrameDecoder.decode(&frame),
            Err(BridgeError::Checksum { .. })
        ));
        assert!(matches!(
            DnyFrameDecoder.decode(b"DNY"),
            Err(BridgeError::Parse(_))
        ));
        let mut frame = DnyFrameDecoder::encode(1, 1, 1, &[]);
        frame[0] = b'X';
        assert!(matches!(
            DnyFrameDecoder.decode(&frame),
            Err(BridgeError::Parse(_))
        ));
    }
}
