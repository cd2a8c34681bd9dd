//! TCP 字节流分帧
//!
//! 一条连接上的字节流可能把多帧合并到一次读取，也可能把一帧拆到多次读取。
//! [`DnyStreamCodec`] 按 DNY 长度字段切出完整帧，另外识别设备上线时发送的
//! 20 字节 ICCID 块。无法识别的字节切到下一个可能的帧起点，作为原始块交给上层，
//! 由协议桥记为解析失败。

use crate::dny::{HEADER, MIN_FRAME_LEN};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::debug;

/// ICCID 上报：20 字节 ASCII 十六进制，以 "89" 开头
pub const ICCID_LEN: usize = 20;
const ICCID_PREFIX: &[u8; 2] = b"89";
/// 包头 + 长度字段
const PREFIX_LEN: usize = 5;

#[derive(Debug, Clone)]
pub struct DnyStreamCodec {
    max_frame_len: usize,
}

impl DnyStreamCodec {
    /// `max_frame_len` 为单帧总长上限（含包头）。
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.max(MIN_FRAME_LEN),
        }
    }

    fn decode_frame(&self, src: &mut BytesMut) -> Option<Bytes> {
        if src.len() < PREFIX_LEN {
            return None;
        }
        let declared = u16::from_le_bytes([src[3], src[4]]) as usize;
        let total = PREFIX_LEN + declared;
        if total < MIN_FRAME_LEN || total > self.max_frame_len {
            debug!(
                target: "iotgw.bridge",
                declared,
                limit = self.max_frame_len,
                "frame_length_rejected"
            );
            // 丢弃包头首字节，从后面重新同步
            return Some(self.split_garbage(src, 1));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return None;
        }
        Some(src.split_to(total).freeze())
    }

    /// 从 `from` 起找下一个可能的帧起点，把之前的字节作为原始块切出。
    fn split_garbage(&self, src: &mut BytesMut, from: usize) -> Bytes {
        let end = (from..src.len())
            .find(|&idx| is_candidate_start(&src[idx..]))
            .unwrap_or(src.len());
        src.split_to(end).freeze()
    }
}

impl Decoder for DnyStreamCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let head = &src[..src.len().min(HEADER.len())];
        if HEADER.starts_with(head) {
            if src.len() < HEADER.len() {
                return Ok(None);
            }
            return Ok(self.decode_frame(src));
        }
        if ICCID_PREFIX.starts_with(&src[..src.len().min(ICCID_PREFIX.len())]) {
            let seen = &src[..src.len().min(ICCID_LEN)];
            if seen.iter().all(u8::is_ascii_hexdigit) {
                if src.len() < ICCID_LEN {
                    return Ok(None);
                }
                return Ok(Some(src.split_to(ICCID_LEN).freeze()));
            }
        }
        Ok(Some(self.split_garbage(src, 1)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        match self.decode(src)? {
            Some(chunk) => Ok(Some(chunk)),
            // 连接关闭时残留的半帧原样交出，由上层记为解析失败
            None if !src.is_empty() => Ok(Some(src.split_to(src.len()).freeze())),
            None => Ok(None),
        }
    }
}

/// 剩余字节是否可能是一帧或 ICCID 块的开头（末尾的不完整前缀也算）。
fn is_candidate_start(rest: &[u8]) -> bool {
    let dny = &rest[..rest.len().min(HEADER.len())];
    let iccid = &rest[..rest.len().min(ICCID_PREFIX.len())];
    HEADER.starts_with(dny) || ICCID_PREFIX.starts_with(iccid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::FrameDecoder;
    use crate::dny::DnyFrameDecoder;

    const ICCID: &[u8] = b"89860318123456789012";

    fn codec() -> DnyStreamCodec {
        DnyStreamCodec::new(4096)
    }

    /// 追加一段到达的字节，取出当前能切出的全部块。
    fn feed(codec: &mut DnyStreamCodec, buffer: &mut BytesMut, chunk: &[u8]) -> Vec<Bytes> {
        buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buffer).expect("decode") {
            out.push(frame);
        }
        out
    }

    #[test]
    fn splits_frames_merged_into_one_read() {
        let first = DnyFrameDecoder::encode(0x04A2_28CD, 1, 0x20, &[0x03, 0x01]);
        let second = DnyFrameDecoder::encode(0x04A2_28CD, 2, 0x21, &[0x00]);
        let mut merged = first.clone();
        merged.extend_from_slice(&second);

        let mut buffer = BytesMut::new();
        let frames = feed(&mut codec(), &mut buffer, &merged);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &first[..]);
        assert_eq!(&frames[1][..], &second[..]);
        assert!(buffer.is_empty());
        let decoded = DnyFrameDecoder.decode(&frames[1]).expect("second frame");
        assert_eq!(decoded.message_id, 2);
    }

    #[test]
    fn waits_for_a_frame_split_across_reads() {
        let frame = DnyFrameDecoder::encode(0x04A2_28CD, 3, 0x21, &[0xDC, 0x08, 2, 1, 0]);
        let mut codec = codec();
        let mut buffer = BytesMut::new();
        assert!(feed(&mut codec, &mut buffer, &frame[..2]).is_empty());
        assert!(feed(&mut codec, &mut buffer, &frame[2..9]).is_empty());
        let frames = feed(&mut codec, &mut buffer, &frame[9..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame[..]);
    }

    #[test]
    fn iccid_block_is_cut_before_the_next_frame() {
        let frame = DnyFrameDecoder::encode(0x04A2_28CD, 1, 0x20, &[0x03, 0x01, 2, 1]);
        let mut codec = codec();
        let mut buffer = BytesMut::new();
        assert!(feed(&mut codec, &mut buffer, &ICCID[..12]).is_empty());
        let mut rest = ICCID[12..].to_vec();
        rest.extend_from_slice(&frame);
        let chunks = feed(&mut codec, &mut buffer, &rest);
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[0][..], ICCID);
        assert_eq!(&chunks[1][..], &frame[..]);
    }

    #[test]
    fn garbage_is_handed_over_and_stream_resynchronizes() {
        let frame = DnyFrameDecoder::encode(0x04A2_28CD, 4, 0x21, &[0x00]);
        let mut input = b"hello".to_vec();
        input.extend_from_slice(&frame);
        let mut buffer = BytesMut::new();
        let chunks = feed(&mut codec(), &mut buffer, &input);
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[0][..], b"hello");
        assert_eq!(&chunks[1][..], &frame[..]);
    }

    #[test]
    fn oversized_length_does_not_buffer_forever() {
        let mut codec = DnyStreamCodec::new(64);
        let mut bogus = b"DNY".to_vec();
        bogus.extend_from_slice(&4000u16.to_le_bytes());
        let frame = DnyFrameDecoder::encode(0x04A2_28CD, 5, 0x21, &[0x00]);
        bogus.extend_from_slice(&frame);
        let mut buffer = BytesMut::new();
        let chunks = feed(&mut codec, &mut buffer, &bogus);
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[0][..], &bogus[..5]);
        assert_eq!(&chunks[1][..], &frame[..]);
    }

    #[test]
    fn partial_frame_is_flushed_at_eof() {
        let frame = DnyFrameDecoder::encode(0x04A2_28CD, 6, 0x21, &[0x00]);
        let mut codec = codec();
        let mut buffer = BytesMut::from(&frame[..8]);
        assert!(codec.decode(&mut buffer).expect("decode").is_none());
        let rest = codec.decode_eof(&mut buffer).expect("eof").expect("chunk");
        assert_eq!(&rest[..], &frame[..8]);
        assert!(codec.decode_eof(&mut buffer).expect("eof").is_none());
    }
}
