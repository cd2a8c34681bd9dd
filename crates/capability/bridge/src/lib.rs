//! # 协议桥
//!
//! 传输层与数据总线之间的适配：
//! - 入站帧：解码、校验、记录 ProtocolData、按命令码分发处理器
//! - 出站帧：记录 ProtocolData 并发出 sent 事件
//! - 每个命令码的处理统计（次数、成功/失败、平均耗时）
//!
//! 帧格式由 [`FrameDecoder`] 抽象，默认实现为 [`DnyFrameDecoder`]；
//! 字节流按 [`DnyStreamCodec`] 切帧后再交给协议桥。

pub mod bridge;
pub mod codec;
pub mod decoder;
pub mod dny;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod stats;

pub use bridge::{BridgeConfig, ProcessOutcome, ProtocolBridge};
pub use codec::{DnyStreamCodec, ICCID_LEN};
pub use decoder::{DecodedFrame, FrameDecoder};
pub use dny::DnyFrameDecoder;
pub use error::{BridgeError, HandlerError};
pub use handler::ProtocolHandler;
pub use hooks::ConnectionHooks;
pub use stats::{BridgeStatistics, CommandStats};
