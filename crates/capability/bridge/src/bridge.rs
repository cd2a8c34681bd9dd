//! 协议桥
//!
//! 入站：校验大小 → 刷新会话活动 → 解码 → 校验帧 → 记录 ProtocolData(parsed)
//! → 查找处理器 → 超时约束下调用 → 统计 → 记录 ProtocolData 新版本（processed/error/timeout）。
//!
//! 出站：只记录 ProtocolData 并发出 sent 事件，不分发处理器。

use crate::decoder::{DecodedFrame, FrameDecoder};
use crate::error::BridgeError;
use crate::handler::ProtocolHandler;
use crate::stats::{BridgeCounters, BridgeStatistics, CommandStats, HandlerOutcome};
use domain::map::encode_hex;
use domain::{Direction, ProcessingStatus, ProtocolData};
use iotgw_databus::{DataBus, EventPublisher};
use iotgw_eventbus::{BusEvent, ProtocolEvent, ProtocolEventKind};
use iotgw_session::{ActivityKind, ConnectionInfo, SessionError, SessionManager};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// 单帧处理超时
    pub processing_timeout: Duration,
    /// 单帧最大字节数
    pub max_payload_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            processing_timeout: Duration::from_secs(5),
            max_payload_size: 4096,
        }
    }
}

impl BridgeConfig {
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.processing_timeout.is_zero() {
            self.processing_timeout = defaults.processing_timeout;
        }
        if self.max_payload_size == 0 {
            self.max_payload_size = defaults.max_payload_size;
        }
        self
    }
}

/// 入站帧的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed { command: u8, elapsed_ms: u64 },
    UnknownCommand { command: u8 },
    HandlerFailed { command: u8, error: String },
    TimedOut { command: u8 },
}

pub struct ProtocolBridge {
    config: BridgeConfig,
    data_bus: Arc<DataBus>,
    sessions: Arc<SessionManager>,
    publisher: Arc<EventPublisher>,
    decoder: Arc<dyn FrameDecoder>,
    handlers: RwLock<HashMap<u8, Arc<dyn ProtocolHandler>>>,
    counters: BridgeCounters,
}

impl ProtocolBridge {
    pub fn new(
        config: BridgeConfig,
        data_bus: Arc<DataBus>,
        sessions: Arc<SessionManager>,
        publisher: Arc<EventPublisher>,
        decoder: Arc<dyn FrameDecoder>,
    ) -> Self {
        Self {
            config: config.sanitized(),
            data_bus,
            sessions,
            publisher,
            decoder,
            handlers: RwLock::new(HashMap::new()),
            counters: BridgeCounters::default(),
        }
    }

    /// 注册处理器；同一命令码以最后一次注册为准，返回被替换的处理器。
    pub async fn register_protocol_handler(
        &self,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Option<Arc<dyn ProtocolHandler>> {
        let command = handler.command_id();
        let name = handler.handler_name().to_string();
        let previous = self.handlers.write().await.insert(command, handler);
        info!(
            target: "iotgw.bridge",
            command = format_args!("{:#04x}", command),
            handler = %name,
            replaced = previous.is_some(),
            "protocol_handler_registered"
        );
        previous
    }

    pub async fn unregister_protocol_handler(
        &self,
        command: u8,
    ) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.write().await.remove(&command)
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn process_incoming_data(
        &self,
        conn: &ConnectionInfo,
        data: &[u8],
    ) -> Result<ProcessOutcome, BridgeError> {
        if data.is_empty() {
            BridgeCounters::incr(&self.counters.frames_rejected);
            return Err(BridgeError::EmptyData);
        }
        if data.len() > self.config.max_payload_size {
            BridgeCounters::incr(&self.counters.frames_rejected);
            warn!(
                target: "iotgw.bridge",
                conn_id = conn.conn_id,
                size = data.len(),
                max = self.config.max_payload_size,
                "frame_too_large"
            );
            return Err(BridgeError::PayloadTooLarge {
                size: data.len(),
                max: self.config.max_payload_size,
            });
        }
        BridgeCounters::incr(&self.counters.frames_received);
        iotgw_telemetry::record_frame_received();
        self.touch(conn.conn_id, ActivityKind::Message).await;

        let frame = match self.decoder.decode(data).and_then(validate_frame) {
            Ok(frame) => frame,
            Err(err) => {
                BridgeCounters::incr(&self.counters.parse_errors);
                iotgw_telemetry::record_parse_error();
                self.touch(conn.conn_id, ActivityKind::Error).await;
                warn!(
                    target: "iotgw.bridge",
                    conn_id = conn.conn_id,
                    error = %err,
                    "frame_rejected"
                );
                return Err(err);
            }
        };

        let session = match self.sessions.get_session(conn.conn_id).await {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(
                    target: "iotgw.bridge",
                    conn_id = conn.conn_id,
                    device_id = %frame.device_id,
                    error = %err,
                    "session_missing_for_frame"
                );
                None
            }
        };

        let parsed = self.data_bus.publish_protocol_data(parsed_record(conn, &frame)).await?;

        let handler = self.handlers.read().await.get(&frame.command).cloned();
        let Some(handler) = handler else {
            return Ok(self.unknown_command(conn, &frame).await);
        };

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.config.processing_timeout,
            handler.handle_protocol_data(&frame, conn, session.as_ref()),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (outcome, status, error) = match result {
            Ok(Ok(())) => (
                HandlerOutcome::Success,
                ProcessingStatus::Processed,
                None,
            ),
            Ok(Err(err)) => {
                warn!(
                    target: "iotgw.bridge",
                    conn_id = conn.conn_id,
                    command = format_args!("{:#04x}", frame.command),
                    handler = handler.handler_name(),
                    error = %err,
                    "handler_failed"
                );
                (
                    HandlerOutcome::Error,
                    ProcessingStatus::Error,
                    Some(err.to_string()),
                )
            }
            Err(_) => {
                warn!(
                    target: "iotgw.bridge",
                    conn_id = conn.conn_id,
                    command = format_args!("{:#04x}", frame.command),
                    handler = handler.handler_name(),
                    timeout_ms = self.config.processing_timeout.as_millis() as u64,
                    "handler_timeout"
                );
                (
                    HandlerOutcome::Timeout,
                    ProcessingStatus::Timeout,
                    Some(format!(
                        "timed out after {} ms",
                        self.config.processing_timeout.as_millis()
                    )),
                )
            }
        };
        self.counters
            .record_command(frame.command, outcome, elapsed_ms);
        iotgw_telemetry::record_handler_result(outcome == HandlerOutcome::Success, elapsed_ms);

        let mut finished = parsed.with_status(status, error.clone());
        finished
            .parsed_fields
            .insert("elapsed_ms".to_string(), json!(elapsed_ms));
        self.data_bus.publish_protocol_data(finished).await?;

        debug!(
            target: "iotgw.bridge",
            conn_id = conn.conn_id,
            command = format_args!("{:#04x}", frame.command),
            status = status.as_str(),
            elapsed_ms,
            "frame_processed"
        );
        Ok(match outcome {
            HandlerOutcome::Success => ProcessOutcome::Processed {
                command: frame.command,
                elapsed_ms,
            },
            HandlerOutcome::Error => ProcessOutcome::HandlerFailed {
                command: frame.command,
                error: error.unwrap_or_default(),
            },
            HandlerOutcome::Timeout => ProcessOutcome::TimedOut {
                command: frame.command,
            },
        })
    }

    /// 记录出站帧；能解码时带上命令码与消息 ID。
    pub async fn process_outgoing_data(
        &self,
        conn: &ConnectionInfo,
        data: &[u8],
    ) -> Result<ProtocolData, BridgeError> {
        if data.is_empty() {
            return Err(BridgeError::EmptyData);
        }
        let mut record = ProtocolData::new(conn.conn_id, Direction::Outbound, data.to_vec());
        match self.decoder.decode(data) {
            Ok(frame) => {
                record.device_id = frame.device_id;
                record.command = frame.command;
                record.message_id = frame.message_id;
                record.payload = frame.payload;
            }
            Err(err) => {
                debug!(
                    target: "iotgw.bridge",
                    conn_id = conn.conn_id,
                    error = %err,
                    "outgoing_frame_opaque"
                );
                if let Ok(session) = self.sessions.get_session(conn.conn_id).await {
                    record.device_id = session.device_id.unwrap_or_default();
                }
            }
        }
        record.status = ProcessingStatus::Processed;
        let saved = self.data_bus.publish_protocol_data(record).await?;
        BridgeCounters::incr(&self.counters.frames_sent);
        iotgw_telemetry::record_frame_sent();
        Ok(saved)
    }

    pub fn command_stats(&self, command: u8) -> Option<CommandStats> {
        self.counters.command(command)
    }

    pub fn statistics(&self) -> BridgeStatistics {
        self.counters.snapshot()
    }

    async fn unknown_command(&self, conn: &ConnectionInfo, frame: &DecodedFrame) -> ProcessOutcome {
        BridgeCounters::incr(&self.counters.unknown_commands);
        iotgw_telemetry::record_unknown_command();
        warn!(
            target: "iotgw.bridge",
            conn_id = conn.conn_id,
            device_id = %frame.device_id,
            command = format_args!("{:#04x}", frame.command),
            "unknown_command"
        );
        let event = BusEvent::Protocol(ProtocolEvent {
            kind: ProtocolEventKind::UnknownCommand,
            conn_id: conn.conn_id,
            device_id: frame.device_id.clone(),
            command: frame.command,
            message_id: frame.message_id,
            record: None,
            error: None,
            timestamp_ms: domain::now_epoch_ms(),
        });
        if let Err(err) = self.publisher.publish(event).await {
            warn!(target: "iotgw.bridge", error = %err, "unknown_command_event_failed");
        }
        ProcessOutcome::UnknownCommand {
            command: frame.command,
        }
    }

    /// 刷新会话活动；会话不存在时容忍。
    async fn touch(&self, conn_id: u64, kind: ActivityKind) {
        match self.sessions.update_session_activity(conn_id, kind).await {
            Ok(()) | Err(SessionError::NotFound(_)) => {}
            Err(err) => {
                warn!(target: "iotgw.bridge", conn_id, error = %err, "session_activity_failed");
            }
        }
    }
}

fn validate_frame(frame: DecodedFrame) -> Result<DecodedFrame, BridgeError> {
    if frame.device_id.is_empty() {
        return Err(BridgeError::InvalidFrame("empty device id".to_string()));
    }
    if frame.payload.is_empty() {
        return Err(BridgeError::InvalidFrame("empty payload".to_string()));
    }
    Ok(frame)
}

fn parsed_record(conn: &ConnectionInfo, frame: &DecodedFrame) -> ProtocolData {
    let mut record = ProtocolData::new(conn.conn_id, Direction::Inbound, frame.raw.clone());
    record.device_id = frame.device_id.clone();
    record.command = frame.command;
    record.message_id = frame.message_id;
    record.payload = frame.payload.clone();
    record.status = ProcessingStatus::Parsed;
    record
        .parsed_fields
        .insert("physical_id".to_string(), json!(frame.physical_id));
    record.parsed_fields.insert(
        "raw_physical_id".to_string(),
        json!(encode_hex(&frame.raw_physical_id)),
    );
    record
        .parsed_fields
        .insert("payload_len".to_string(), json!(frame.payload.len()));
    record
        .parsed_fields
        .insert("remote_addr".to_string(), json!(conn.remote_addr));
    record
}
