//! 协议桥统计

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// 单个命令码的处理统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CommandStats {
    pub count: u64,
    pub success: u64,
    pub error: u64,
    pub timeout: u64,
    /// 平均处理耗时（毫秒，滑动均值）
    pub avg_ms: f64,
    pub last_ms: u64,
}

impl CommandStats {
    fn record(&mut self, outcome: HandlerOutcome, elapsed_ms: u64) {
        self.count += 1;
        match outcome {
            HandlerOutcome::Success => self.success += 1,
            HandlerOutcome::Error => self.error += 1,
            HandlerOutcome::Timeout => {
                self.error += 1;
                self.timeout += 1;
            }
        }
        self.avg_ms += (elapsed_ms as f64 - self.avg_ms) / self.count as f64;
        self.last_ms = elapsed_ms;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerOutcome {
    Success,
    Error,
    Timeout,
}

/// 协议桥统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BridgeStatistics {
    pub frames_received: u64,
    pub frames_rejected: u64,
    pub parse_errors: u64,
    pub unknown_commands: u64,
    pub frames_sent: u64,
    pub commands: BTreeMap<u8, CommandStats>,
}

#[derive(Default)]
pub(crate) struct BridgeCounters {
    pub frames_received: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub parse_errors: AtomicU64,
    pub unknown_commands: AtomicU64,
    pub frames_sent: AtomicU64,
    commands: Mutex<BTreeMap<u8, CommandStats>>,
}

impl BridgeCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command(&self, command: u8, outcome: HandlerOutcome, elapsed_ms: u64) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.entry(command).or_default().record(outcome, elapsed_ms);
        }
    }

    pub fn command(&self, command: u8) -> Option<CommandStats> {
        self.commands
            .lock()
            .ok()
            .and_then(|commands| commands.get(&command).copied())
    }

    pub fn snapshot(&self) -> BridgeStatistics {
        BridgeStatistics {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            unknown_commands: self.unknown_commands.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            commands: self
                .commands
                .lock()
                .map(|commands| commands.clone())
                .unwrap_or_default(),
        }
    }
}
