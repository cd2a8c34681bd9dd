//! 追踪初始化与进程级计数器。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 网关指标快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub parse_errors: u64,
    pub handler_success: u64,
    pub handler_failure: u64,
    pub handler_latency_ms_total: u64,
    pub handler_latency_ms_count: u64,
    pub unknown_commands: u64,
    pub sessions_created: u64,
    pub sessions_removed: u64,
    pub sessions_expired: u64,
    pub events_published: u64,
    pub events_retried: u64,
    pub events_dropped: u64,
}

/// 网关指标。
pub struct TelemetryMetrics {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    parse_errors: AtomicU64,
    handler_success: AtomicU64,
    handler_failure: AtomicU64,
    handler_latency_ms_total: AtomicU64,
    handler_latency_ms_count: AtomicU64,
    unknown_commands: AtomicU64,
    sessions_created: AtomicU64,
    sessions_removed: AtomicU64,
    sessions_expired: AtomicU64,
    events_published: AtomicU64,
    events_retried: AtomicU64,
    events_dropped: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            handler_success: AtomicU64::new(0),
            handler_failure: AtomicU64::new(0),
            handler_latency_ms_total: AtomicU64::new(0),
            handler_latency_ms_count: AtomicU64::new(0),
            unknown_commands: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_removed: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            events_retried: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            handler_success: self.handler_success.load(Ordering::Relaxed),
            handler_failure: self.handler_failure.load(Ordering::Relaxed),
            handler_latency_ms_total: self.handler_latency_ms_total.load(Ordering::Relaxed),
            handler_latency_ms_count: self.handler_latency_ms_count.load(Ordering::Relaxed),
            unknown_commands: self.unknown_commands.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_removed: self.sessions_removed.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_retried: self.events_retried.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 记录入站帧次数。
pub fn record_frame_received() {
    metrics().frames_received.fetch_add(1, Ordering::Relaxed);
}

/// 记录出站帧次数。
pub fn record_frame_sent() {
    metrics().frames_sent.fetch_add(1, Ordering::Relaxed);
}

/// 记录解析/校验失败次数。
pub fn record_parse_error() {
    metrics().parse_errors.fetch_add(1, Ordering::Relaxed);
}

/// 记录处理器执行结果与耗时（毫秒）。
pub fn record_handler_result(success: bool, latency_ms: u64) {
    let metrics = metrics();
    if success {
        metrics.handler_success.fetch_add(1, Ordering::Relaxed);
    } else {
        metrics.handler_failure.fetch_add(1, Ordering::Relaxed);
    }
    metrics
        .handler_latency_ms_total
        .fetch_add(latency_ms, Ordering::Relaxed);
    metrics
        .handler_latency_ms_count
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录未知命令次数。
pub fn record_unknown_command() {
    metrics().unknown_commands.fetch_add(1, Ordering::Relaxed);
}

pub fn record_session_created() {
    metrics().sessions_created.fetch_add(1, Ordering::Relaxed);
}

pub fn record_session_removed() {
    metrics().sessions_removed.fetch_add(1, Ordering::Relaxed);
}

/// 记录超时清理的会话数。
pub fn record_sessions_expired(count: u64) {
    metrics()
        .sessions_expired
        .fetch_add(count, Ordering::Relaxed);
}

/// 记录事件投递成功次数。
pub fn record_event_published() {
    metrics().events_published.fetch_add(1, Ordering::Relaxed);
}

/// 记录事件重试次数。
pub fn record_event_retried() {
    metrics().events_retried.fetch_add(1, Ordering::Relaxed);
}

/// 记录事件丢弃次数（重试耗尽或队列满）。
pub fn record_event_dropped() {
    metrics().events_dropped.fetch_add(1, Ordering::Relaxed);
}
