//! 网关运行配置加载。
//!
//! 所有配置项都有默认值，只有格式错误才会失败；
//! 各组件自己的配置结构由二进制在启动时从这里组装。

use std::env;
use std::time::Duration;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 网关运行配置。
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    /// TCP 监听地址
    pub listen_addr: String,
    /// Redis 地址；为空时只使用内存存储
    pub redis_url: Option<String>,
    /// 存储条目 TTL；为空时不过期
    pub storage_ttl_seconds: Option<u64>,
    /// 事件总线通道容量
    pub event_buffer_size: usize,
    pub publisher_enable_queue: bool,
    pub publisher_queue_size: usize,
    pub publisher_workers: usize,
    pub publisher_max_retries: u32,
    pub publisher_retry_delay_ms: u64,
    pub publisher_batch_size: usize,
    pub publisher_batch_timeout_ms: u64,
    pub session_timeout_seconds: u64,
    pub session_cleanup_interval_seconds: u64,
    pub max_sessions: usize,
    pub max_active_orders: usize,
    pub state_history_size: usize,
    pub processing_timeout_ms: u64,
    pub max_payload_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7054".to_string(),
            redis_url: None,
            storage_ttl_seconds: None,
            event_buffer_size: 1000,
            publisher_enable_queue: true,
            publisher_queue_size: 1000,
            publisher_workers: 4,
            publisher_max_retries: 3,
            publisher_retry_delay_ms: 100,
            publisher_batch_size: 50,
            publisher_batch_timeout_ms: 100,
            session_timeout_seconds: 300,
            session_cleanup_interval_seconds: 60,
            max_sessions: 10_000,
            max_active_orders: 1000,
            state_history_size: 100,
            processing_timeout_ms: 5000,
            max_payload_size: 4096,
        }
    }
}

impl GatewayConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let listen_addr = env::var("IOTGW_LISTEN_ADDR").unwrap_or(defaults.listen_addr);
        let redis_url = read_optional("IOTGW_REDIS_URL");
        let storage_ttl_seconds =
            read_optional_u64("IOTGW_STORAGE_TTL_SECONDS")?.filter(|value| *value > 0);

        Ok(Self {
            listen_addr,
            redis_url,
            storage_ttl_seconds,
            event_buffer_size: read_usize_with_default(
                "IOTGW_EVENT_BUFFER_SIZE",
                defaults.event_buffer_size,
            )?,
            publisher_enable_queue: read_bool_with_default(
                "IOTGW_PUBLISHER_ENABLE_QUEUE",
                defaults.publisher_enable_queue,
            ),
            publisher_queue_size: read_usize_with_default(
                "IOTGW_PUBLISHER_QUEUE_SIZE",
                defaults.publisher_queue_size,
            )?,
            publisher_workers: read_usize_with_default(
                "IOTGW_PUBLISHER_WORKERS",
                defaults.publisher_workers,
            )?,
            publisher_max_retries: read_u32_with_default(
                "IOTGW_PUBLISHER_MAX_RETRIES",
                defaults.publisher_max_retries,
            )?,
            publisher_retry_delay_ms: read_u64_with_default(
                "IOTGW_PUBLISHER_RETRY_DELAY_MS",
                defaults.publisher_retry_delay_ms,
            )?,
            publisher_batch_size: read_usize_with_default(
                "IOTGW_PUBLISHER_BATCH_SIZE",
                defaults.publisher_batch_size,
            )?,
            publisher_batch_timeout_ms: read_u64_with_default(
                "IOTGW_PUBLISHER_BATCH_TIMEOUT_MS",
                defaults.publisher_batch_timeout_ms,
            )?,
            session_timeout_seconds: read_u64_with_default(
                "IOTGW_SESSION_TIMEOUT_SECONDS",
                defaults.session_timeout_seconds,
            )?,
            session_cleanup_interval_seconds: read_u64_with_default(
                "IOTGW_SESSION_CLEANUP_INTERVAL_SECONDS",
                defaults.session_cleanup_interval_seconds,
            )?,
            max_sessions: read_usize_with_default("IOTGW_MAX_SESSIONS", defaults.max_sessions)?,
            max_active_orders: read_usize_with_default(
                "IOTGW_MAX_ACTIVE_ORDERS",
                defaults.max_active_orders,
            )?,
            state_history_size: read_usize_with_default(
                "IOTGW_STATE_HISTORY_SIZE",
                defaults.state_history_size,
            )?,
            processing_timeout_ms: read_u64_with_default(
                "IOTGW_PROCESSING_TIMEOUT_MS",
                defaults.processing_timeout_ms,
            )?,
            max_payload_size: read_usize_with_default(
                "IOTGW_MAX_PAYLOAD_SIZE",
                defaults.max_payload_size,
            )?,
        })
    }

    pub fn storage_ttl(&self) -> Option<Duration> {
        self.storage_ttl_seconds.map(Duration::from_secs)
    }

    pub fn publisher_retry_delay(&self) -> Duration {
        Duration::from_millis(self.publisher_retry_delay_ms)
    }

    pub fn publisher_batch_timeout(&self) -> Duration {
        Duration::from_millis(self.publisher_batch_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_seconds)
    }

    pub fn session_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.session_cleanup_interval_seconds)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u32_with_default(key: &str, default: u32) -> Result<u32, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u32>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_usize_with_default(key: &str, default: usize) -> Result<usize, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<usize>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_optional_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key.to_string(), value)),
        Err(_) => Ok(None),
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
