//! 组件装配与生命周期
//!
//! 启动顺序：数据总线（含存储、一致性、事件总线）→ 事件发布适配器 → 会话管理；
//! 停止顺序相反。

use crate::handlers;
use crate::integrator::Integrator;
use crate::outbox::Outbox;
use iotgw_bridge::{BridgeConfig, DnyFrameDecoder, ProtocolBridge};
use iotgw_config::GatewayConfig;
use iotgw_databus::{DataBus, DataBusConfig, DataBusError, EventPublisher, PublisherConfig};
use iotgw_session::{SessionConfig, SessionManager};
use iotgw_storage::{InMemoryStorageManager, RedisStorageManager, StorageError, StorageManager};
use std::sync::Arc;
use tracing::info;

const REDIS_KEY_PREFIX: &str = "iotgw:";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("data bus error: {0}")]
    DataBus(#[from] DataBusError),
}

pub struct Gateway {
    pub data_bus: Arc<DataBus>,
    pub publisher: Arc<EventPublisher>,
    pub sessions: Arc<SessionManager>,
    pub bridge: Arc<ProtocolBridge>,
    pub integrator: Arc<Integrator>,
    pub outbox: Arc<Outbox>,
}

impl Gateway {
    pub async fn build(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let mut storage = InMemoryStorageManager::new().with_default_ttl(config.storage_ttl());
        if let Some(redis_url) = &config.redis_url {
            let redis = RedisStorageManager::connect_with_ttl(
                redis_url,
                REDIS_KEY_PREFIX,
                config.storage_ttl_seconds,
            )?;
            storage = storage.with_l2(Arc::new(redis));
            info!(target: "iotgw.server", "redis_l2_enabled");
        }
        let storage: Arc<dyn StorageManager> = Arc::new(storage);

        let data_bus = Arc::new(DataBus::new(
            storage,
            DataBusConfig {
                event_buffer_size: config.event_buffer_size,
                max_active_orders: config.max_active_orders,
                state_history_size: config.state_history_size,
            },
        ));
        let publisher = Arc::new(EventPublisher::new(
            data_bus.event_bus(),
            PublisherConfig {
                enable_queue: config.publisher_enable_queue,
                worker_count: config.publisher_workers,
                queue_size: config.publisher_queue_size,
                max_retries: config.publisher_max_retries,
                retry_delay: config.publisher_retry_delay(),
                batch_size: config.publisher_batch_size,
                batch_timeout: config.publisher_batch_timeout(),
            },
        ));
        let sessions = Arc::new(SessionManager::new(
            SessionConfig {
                session_timeout: config.session_timeout(),
                cleanup_interval: config.session_cleanup_interval(),
                max_sessions: config.max_sessions,
            },
            data_bus.clone(),
            publisher.clone(),
        ));
        let bridge = Arc::new(ProtocolBridge::new(
            BridgeConfig {
                processing_timeout: config.processing_timeout(),
                max_payload_size: config.max_payload_size,
            },
            data_bus.clone(),
            sessions.clone(),
            publisher.clone(),
            Arc::new(DnyFrameDecoder::new()),
        ));
        let outbox = Arc::new(Outbox::new());
        let integrator = Arc::new(Integrator::new(
            sessions.clone(),
            bridge.clone(),
            outbox.clone(),
        ));
        handlers::register_all(&integrator, &data_bus).await;

        Ok(Self {
            data_bus,
            publisher,
            sessions,
            bridge,
            integrator,
            outbox,
        })
    }

    pub async fn start(&self) -> Result<(), GatewayError> {
        self.data_bus.start().await?;
        self.publisher.start().await;
        self.sessions.start().await;
        info!(
            target: "iotgw.server",
            handlers = self.bridge.handler_count().await,
            "gateway_started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), GatewayError> {
        self.sessions.stop().await;
        self.publisher.stop().await;
        self.data_bus.stop().await?;
        info!(target: "iotgw.server", "gateway_stopped");
        Ok(())
    }
}
