//! 设备状态管理器

use crate::error::DataBusError;
use crate::manager::DataManager;
use domain::keys::state_key;
use domain::{
    BusinessState, ConnectionState, DeviceState, Entity, HealthState, StateSnapshot,
    StateTransition,
};
use iotgw_storage::StorageManager;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// 一次状态更新请求
///
/// 未设置的维度保持不变；计数器标志独立于维度变化。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateUpdate {
    pub connection: Option<ConnectionState>,
    pub business: Option<BusinessState>,
    pub health: Option<HealthState>,
    pub heartbeat: bool,
    pub reconnect: bool,
    pub error: bool,
    pub reason: String,
}

impl StateUpdate {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Self::default()
        }
    }

    /// 心跳：只刷新计数与时间，不改变任何维度。
    pub fn heartbeat() -> Self {
        Self {
            heartbeat: true,
            reason: "heartbeat".to_string(),
            ..Self::default()
        }
    }

    pub fn connection(mut self, state: ConnectionState) -> Self {
        self.connection = Some(state);
        self
    }

    pub fn business(mut self, state: BusinessState) -> Self {
        self.business = Some(state);
        self
    }

    pub fn health(mut self, state: HealthState) -> Self {
        self.health = Some(state);
        self
    }

    pub fn with_reconnect(mut self) -> Self {
        self.reconnect = true;
        self
    }

    pub fn with_error(mut self) -> Self {
        self.error = true;
        self
    }
}

/// 状态更新结果
#[derive(Debug, Clone, PartialEq)]
pub struct StateChangeOutcome {
    pub previous: StateSnapshot,
    pub current: StateSnapshot,
    pub state: DeviceState,
    /// 三个维度中任一发生变化
    pub significant: bool,
}

pub struct DeviceStateManager {
    inner: DataManager<DeviceState>,
    /// 读-改-写串行化
    update_gate: Mutex<()>,
    history_size: usize,
}

impl DeviceStateManager {
    pub fn new(storage: Arc<dyn StorageManager>, history_size: usize) -> Self {
        Self {
            inner: DataManager::new(storage),
            update_gate: Mutex::new(()),
            history_size,
        }
    }

    pub fn start(&self) {
        self.inner.start();
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn manager(&self) -> &DataManager<DeviceState> {
        &self.inner
    }

    pub async fn get_state(&self, device_id: &str) -> Result<Option<DeviceState>, DataBusError> {
        self.inner.get(&state_key(device_id)).await
    }

    /// 应用一次更新；没有历史状态的设备从初始状态开始。
    pub async fn update_device_state(
        &self,
        device_id: &str,
        update: StateUpdate,
    ) -> Result<StateChangeOutcome, DataBusError> {
        let _gate = self.update_gate.lock().await;
        let now = domain::now_epoch_ms();
        let current = self
            .inner
            .get(&state_key(device_id))
            .await?
            .unwrap_or_else(|| DeviceState::new(device_id));
        let previous = current.snapshot();
        let next_snapshot = StateSnapshot {
            connection: update.connection.unwrap_or(previous.connection),
            business: update.business.unwrap_or(previous.business),
            health: update.health.unwrap_or(previous.health),
        };

        let mut next = current;
        next.apply_snapshot(next_snapshot);
        if update.heartbeat {
            next.heartbeat_count += 1;
            next.last_heartbeat_ms = Some(now);
        }
        if update.reconnect {
            next.reconnect_count += 1;
        }
        if update.error {
            next.error_count += 1;
        }
        let significant = previous != next_snapshot;
        if significant {
            self.record_transition(&mut next, previous, update.reason, now);
        }
        next.truncate_history(self.history_size);
        let (saved, _) = self.inner.set(next).await?;
        Ok(StateChangeOutcome {
            previous,
            current: next_snapshot,
            state: saved,
            significant,
        })
    }

    /// 整体替换状态；显著性与历史按替换前的状态计算。
    pub async fn replace_state(
        &self,
        mut state: DeviceState,
        reason: &str,
    ) -> Result<StateChangeOutcome, DataBusError> {
        let _gate = self.update_gate.lock().await;
        let existing = self.inner.get(&state.storage_key()).await?;
        let previous = existing
            .as_ref()
            .map(DeviceState::snapshot)
            .unwrap_or_default();
        let current = state.snapshot();
        let significant = previous != current;
        if significant {
            self.record_transition(
                &mut state,
                previous,
                reason.to_string(),
                domain::now_epoch_ms(),
            );
        }
        // 调用方提供的历史同样受上限约束
        state.truncate_history(self.history_size);
        let (saved, _) = self.inner.set(state).await?;
        Ok(StateChangeOutcome {
            previous,
            current,
            state: saved,
            significant,
        })
    }

    pub async fn delete_state(&self, device_id: &str) -> Result<Option<DeviceState>, DataBusError> {
        self.inner.delete(&state_key(device_id)).await
    }

    fn record_transition(
        &self,
        state: &mut DeviceState,
        from: StateSnapshot,
        reason: String,
        now: i64,
    ) {
        let to = state.snapshot();
        debug!(
            target: "iotgw.databus",
            device_id = %state.device_id,
            from = %from.connection,
            to = %to.connection,
            business = %to.business,
            health = %to.health,
            reason = %reason,
            "state_transition"
        );
        state.push_history(
            StateTransition {
                from,
                to,
                reason,
                at_ms: now,
            },
            self.history_size,
        );
        state.last_state_change_ms = now;
    }
}
