//! TCP 会话管理器
//!
//! 锁顺序：先管理器级映射锁，后单会话锁；持有单会话锁时不再获取映射锁。
//! 与数据总线、事件发布的交互都在释放锁之后进行。

use crate::error::SessionError;
use crate::session::{ActivityKind, ConnectionInfo, SessionState, TcpSession};
use domain::validation::{
    canonical_device_id, physical_id_from_device_id, validate_device_id, validate_iccid,
};
use domain::{BusinessState, ConnectionState, DeviceData, ValidationError};
use iotgw_databus::{DataBus, EventPublisher, StateUpdate};
use iotgw_eventbus::{BusEvent, SessionEvent, SessionEventKind};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// 空闲超时
    pub session_timeout: Duration,
    /// 清理周期
    pub cleanup_interval: Duration,
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            max_sessions: 10_000,
        }
    }
}

impl SessionConfig {
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.session_timeout.is_zero() {
            self.session_timeout = defaults.session_timeout;
        }
        if self.cleanup_interval.is_zero() {
            self.cleanup_interval = defaults.cleanup_interval;
        }
        self.max_sessions = self.max_sessions.max(1);
        self
    }
}

#[derive(Default)]
struct SessionMaps {
    by_conn: HashMap<u64, Arc<Mutex<TcpSession>>>,
    by_device: HashMap<String, u64>,
}

struct Reaper {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// 移除原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Closed,
    Expired,
}

pub struct SessionManager {
    config: SessionConfig,
    data_bus: Arc<DataBus>,
    publisher: Arc<EventPublisher>,
    maps: RwLock<SessionMaps>,
    reaper: Mutex<Option<Reaper>>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        data_bus: Arc<DataBus>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            config: config.sanitized(),
            data_bus,
            publisher,
            maps: RwLock::new(SessionMaps::default()),
            reaper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// 启动后台清理任务；重复调用无副作用。
    pub async fn start(self: &Arc<Self>) {
        let mut reaper = self.reaper.lock().await;
        if reaper.is_some() {
            return;
        }
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(reaper_loop(
            Arc::downgrade(self),
            self.config.cleanup_interval,
            shutdown.clone(),
        ));
        *reaper = Some(Reaper { shutdown, handle });
        info!(
            target: "iotgw.session",
            timeout_secs = self.config.session_timeout.as_secs(),
            interval_secs = self.config.cleanup_interval.as_secs(),
            max_sessions = self.config.max_sessions,
            "session_manager_started"
        );
    }

    /// 停止清理任务并等待其退出；重复调用无副作用。
    pub async fn stop(&self) {
        let Some(reaper) = self.reaper.lock().await.take() else {
            return;
        };
        reaper.shutdown.cancel();
        if let Err(err) = reaper.handle.await {
            error!(target: "iotgw.session", error = %err, "session_reaper_join_failed");
        }
        info!(target: "iotgw.session", "session_manager_stopped");
    }

    pub async fn create_session(&self, info: ConnectionInfo) -> Result<TcpSession, SessionError> {
        let session = {
            let mut maps = self.maps.write().await;
            if maps.by_conn.contains_key(&info.conn_id) {
                return Err(SessionError::AlreadyExists(info.conn_id));
            }
            if maps.by_conn.len() >= self.config.max_sessions {
                warn!(
                    target: "iotgw.session",
                    conn_id = info.conn_id,
                    limit = self.config.max_sessions,
                    "session_limit_reached"
                );
                return Err(SessionError::Capacity(self.config.max_sessions));
            }
            let session = TcpSession::new(&info, domain::now_epoch_ms());
            maps.by_conn
                .insert(info.conn_id, Arc::new(Mutex::new(session.clone())));
            session
        };
        iotgw_telemetry::record_session_created();
        info!(
            target: "iotgw.session",
            conn_id = session.conn_id,
            remote_addr = %session.remote_addr,
            "session_created"
        );
        self.emit(SessionEventKind::Created, &session).await;
        Ok(session)
    }

    /// 绑定设备：awaiting_iccid → registered。
    ///
    /// `physical_id` 为空时由设备 ID 换算。设备已绑定在其他连接上时，旧会话被关闭并解绑。
    pub async fn register_device(
        &self,
        conn_id: u64,
        device_id: &str,
        physical_id: &str,
        iccid: &str,
        device_type: u16,
    ) -> Result<TcpSession, SessionError> {
        let device_id = canonical_device_id(device_id);
        validate_device_id(&device_id)?;
        validate_iccid(iccid)?;
        if device_type == 0 {
            return Err(ValidationError::NotPositive {
                field: "device_type",
            }
            .into());
        }
        let physical_id = parse_physical_id(physical_id, &device_id)?;
        let now = domain::now_epoch_ms();

        let (session, superseded) = {
            let mut maps = self.maps.write().await;
            let handle = maps
                .by_conn
                .get(&conn_id)
                .cloned()
                .ok_or(SessionError::NotFound(conn_id))?;
            let mut session = handle.lock().await;
            if !session.is_active() {
                return Err(SessionError::InvalidState(format!(
                    "conn {} is closed",
                    conn_id
                )));
            }

            let mut superseded = None;
            if let Some(previous_conn) = maps.by_device.get(&device_id).copied() {
                if previous_conn != conn_id {
                    if let Some(previous) = maps.by_conn.get(&previous_conn) {
                        let mut previous = previous.lock().await;
                        previous.close();
                        previous.device_id = None;
                    }
                    superseded = Some(previous_conn);
                }
            }
            if let Some(old_device) = session.device_id.clone() {
                if old_device != device_id {
                    maps.by_device.remove(&old_device);
                }
            }
            maps.by_device.insert(device_id.clone(), conn_id);

            session.device_id = Some(device_id.clone());
            session.physical_id = Some(physical_id);
            session.iccid = Some(iccid.to_string());
            session.device_type = Some(device_type);
            session.state = SessionState::Registered;
            session.registered_at_ms = Some(now);
            session.last_activity_ms = now;
            (session.clone(), superseded)
        };
        if let Some(previous_conn) = superseded {
            warn!(
                target: "iotgw.session",
                device_id = %device_id,
                previous_conn,
                conn_id,
                "device_rebound_to_new_connection"
            );
        }
        info!(
            target: "iotgw.session",
            conn_id,
            device_id = %device_id,
            physical_id,
            device_type,
            "device_registered"
        );

        let reconnect = self.publish_device(&session, physical_id, device_type).await?;
        let mut update = StateUpdate::new("device_registered")
            .connection(ConnectionState::Connected)
            .business(BusinessState::Online);
        if reconnect {
            update = update.with_reconnect();
        }
        self.data_bus.publish_state_change(&device_id, update).await?;
        self.emit(SessionEventKind::Registered, &session).await;
        Ok(session)
    }

    /// 记录连接上的一次活动；心跳同时刷新设备状态中的心跳计数。
    pub async fn update_session_activity(
        &self,
        conn_id: u64,
        kind: ActivityKind,
    ) -> Result<(), SessionError> {
        let handle = self.handle(conn_id).await?;
        let device_id = {
            let mut session = handle.lock().await;
            session.record(kind, domain::now_epoch_ms());
            session.device_id.clone()
        };
        let Some(device_id) = device_id else {
            return Ok(());
        };
        match kind {
            ActivityKind::Heartbeat => {
                self.data_bus
                    .publish_state_change(&device_id, StateUpdate::heartbeat())
                    .await?;
            }
            ActivityKind::Error => {
                self.data_bus
                    .publish_state_change(
                        &device_id,
                        StateUpdate::new("session_error").with_error(),
                    )
                    .await?;
            }
            ActivityKind::Message => {}
        }
        Ok(())
    }

    /// 记录连接上报的 ICCID（注册之前到达）。
    pub async fn set_session_iccid(&self, conn_id: u64, iccid: &str) -> Result<(), SessionError> {
        validate_iccid(iccid)?;
        let handle = self.handle(conn_id).await?;
        let mut session = handle.lock().await;
        session.iccid = Some(iccid.to_string());
        debug!(target: "iotgw.session", conn_id, iccid, "session_iccid_recorded");
        Ok(())
    }

    pub async fn set_session_property(
        &self,
        conn_id: u64,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), SessionError> {
        let handle = self.handle(conn_id).await?;
        handle.lock().await.properties.insert(key.into(), value);
        Ok(())
    }

    /// 移除会话：解除映射，标记关闭，设备置为断开/离线。
    pub async fn remove_session(&self, conn_id: u64) -> Result<TcpSession, SessionError> {
        self.remove(conn_id, Removal::Closed).await
    }

    pub async fn get_session(&self, conn_id: u64) -> Result<TcpSession, SessionError> {
        let handle = self.handle(conn_id).await?;
        let session = handle.lock().await.clone();
        Ok(session)
    }

    pub async fn get_session_by_device(&self, device_id: &str) -> Result<TcpSession, SessionError> {
        let device_id = canonical_device_id(device_id);
        let handle = {
            let maps = self.maps.read().await;
            maps.by_device
                .get(&device_id)
                .and_then(|conn_id| maps.by_conn.get(conn_id))
                .cloned()
                .ok_or_else(|| SessionError::DeviceNotFound(device_id.clone()))?
        };
        let session = handle.lock().await.clone();
        Ok(session)
    }

    /// 全部会话副本，按连接 ID 升序。
    pub async fn list_sessions(&self) -> Vec<TcpSession> {
        let handles: Vec<_> = self.maps.read().await.by_conn.values().cloned().collect();
        let mut sessions = Vec::with_capacity(handles.len());
        for handle in handles {
            sessions.push(handle.lock().await.clone());
        }
        sessions.sort_by_key(|session| session.conn_id);
        sessions
    }

    pub async fn session_count(&self) -> usize {
        self.maps.read().await.by_conn.len()
    }

    /// 移除已关闭或空闲超时的会话，返回移除数量。单个失败只记录日志。
    pub async fn cleanup_expired_sessions(&self) -> usize {
        let now = domain::now_epoch_ms();
        let timeout_ms = self.config.session_timeout.as_millis() as i64;
        let handles: Vec<_> = self
            .maps
            .read()
            .await
            .by_conn
            .iter()
            .map(|(conn_id, handle)| (*conn_id, handle.clone()))
            .collect();
        let mut expired = Vec::new();
        for (conn_id, handle) in handles {
            let session = handle.lock().await;
            if !session.is_active() || session.idle_ms(now) > timeout_ms {
                expired.push(conn_id);
            }
        }

        let mut removed = 0;
        for conn_id in expired {
            match self.remove(conn_id, Removal::Expired).await {
                Ok(_) => removed += 1,
                Err(SessionError::NotFound(_)) => {}
                Err(err) => {
                    // 映射已解除，只有数据总线通知失败
                    removed += 1;
                    warn!(target: "iotgw.session", conn_id, error = %err, "session_cleanup_failed");
                }
            }
        }
        if removed > 0 {
            iotgw_telemetry::record_sessions_expired(removed as u64);
            info!(target: "iotgw.session", removed, "expired_sessions_removed");
        }
        removed
    }

    async fn remove(&self, conn_id: u64, reason: Removal) -> Result<TcpSession, SessionError> {
        let (session, owns_device) = {
            let mut maps = self.maps.write().await;
            let handle = maps
                .by_conn
                .remove(&conn_id)
                .ok_or(SessionError::NotFound(conn_id))?;
            let mut session = handle.lock().await;
            session.close();
            let mut owns_device = false;
            if let Some(device_id) = &session.device_id {
                if maps.by_device.get(device_id) == Some(&conn_id) {
                    maps.by_device.remove(device_id);
                    owns_device = true;
                }
            }
            (session.clone(), owns_device)
        };
        iotgw_telemetry::record_session_removed();
        info!(
            target: "iotgw.session",
            conn_id,
            device_id = ?session.device_id,
            expired = reason == Removal::Expired,
            "session_removed"
        );
        let kind = match reason {
            Removal::Closed => SessionEventKind::Removed,
            Removal::Expired => SessionEventKind::Expired,
        };
        self.emit(kind, &session).await;

        if let (true, Some(device_id)) = (owns_device, session.device_id.as_deref()) {
            let (connection, why) = match reason {
                Removal::Closed => (ConnectionState::Disconnected, "connection_closed"),
                Removal::Expired => (ConnectionState::Timeout, "session_expired"),
            };
            self.data_bus
                .publish_state_change(
                    device_id,
                    StateUpdate::new(why)
                        .connection(connection)
                        .business(BusinessState::Offline),
                )
                .await?;
        }
        Ok(session)
    }

    async fn handle(&self, conn_id: u64) -> Result<Arc<Mutex<TcpSession>>, SessionError> {
        self.maps
            .read()
            .await
            .by_conn
            .get(&conn_id)
            .cloned()
            .ok_or(SessionError::NotFound(conn_id))
    }

    /// 写入设备数据，返回设备此前是否已登记过。
    async fn publish_device(
        &self,
        session: &TcpSession,
        physical_id: u32,
        device_type: u16,
    ) -> Result<bool, SessionError> {
        let device_id = session.device_id.clone().unwrap_or_default();
        let iccid = session.iccid.clone().unwrap_or_default();
        let (device, existed) = match self.data_bus.get_device_data(&device_id).await {
            Ok(mut device) => {
                device.physical_id = physical_id;
                device.iccid = iccid;
                device.conn_id = session.conn_id;
                device.device_type = device_type;
                device.remote_addr = session.remote_addr.clone();
                device.last_seen_ms = domain::now_epoch_ms();
                (device, true)
            }
            Err(err) if err.is_not_found() => (
                DeviceData::new(&device_id, physical_id, iccid, session.conn_id, device_type)
                    .with_remote_addr(session.remote_addr.clone()),
                false,
            ),
            Err(err) => return Err(err.into()),
        };
        self.data_bus.publish_device_data(device).await?;
        Ok(existed)
    }

    async fn emit(&self, kind: SessionEventKind, session: &TcpSession) {
        let event = BusEvent::Session(SessionEvent {
            kind,
            conn_id: session.conn_id,
            device_id: session.device_id.clone(),
            remote_addr: session.remote_addr.clone(),
            timestamp_ms: domain::now_epoch_ms(),
        });
        if let Err(err) = self.publisher.publish(event).await {
            warn!(
                target: "iotgw.session",
                conn_id = session.conn_id,
                error = %err,
                "session_event_publish_failed"
            );
        }
    }
}

/// 空字符串时由设备 ID 换算；否则按十六进制解析（可带 0x 前缀）。
fn parse_physical_id(physical_id: &str, device_id: &str) -> Result<u32, ValidationError> {
    let text = physical_id.trim();
    if text.is_empty() {
        return physical_id_from_device_id(device_id);
    }
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    match u32::from_str_radix(digits, 16) {
        Ok(0) => Err(ValidationError::NotPositive {
            field: "physical_id",
        }),
        Ok(value) => Ok(value),
        Err(_) => Err(ValidationError::InvalidFormat {
            field: "physical_id",
            value: text.to_string(),
        }),
    }
}

async fn reaper_loop(
    manager: std::sync::Weak<SessionManager>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // 第一次 tick 立即返回
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.cleanup_expired_sessions().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_id_defaults_to_device_id() {
        assert_eq!(parse_physical_id("", "04A228CD"), Ok(0x04A2_28CD));
        assert_eq!(parse_physical_id("0x04A228CD", "04A228CD"), Ok(0x04A2_28CD));
        assert!(parse_physical_id("zz", "04A228CD").is_err());
        assert!(parse_physical_id("0", "04A228CD").is_err());
    }

    #[test]
    fn zero_durations_fall_back_to_defaults() {
        let config = SessionConfig {
            session_timeout: Duration::ZERO,
            cleanup_interval: Duration::ZERO,
            max_sessions: 0,
        }
        .sanitized();
        assert_eq!(config.session_timeout, Duration::from_secs(300));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.max_sessions, 1);
    }
}
