//! 一致性检查
//!
//! 比较管理器缓存中的实体与存储中的副本，发现不一致时记录日志并计数。
//! 修复通过 [`RepairPolicy`] 扩展，默认策略不做任何事。

use crate::error::StorageError;
use crate::traits::{StorageManager, load_entity};
use domain::{Entity, EntityKind, ValidationError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const RECENT_CAPACITY: usize = 100;

/// 不一致类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InconsistencyKind {
    /// 缓存中有，存储中没有
    MissingInStorage,
    /// 版本号不同
    VersionMismatch { cached: u64, stored: u64 },
    /// 版本相同但内容不同
    ContentMismatch,
}

/// 一条不一致记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inconsistency {
    pub key: String,
    pub entity_kind: EntityKind,
    pub kind: InconsistencyKind,
    pub detected_at_ms: i64,
}

/// 修复策略
#[async_trait::async_trait]
pub trait RepairPolicy: Send + Sync {
    /// 返回是否已修复
    async fn repair(
        &self,
        storage: &dyn StorageManager,
        inconsistency: &Inconsistency,
    ) -> Result<bool, StorageError>;
}

/// 默认策略：不修复
pub struct NoopRepairPolicy;

#[async_trait::async_trait]
impl RepairPolicy for NoopRepairPolicy {
    async fn repair(
        &self,
        _storage: &dyn StorageManager,
        _inconsistency: &Inconsistency,
    ) -> Result<bool, StorageError> {
        Ok(false)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsistencyStats {
    pub checks: u64,
    pub validation_failures: u64,
    pub inconsistencies: u64,
    pub repairs: u64,
}

pub struct ConsistencyManager {
    storage: Arc<dyn StorageManager>,
    policy: Arc<dyn RepairPolicy>,
    running: AtomicBool,
    recent: Mutex<VecDeque<Inconsistency>>,
    checks: AtomicU64,
    validation_failures: AtomicU64,
    inconsistencies: AtomicU64,
    repairs: AtomicU64,
}

impl ConsistencyManager {
    pub fn new(storage: Arc<dyn StorageManager>) -> Self {
        Self {
            storage,
            policy: Arc::new(NoopRepairPolicy),
            running: AtomicBool::new(false),
            recent: Mutex::new(VecDeque::new()),
            checks: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            inconsistencies: AtomicU64::new(0),
            repairs: AtomicU64::new(0),
        }
    }

    pub fn with_repair_policy(mut self, policy: Arc<dyn RepairPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!(target: "iotgw.consistency", "consistency_started");
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(target: "iotgw.consistency", "consistency_stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 校验入站实体。
    pub fn validate<E: Entity>(&self, entity: &E) -> Result<(), ValidationError> {
        let kind = E::KIND;
        entity.validate().inspect_err(|err| {
            self.validation_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "iotgw.consistency",
                kind = %kind,
                key = %entity.storage_key(),
                error = %err,
                "entity_validation_failed"
            );
        })
    }

    /// 比较缓存副本与存储副本；一致时返回 None。
    pub async fn check<E: Entity + PartialEq>(
        &self,
        cached: &E,
    ) -> Result<Option<Inconsistency>, StorageError> {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let key = cached.storage_key();
        let stored: Option<E> = load_entity(self.storage.as_ref(), &key).await?;
        let kind = match stored {
            None => InconsistencyKind::MissingInStorage,
            Some(stored) if stored.version() != cached.version() => {
                InconsistencyKind::VersionMismatch {
                    cached: cached.version(),
                    stored: stored.version(),
                }
            }
            Some(stored) if &stored != cached => InconsistencyKind::ContentMismatch,
            Some(_) => return Ok(None),
        };
        let inconsistency = Inconsistency {
            key,
            entity_kind: E::KIND,
            kind,
            detected_at_ms: domain::now_epoch_ms(),
        };
        self.report(inconsistency.clone());
        Ok(Some(inconsistency))
    }

    /// 记录不一致（日志 + 计数 + 最近列表）。
    pub fn report(&self, inconsistency: Inconsistency) {
        self.inconsistencies.fetch_add(1, Ordering::Relaxed);
        warn!(
            target: "iotgw.consistency",
            key = %inconsistency.key,
            kind = %inconsistency.entity_kind,
            detail = ?inconsistency.kind,
            "inconsistency_detected"
        );
        if let Ok(mut recent) = self.recent.lock() {
            recent.push_back(inconsistency);
            while recent.len() > RECENT_CAPACITY {
                recent.pop_front();
            }
        }
    }

    pub async fn repair_inconsistency(
        &self,
        inconsistency: &Inconsistency,
    ) -> Result<bool, StorageError> {
        let repaired = self
            .policy
            .repair(self.storage.as_ref(), inconsistency)
            .await?;
        if repaired {
            self.repairs.fetch_add(1, Ordering::Relaxed);
            info!(target: "iotgw.consistency", key = %inconsistency.key, "inconsistency_repaired");
        }
        Ok(repaired)
    }

    /// 最近发现的不一致，最旧的在前。
    pub fn recent_inconsistencies(&self) -> Vec<Inconsistency> {
        self.recent
            .lock()
            .map(|recent| recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> ConsistencyStats {
        ConsistencyStats {
            checks: self.checks.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            inconsistencies: self.inconsistencies.load(Ordering::Relaxed),
            repairs: self.repairs.load(Ordering::Relaxed),
        }
    }
}
