//! 通用数据管理器
//!
//! 每类实体一个管理器，负责：
//! - 写入前校验，失败的实体不会被部分应用
//! - 版本号递增：`max(旧版本, 传入版本) + 1`
//! - 缓存 + 存储双写（先写存储，成功后更新缓存）
//!
//! 对外返回的永远是副本。

use crate::error::DataBusError;
use domain::Entity;
use iotgw_storage::{StorageManager, delete_entity, load_entity, save_entity};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// 管理器统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub cached: usize,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub validation_failures: u64,
    pub conflicts: u64,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    validation_failures: AtomicU64,
    conflicts: AtomicU64,
}

/// 批量写入结果
#[derive(Debug)]
pub struct BatchSetOutcome<E> {
    pub saved: Vec<E>,
    pub failed: Vec<(String, DataBusError)>,
}

pub struct DataManager<E: Entity> {
    storage: Arc<dyn StorageManager>,
    cache: RwLock<HashMap<String, E>>,
    running: AtomicBool,
    counters: Counters,
}

impl<E: Entity> DataManager<E> {
    pub fn new(storage: Arc<dyn StorageManager>) -> Self {
        Self {
            storage,
            cache: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), DataBusError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(DataBusError::NotRunning)
        }
    }

    /// 按存储键读取；缓存未命中时读存储并回填缓存。
    pub async fn get(&self, key: &str) -> Result<Option<E>, DataBusError> {
        self.ensure_running()?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(entity) = self.cache.read().await.get(key) {
            return Ok(Some(entity.clone()));
        }
        let loaded: Option<E> = load_entity(self.storage.as_ref(), key).await?;
        if let Some(entity) = &loaded {
            self.cache
                .write()
                .await
                .entry(key.to_string())
                .or_insert_with(|| entity.clone());
        }
        Ok(loaded)
    }

    /// 写入实体，返回 (写入后的实体, 写入前的实体)。
    pub async fn set(&self, entity: E) -> Result<(E, Option<E>), DataBusError> {
        self.ensure_running()?;
        self.validate(&entity)?;
        let key = entity.storage_key();
        let mut cache = self.cache.write().await;
        let previous = self.current(&cache, &key).await?;
        let saved = self.write_locked(&mut cache, key, entity, previous.as_ref()).await?;
        Ok((saved, previous))
    }

    /// 仅当当前版本等于 `expected_version` 时写入；不存在的实体视为版本 0。
    pub async fn compare_and_set(
        &self,
        entity: E,
        expected_version: u64,
    ) -> Result<E, DataBusError> {
        self.ensure_running()?;
        self.validate(&entity)?;
        let key = entity.storage_key();
        let mut cache = self.cache.write().await;
        let previous = self.current(&cache, &key).await?;
        let actual = previous.as_ref().map(Entity::version).unwrap_or(0);
        if actual != expected_version {
            self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(DataBusError::VersionConflict {
                key,
                expected: expected_version,
                actual,
            });
        }
        self.write_locked(&mut cache, key, entity, previous.as_ref())
            .await
    }

    /// 逐个写入，单个失败不影响其余条目。
    pub async fn batch_set(&self, entities: Vec<E>) -> Result<BatchSetOutcome<E>, DataBusError> {
        self.ensure_running()?;
        let mut outcome = BatchSetOutcome {
            saved: Vec::with_capacity(entities.len()),
            failed: Vec::new(),
        };
        for entity in entities {
            let key = entity.storage_key();
            match self.set(entity).await {
                Ok((saved, _)) => outcome.saved.push(saved),
                Err(err) => outcome.failed.push((key, err)),
            }
        }
        Ok(outcome)
    }

    /// 删除实体，返回删除前的值。
    pub async fn delete(&self, key: &str) -> Result<Option<E>, DataBusError> {
        self.ensure_running()?;
        let mut cache = self.cache.write().await;
        let previous = self.current(&cache, key).await?;
        delete_entity(self.storage.as_ref(), key).await?;
        cache.remove(key);
        if previous.is_some() {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
            let kind = E::KIND;
            debug!(target: "iotgw.databus", kind = %kind, key, "entity_deleted");
        }
        Ok(previous)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, DataBusError> {
        self.ensure_running()?;
        if self.cache.read().await.contains_key(key) {
            return Ok(true);
        }
        Ok(self.storage.exists(key).await?)
    }

    /// 该类实体的全部记录（按键排序）。
    pub async fn list(&self) -> Result<Vec<E>, DataBusError> {
        self.list_prefix(E::KIND.key_prefix()).await
    }

    /// 键以 `prefix` 开头的全部记录（按键排序）。
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<E>, DataBusError> {
        self.ensure_running()?;
        let keys = self.storage.keys(prefix).await?;
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entity) = self.get(&key).await? {
                items.push(entity);
            }
        }
        Ok(items)
    }

    pub async fn count(&self) -> Result<usize, DataBusError> {
        self.ensure_running()?;
        Ok(self.storage.keys(E::KIND.key_prefix()).await?.len())
    }

    /// 当前缓存中的全部实体副本。
    pub async fn cached(&self) -> Vec<E> {
        self.cache.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            cached: self.cache.read().await.len(),
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            validation_failures: self.counters.validation_failures.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
        }
    }

    fn validate(&self, entity: &E) -> Result<(), DataBusError> {
        entity.validate().map_err(|err| {
            self.counters
                .validation_failures
                .fetch_add(1, Ordering::Relaxed);
            DataBusError::Validation(err)
        })
    }

    async fn current(
        &self,
        cache: &HashMap<String, E>,
        key: &str,
    ) -> Result<Option<E>, DataBusError> {
        if let Some(entity) = cache.get(key) {
            return Ok(Some(entity.clone()));
        }
        Ok(load_entity(self.storage.as_ref(), key).await?)
    }

    async fn write_locked(
        &self,
        cache: &mut HashMap<String, E>,
        key: String,
        mut entity: E,
        previous: Option<&E>,
    ) -> Result<E, DataBusError> {
        let base = previous.map(Entity::version).unwrap_or(0);
        entity.set_version(base.max(entity.version()) + 1);
        entity.set_updated_at_ms(domain::now_epoch_ms());
        save_entity(self.storage.as_ref(), &entity, None).await?;
        cache.insert(key, entity.clone());
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{DeviceData, PortData};
    use iotgw_storage::InMemoryStorageManager;

    async fn manager<E: Entity>() -> DataManager<E> {
        let storage = Arc::new(InMemoryStorageManager::new());
        storage.start().await.expect("start");
        let manager = DataManager::new(storage);
        manager.start();
        manager
    }

    fn device() -> DeviceData {
        DeviceData::new("04A228CD", 0x04A2_28CD, "89860318123456789012", 42, 1)
    }

    #[tokio::test]
    async fn version_increments_on_every_write() {
        let manager = manager::<DeviceData>().await;
        let (first, previous) = manager.set(device()).await.expect("set");
        assert_eq!(first.version, 1);
        assert!(previous.is_none());
        let (second, previous) = manager.set(device()).await.expect("set");
        assert_eq!(second.version, 2);
        assert_eq!(previous.map(|d| d.version), Some(1));

        let mut ahead = device();
        ahead.version = 10;
        let (third, _) = manager.set(ahead).await.expect("set");
        assert_eq!(third.version, 11);
    }

    #[tokio::test]
    async fn invalid_entity_is_not_applied() {
        let manager = manager::<DeviceData>().await;
        let mut invalid = device();
        invalid.conn_id = 0;
        let err = manager.set(invalid).await.expect_err("invalid");
        assert!(matches!(err, DataBusError::Validation(_)));
        assert!(!manager.exists("device:04A228CD").await.expect("exists"));
        assert_eq!(manager.stats().await.validation_failures, 1);
    }

    #[tokio::test]
    async fn compare_and_set_detects_conflict() {
        let manager = manager::<DeviceData>().await;
        manager.compare_and_set(device(), 0).await.expect("first");
        let err = manager
            .compare_and_set(device(), 0)
            .await
            .expect_err("conflict");
        assert!(matches!(
            err,
            DataBusError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
        let saved = manager.compare_and_set(device(), 1).await.expect("second");
        assert_eq!(saved.version, 2);
    }

    #[tokio::test]
    async fn list_count_and_batch() {
        let manager = manager::<PortData>().await;
        let mut bad = PortData::new("04A228CD", 3);
        bad.current_a = -1.0;
        let outcome = manager
            .batch_set(vec![
                PortData::new("04A228CD", 1),
                PortData::new("04A228CD", 2),
                bad,
            ])
            .await
            .expect("batch");
        assert_eq!(outcome.saved.len(), 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "port:04A228CD:3");
        assert_eq!(manager.count().await.expect("count"), 2);
        let ports = manager.list().await.expect("list");
        assert_eq!(
            ports.iter().map(|p| p.port_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn stopped_manager_rejects_operations() {
        let manager = manager::<DeviceData>().await;
        manager.stop();
        assert!(matches!(
            manager.get("device:04A228CD").await,
            Err(DataBusError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn delete_returns_previous_value() {
        let manager = manager::<DeviceData>().await;
        manager.set(device()).await.expect("set");
        let removed = manager.delete("device:04A228CD").await.expect("delete");
        assert_eq!(removed.map(|d| d.device_id), Some("04A228CD".to_string()));
        assert!(manager.get("device:04A228CD").await.expect("get").is_none());
        assert!(manager.delete("device:04A228CD").await.expect("delete").is_none());
    }
}
