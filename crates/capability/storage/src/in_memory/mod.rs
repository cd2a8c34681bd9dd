//! 内存存储实现
//!
//! L1 为 `RwLock<HashMap>`，条目可带过期时间；可选挂接一个 L2 存储：
//! - 写入：先写 L2，成功后写 L1（write-through）
//! - 读取：L1 未命中时读 L2，命中则回填 L1（read-through）

use crate::error::StorageError;
use crate::traits::StorageManager;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

/// 存储统计快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub hits: u64,
    pub misses: u64,
    pub l2_hits: u64,
    pub writes: u64,
    pub deletes: u64,
    pub expired: u64,
}

#[derive(Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    l2_hits: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    expired: AtomicU64,
}

/// 内存存储
pub struct InMemoryStorageManager {
    entries: RwLock<HashMap<String, Entry>>,
    l2: Option<Arc<dyn StorageManager>>,
    default_ttl: Option<Duration>,
    running: AtomicBool,
    stats: StatCounters,
}

impl InMemoryStorageManager {
    /// 创建纯内存存储
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            l2: None,
            default_ttl: None,
            running: AtomicBool::new(false),
            stats: StatCounters::default(),
        }
    }

    /// 挂接 L2 存储
    pub fn with_l2(mut self, l2: Arc<dyn StorageManager>) -> Self {
        self.l2 = Some(l2);
        self
    }

    /// 设置默认 TTL
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl.filter(|ttl| !ttl.is_zero());
        self
    }

    /// 当前 L1 条目数（含未清理的过期条目）
    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            l2_hits: self.stats.l2_hits.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
        }
    }

    /// 清理已过期条目，返回清理数量
    pub fn purge_expired(&self) -> Result<usize, StorageError> {
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| StorageError::LockFailed)?;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        self.stats
            .expired
            .fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    fn ensure_running(&self) -> Result<(), StorageError> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::NotRunning)
        }
    }

    fn put_local(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let expires_at = ttl.or(self.default_ttl).map(|ttl| Instant::now() + ttl);
        let mut entries = self.entries.write().map_err(|_| StorageError::LockFailed)?;
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    /// 读 L1；过期条目就地移除
    fn get_local(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().map_err(|_| StorageError::LockFailed)?;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        let mut entries = self.entries.write().map_err(|_| StorageError::LockFailed)?;
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
        }
        Ok(None)
    }
}

impl Default for InMemoryStorageManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageManager for InMemoryStorageManager {
    async fn start(&self) -> Result<(), StorageError> {
        if let Some(l2) = &self.l2 {
            l2.start().await?;
        }
        if !self.running.swap(true, Ordering::SeqCst) {
            info!(target: "iotgw.storage", l2 = self.l2.is_some(), "storage_started");
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), StorageError> {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(target: "iotgw.storage", "storage_stopped");
        }
        if let Some(l2) = &self.l2 {
            l2.stop().await?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.ensure_running()?;
        if let Some(value) = self.get_local(key)? {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }
        let Some(l2) = &self.l2 else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        match l2.get(key).await? {
            Some(value) => {
                self.stats.l2_hits.fetch_add(1, Ordering::Relaxed);
                self.put_local(key, value.clone(), None)?;
                debug!(target: "iotgw.storage", key, "storage_l1_backfill");
                Ok(Some(value))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.ensure_running()?;
        if let Some(l2) = &self.l2 {
            l2.set(key, value.clone(), ttl).await?;
        }
        self.put_local(key, value, ttl)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.ensure_running()?;
        let mut existed = match &self.l2 {
            Some(l2) => l2.delete(key).await?,
            None => false,
        };
        let removed = {
            let mut entries = self.entries.write().map_err(|_| StorageError::LockFailed)?;
            entries
                .remove(key)
                .is_some_and(|entry| !entry.is_expired(Instant::now()))
        };
        existed |= removed;
        if existed {
            self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.ensure_running()?;
        if self.get_local(key)?.is_some() {
            return Ok(true);
        }
        match &self.l2 {
            Some(l2) => l2.exists(key).await,
            None => Ok(false),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_running()?;
        let now = Instant::now();
        let mut keys: BTreeSet<String> = {
            let entries = self.entries.read().map_err(|_| StorageError::LockFailed)?;
            entries
                .iter()
                .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect()
        };
        if let Some(l2) = &self.l2 {
            keys.extend(l2.keys(prefix).await?);
        }
        Ok(keys.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let storage = InMemoryStorageManager::new();
        storage.start().await.expect("start");
        storage
            .set("k", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .expect("set");
        assert!(storage.exists("k").await.expect("exists"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(storage.get("k").await.expect("get"), None);
        assert!(storage.keys("").await.expect("keys").is_empty());
        assert_eq!(storage.stats().expired, 1);
    }

    #[tokio::test]
    async fn default_ttl_applies_when_unset() {
        let storage =
            InMemoryStorageManager::new().with_default_ttl(Some(Duration::from_millis(10)));
        storage.start().await.expect("start");
        storage.set("k", b"v".to_vec(), None).await.expect("set");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(storage.purge_expired().expect("purge"), 1);
        assert!(storage.is_empty());
    }
}
