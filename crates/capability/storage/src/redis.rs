//! Redis 存储实现
//!
//! 所有键统一加前缀；前缀枚举使用 SCAN，避免 KEYS 阻塞。

use crate::error::StorageError;
use crate::traits::StorageManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// Redis 存储
pub struct RedisStorageManager {
    client: redis::Client,
    key_prefix: String,
    default_ttl_seconds: Option<u64>,
    running: AtomicBool,
}

impl RedisStorageManager {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            default_ttl_seconds: None,
            running: AtomicBool::new(false),
        }
    }

    pub fn connect(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self, StorageError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self::new(client, key_prefix))
    }

    pub fn connect_with_ttl(
        redis_url: &str,
        key_prefix: impl Into<String>,
        ttl_seconds: Option<u64>,
    ) -> Result<Self, StorageError> {
        let mut storage = Self::connect(redis_url, key_prefix)?;
        storage.default_ttl_seconds = ttl_seconds.filter(|value| *value > 0);
        Ok(storage)
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn ensure_running(&self) -> Result<(), StorageError> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::NotRunning)
        }
    }

    fn ttl_seconds(&self, ttl: Option<Duration>) -> Option<u64> {
        match ttl {
            // set_ex 只接受整秒，不足一秒按一秒处理
            Some(ttl) => Some(ttl.as_secs().max(1)),
            None => self.default_ttl_seconds,
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StorageError> {
        Ok(self.client.get_multiplexed_tokio_connection().await?)
    }
}

#[async_trait::async_trait]
impl StorageManager for RedisStorageManager {
    async fn start(&self) -> Result<(), StorageError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut connection = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        self.running.store(true, Ordering::SeqCst);
        info!(target: "iotgw.storage", prefix = %self.key_prefix, "redis_storage_started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), StorageError> {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(target: "iotgw.storage", prefix = %self.key_prefix, "redis_storage_stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.ensure_running()?;
        let mut connection = self.connection().await?;
        let data: Option<Vec<u8>> = connection.get(self.full_key(key)).await?;
        Ok(data)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.ensure_running()?;
        let mut connection = self.connection().await?;
        let key = self.full_key(key);
        if let Some(ttl) = self.ttl_seconds(ttl) {
            connection.set_ex::<_, _, ()>(key, value, ttl).await?;
        } else {
            connection.set::<_, _, ()>(key, value).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.ensure_running()?;
        let mut connection = self.connection().await?;
        let removed: i64 = connection.del(self.full_key(key)).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.ensure_running()?;
        let mut connection = self.connection().await?;
        let exists: bool = connection.exists(self.full_key(key)).await?;
        Ok(exists)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_running()?;
        let mut connection = self.connection().await?;
        let pattern = format!("{}{}*", self.key_prefix, prefix);
        let mut cursor: u64 = 0;
        let mut items = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut connection)
                .await?;
            for key in keys {
                if let Some(stripped) = key.strip_prefix(&self.key_prefix) {
                    items.push(stripped.to_string());
                }
            }
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        items.sort();
        items.dedup();
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_rounds_up_to_one_second() {
        let storage =
            RedisStorageManager::connect_with_ttl("redis://127.0.0.1:6379", "iotgw:", Some(30))
                .expect("client");
        assert_eq!(storage.ttl_seconds(None), Some(30));
        assert_eq!(storage.ttl_seconds(Some(Duration::from_millis(10))), Some(1));
        assert_eq!(storage.full_key("device:04A228CD"), "iotgw:device:04A228CD");
    }

    #[tokio::test]
    async fn operations_require_start() {
        let storage = RedisStorageManager::connect("redis://127.0.0.1:6379", "iotgw:")
            .expect("client");
        assert!(matches!(
            storage.get("device:04A228CD").await,
            Err(StorageError::NotRunning)
        ));
    }
}
