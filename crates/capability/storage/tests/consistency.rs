use domain::{DeviceData, Entity};
use iotgw_storage::{
    ConsistencyManager, ExtendedStorageManager, InMemoryStorageManager, Inconsistency,
    InconsistencyKind, RepairPolicy, StorageError, StorageManager,
};
use std::sync::Arc;

fn sample_device() -> DeviceData {
    DeviceData::new("04A228CD", 0x04A2_28CD, "89860318123456789012", 42, 1)
}

async fn started_storage() -> Arc<InMemoryStorageManager> {
    let storage = Arc::new(InMemoryStorageManager::new());
    storage.start().await.expect("start");
    storage
}

#[tokio::test]
async fn check_reports_missing_and_version_mismatch() {
    let storage = started_storage().await;
    let consistency = ConsistencyManager::new(storage.clone());

    let mut device = sample_device();
    let found = consistency.check(&device).await.expect("check");
    assert_eq!(
        found.map(|item| item.kind),
        Some(InconsistencyKind::MissingInStorage)
    );

    storage.save_device_data(&device).await.expect("save");
    assert_eq!(consistency.check(&device).await.expect("check"), None);

    device.set_version(5);
    let found = consistency.check(&device).await.expect("check").expect("mismatch");
    assert_eq!(
        found.kind,
        InconsistencyKind::VersionMismatch {
            cached: 5,
            stored: 0
        }
    );

    let stats = consistency.stats();
    assert_eq!(stats.checks, 3);
    assert_eq!(stats.inconsistencies, 2);
    assert_eq!(consistency.recent_inconsistencies().len(), 2);
}

#[tokio::test]
async fn default_repair_does_nothing() {
    let storage = started_storage().await;
    let consistency = ConsistencyManager::new(storage);
    let found = consistency
        .check(&sample_device())
        .await
        .expect("check")
        .expect("missing");
    assert!(!consistency.repair_inconsistency(&found).await.expect("repair"));
    assert_eq!(consistency.stats().repairs, 0);
}

struct DeleteStale;

#[async_trait::async_trait]
impl RepairPolicy for DeleteStale {
    async fn repair(
        &self,
        storage: &dyn StorageManager,
        inconsistency: &Inconsistency,
    ) -> Result<bool, StorageError> {
        storage.delete(&inconsistency.key).await
    }
}

#[tokio::test]
async fn custom_repair_policy_is_used() {
    let storage = started_storage().await;
    let consistency =
        ConsistencyManager::new(storage.clone()).with_repair_policy(Arc::new(DeleteStale));
    let mut device = sample_device();
    storage.save_device_data(&device).await.expect("save");
    device.set_version(2);
    let found = consistency.check(&device).await.expect("check").expect("mismatch");
    assert!(consistency.repair_inconsistency(&found).await.expect("repair"));
    assert!(!storage.exists(&device.storage_key()).await.expect("exists"));
    assert_eq!(consistency.stats().repairs, 1);
}

#[test]
fn validate_counts_failures() {
    let consistency = ConsistencyManager::new(Arc::new(InMemoryStorageManager::new()));
    let mut device = sample_device();
    consistency.validate(&device).expect("valid");
    device.iccid.clear();
    assert!(consistency.validate(&device).is_err());
    assert_eq!(consistency.stats().validation_failures, 1);
}
