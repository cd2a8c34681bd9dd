use domain::{DeviceData, DeviceState, Entity, OrderData, PortData};
use iotgw_storage::{ExtendedStorageManager, InMemoryStorageManager, StorageError, StorageManager};
use std::sync::Arc;

fn sample_device() -> DeviceData {
    DeviceData::new("04A228CD", 0x04A2_28CD, "89860318123456789012", 42, 1)
}

#[tokio::test]
async fn operations_fail_when_stopped() {
    let storage = InMemoryStorageManager::new();
    let err = storage.get("device:04A228CD").await.expect_err("stopped");
    assert!(matches!(err, StorageError::NotRunning));

    storage.start().await.expect("start");
    storage.stop().await.expect("stop");
    storage.stop().await.expect("stop twice");
    assert!(!storage.is_running());
    assert!(storage.set("k", vec![1], None).await.is_err());
}

#[tokio::test]
async fn typed_entities_roundtrip() {
    let storage = InMemoryStorageManager::new();
    storage.start().await.expect("start");

    let device = sample_device();
    storage.save_device_data(&device).await.expect("save device");
    let loaded = storage
        .load_device_data("04A228CD")
        .await
        .expect("load")
        .expect("device");
    assert_eq!(loaded, device);

    let state = DeviceState::new("04A228CD");
    storage.save_device_state(&state).await.expect("save state");
    assert!(storage.load_device_state("04A228CD").await.expect("load").is_some());

    storage
        .save_port_data(&PortData::new("04A228CD", 1))
        .await
        .expect("save port");
    storage
        .save_port_data(&PortData::new("04A228CD", 2))
        .await
        .expect("save port");
    let keys = storage
        .keys(&domain::keys::device_ports_prefix("04A228CD"))
        .await
        .expect("keys");
    assert_eq!(keys, vec!["port:04A228CD:1", "port:04A228CD:2"]);

    let order = OrderData::new("ORD-0001", "04A228CD", 1);
    storage.save_order_data(&order).await.expect("save order");
    assert!(storage.exists(&order.storage_key()).await.expect("exists"));
    assert!(storage.delete_order_data("ORD-0001").await.expect("delete"));
    assert!(!storage.delete_order_data("ORD-0001").await.expect("delete again"));
    assert!(storage.load_order_data("ORD-0001").await.expect("load").is_none());
}

#[tokio::test]
async fn l2_write_through_and_read_through() {
    let l2 = Arc::new(InMemoryStorageManager::new());
    let storage = InMemoryStorageManager::new().with_l2(l2.clone());
    storage.start().await.expect("start");
    assert!(l2.is_running());

    storage.set("device:A", b"a".to_vec(), None).await.expect("set");
    assert_eq!(l2.get("device:A").await.expect("l2 get"), Some(b"a".to_vec()));

    // 只存在于 L2 的条目读取后回填 L1
    l2.set("device:B", b"b".to_vec(), None).await.expect("l2 set");
    assert_eq!(storage.len(), 1);
    assert_eq!(storage.get("device:B").await.expect("get"), Some(b"b".to_vec()));
    assert_eq!(storage.len(), 2);
    assert_eq!(storage.stats().l2_hits, 1);

    assert_eq!(
        storage.keys("device:").await.expect("keys"),
        vec!["device:A", "device:B"]
    );

    storage.stop().await.expect("stop");
    assert!(!l2.is_running());
}

#[tokio::test]
async fn corrupt_payload_is_serialization_error() {
    let storage = InMemoryStorageManager::new();
    storage.start().await.expect("start");
    storage
        .set("device:04A228CD", b"not json".to_vec(), None)
        .await
        .expect("set");
    let err = storage
        .load_device_data("04A228CD")
        .await
        .expect_err("corrupt");
    assert!(matches!(err, StorageError::Serialization(_)));
}
