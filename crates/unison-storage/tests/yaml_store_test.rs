//! YAML directory repository and manager bootstrap.

use serde_json::json;
use tempfile::TempDir;
use unison_core::{Error, Value};
use unison_devices::{DeviceRecord, DevicesManager, TransportRecord};
use unison_storage::{Repository, Store, YamlDirectory};
use unison_transports::Protocol;

const DRIVER_YAML: &str = r#"
id: thermostat
name: Smart thermostat
transport: http
update_strategy:
  polling: 30s
  timeout: 3s
attributes:
  - name: temperature
    data_type: float
    read: GET /api/${serial}
    json_pointer: /temp
    scale: 0.1
  - name: target
    data_type: float
    read_write: /api/${serial}/target
"#;

#[tokio::test]
async fn test_records_round_trip_through_files() {
    let dir = TempDir::new().unwrap();
    let repo = YamlDirectory::<DeviceRecord>::open(dir.path().join("devices")).await.unwrap();

    let record = DeviceRecord::new("t1", "thermostat", "lan")
        .with_name("Hallway")
        .with_config("serial", "T-100")
        .with_config("floor", 2);
    repo.write(&record).await.unwrap();
    assert!(dir.path().join("devices/t1.yaml").is_file());

    let loaded = repo.read("t1").await.unwrap().unwrap();
    assert_eq!(loaded, record);
    assert_eq!(loaded.config.get("floor"), Some(&Value::Int(2)));

    repo.write(&DeviceRecord::new("a0", "thermostat", "lan")).await.unwrap();
    let ids: Vec<String> = repo.list_all().await.unwrap().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["a0", "t1"]);

    assert!(repo.delete("t1").await.unwrap());
    assert!(!repo.delete("t1").await.unwrap());
    assert!(repo.read("t1").await.unwrap().is_none());
    assert!(repo.is_persistent());

    let err = repo.write(&DeviceRecord::new("../escape", "x", "y")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{err}");
}

#[tokio::test]
async fn test_hand_written_files_and_bad_files() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("b.yml"), "id: b\ndriver: d\ntransport: t\n").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
    let repo = YamlDirectory::<DeviceRecord>::open(dir.path()).await.unwrap();

    assert_eq!(repo.read("b").await.unwrap().unwrap().driver, "d");
    assert_eq!(repo.list_all().await.unwrap().len(), 1);

    std::fs::write(dir.path().join("c.yaml"), "id: c\ndriver: [oops\n").unwrap();
    assert!(matches!(repo.list_all().await, Err(Error::Storage(_))));

    let each = repo.load_each().await.unwrap();
    assert_eq!(each.len(), 2);
    assert!(each[0].1.is_ok());
    assert!(each[1].1.is_err());
}

#[tokio::test]
async fn test_bootstrap_loads_in_dependency_order() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_dir(dir.path()).await.unwrap();

    store
        .transports
        .write(&TransportRecord::new("lan", Protocol::Http, json!({"base_url": "http://127.0.0.1:1"})))
        .await
        .unwrap();
    std::fs::write(dir.path().join("drivers/thermostat.yaml"), DRIVER_YAML).unwrap();
    std::fs::write(
        dir.path().join("drivers/broken.yaml"),
        "id: broken\ntransport: http\nattributes:\n  - name: x\n    data_type: int\n    read: /x\n    scale: 0\n",
    )
    .unwrap();
    store
        .devices
        .write(&DeviceRecord::new("t1", "thermostat", "lan").with_config("serial", "T-100"))
        .await
        .unwrap();
    store
        .devices
        .write(&DeviceRecord::new("orphan", "missing", "lan"))
        .await
        .unwrap();

    let manager = DevicesManager::new();
    let report = store.bootstrap(&manager).await.unwrap();
    assert_eq!((report.transports, report.drivers, report.devices), (1, 1, 1));
    let failed: Vec<_> = report.failures.iter().map(|f| (f.kind, f.id.as_str())).collect();
    assert_eq!(failed, vec![("driver", "broken"), ("device", "orphan")]);

    let driver = manager.driver("thermostat").unwrap();
    assert_eq!(driver.name, "Smart thermostat");
    assert!(driver.update_strategy.polling);
    assert!(driver.attribute("target").unwrap().is_writable());
    assert!(manager.device("t1").is_some());
}

#[tokio::test]
async fn test_bootstrap_skips_unparseable_files() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_dir(dir.path()).await.unwrap();
    store
        .transports
        .write(&TransportRecord::new("lan", Protocol::Http, json!({"base_url": "http://127.0.0.1:1"})))
        .await
        .unwrap();
    std::fs::write(dir.path().join("drivers/thermostat.yaml"), DRIVER_YAML).unwrap();
    std::fs::write(dir.path().join("drivers/garbled.yml"), "id: garbled\nattributes: {").unwrap();
    std::fs::write(dir.path().join("devices/bad.yaml"), "id: bad\ndriver: [oops").unwrap();
    store
        .devices
        .write(&DeviceRecord::new("t1", "thermostat", "lan").with_config("serial", "T-100"))
        .await
        .unwrap();

    let manager = DevicesManager::new();
    let report = store.bootstrap(&manager).await.unwrap();
    assert_eq!((report.transports, report.drivers, report.devices), (1, 1, 1));
    assert!(!report.is_clean());
    let failed: Vec<_> = report.failures.iter().map(|f| (f.kind, f.id.as_str())).collect();
    assert_eq!(failed, vec![("driver", "garbled"), ("device", "bad")]);
    assert!(matches!(report.failures[1].error, Error::Storage(_)));
    assert!(manager.device("t1").is_some());
    assert!(manager.device("bad").is_none());
}

#[tokio::test]
async fn test_discovered_devices_are_persisted_once() {
    let store = Store::memory();
    store
        .transports
        .write(&TransportRecord::new("lan", Protocol::Http, json!({"base_url": "http://127.0.0.1:1"})))
        .await
        .unwrap();
    store
        .drivers
        .write(&serde_yaml::from_str(DRIVER_YAML).unwrap())
        .await
        .unwrap();
    let manager = DevicesManager::new();
    store.bootstrap(&manager).await.unwrap();

    store
        .add_device(&manager, DeviceRecord::new("t1", "thermostat", "lan").with_config("serial", "1"))
        .await
        .unwrap();
    // Registered behind the store's back, like a discovered device.
    manager
        .add_device(DeviceRecord::new("t2", "thermostat", "lan").with_name("Attic").with_config("serial", "2"))
        .await
        .unwrap();

    assert_eq!(store.persist_new_devices(&manager).await.unwrap(), 1);
    assert_eq!(store.persist_new_devices(&manager).await.unwrap(), 0);
    let saved = store.devices.read("t2").await.unwrap().unwrap();
    assert_eq!(saved.display_name(), "Attic");
    assert_eq!(saved.config.get("serial"), Some(&Value::from("2")));

    store.remove_device(&manager, "t1").await.unwrap();
    assert!(manager.device("t1").is_none());
    assert!(store.devices.read("t1").await.unwrap().is_none());
}
