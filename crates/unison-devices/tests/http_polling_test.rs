//! End-to-end polling and writes against a mock HTTP device.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use unison_core::{Error, Value};
use unison_devices::{DeviceRecord, DevicesManager, DriverDefinition, TransportRecord};
use unison_transports::Protocol;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn thermostat_driver(polling: Option<&str>) -> DriverDefinition {
    let mut strategy = json!({"timeout": "2s"});
    if let Some(interval) = polling {
        strategy["polling"] = json!(interval);
    }
    DriverDefinition::from_json(json!({
        "id": "thermostat",
        "transport": "http",
        "update_strategy": strategy,
        "attributes": [
            {
                "name": "temperature",
                "data_type": "float",
                "read": "GET /api/devices/${serial}",
                "json_pointer": "/data/temp",
                "scale": 0.1
            },
            {
                "name": "mode",
                "data_type": "string",
                "read": "GET /api/devices/${serial}",
                "json_pointer": "/data/mode",
                "write": {
                    "method": "PUT",
                    "path": "/api/devices/${serial}/mode",
                    "body": {"mode": "${value}", "by": "${device_name}"}
                }
            },
            {
                "name": "firmware",
                "data_type": "string",
                "read": "GET /api/devices/${serial}/firmware"
            }
        ]
    }))
    .unwrap()
}

async fn setup(server: &MockServer, polling: Option<&str>) -> Arc<DevicesManager> {
    let manager = DevicesManager::new();
    manager
        .add_transport(TransportRecord::new(
            "lan",
            Protocol::Http,
            json!({"base_url": server.uri(), "timeout": 2}),
        ))
        .await
        .unwrap();
    manager.add_driver(thermostat_driver(polling)).await.unwrap();
    manager
        .add_device(
            DeviceRecord::new("t1", "thermostat", "lan")
                .with_name("Hallway")
                .with_config("serial", "T-100"),
        )
        .await
        .unwrap();
    manager
}

async fn mount_status(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/devices/T-100"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": {"temp": 215, "mode": "heat"}})),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_poll_decodes_and_tracks_changes() {
    let server = MockServer::start().await;
    mount_status(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/devices/T-100/firmware"))
        .respond_with(ResponseTemplate::new(200).set_body_string("1.4.2"))
        .mount(&server)
        .await;
    let manager = setup(&server, None).await;

    let report = manager.update_device("t1").await.unwrap();
    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(report.changed.len(), 3);

    let device = manager.device("t1").unwrap();
    let temperature = device.attribute("temperature").unwrap();
    assert_eq!(temperature.value(), Some(&Value::Float(21.5)));
    assert_eq!(device.attribute_value("mode"), Some(Value::from("heat")));
    assert_eq!(device.attribute_value("firmware"), Some(Value::from("1.4.2")));
    let first_changed = temperature.last_changed().unwrap();
    let first_updated = temperature.last_updated().unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = manager.update_device("t1").await.unwrap();
    assert_eq!(report.updated.len(), 3);
    assert!(report.changed.is_empty());

    let temperature = device.attribute("temperature").unwrap();
    assert_eq!(temperature.last_changed(), Some(first_changed));
    assert!(temperature.last_updated().unwrap() > first_updated);
}

#[tokio::test]
async fn test_failing_attribute_does_not_abort_cycle() {
    let server = MockServer::start().await;
    mount_status(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/devices/T-100/firmware"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let manager = setup(&server, None).await;

    let report = manager.update_device("t1").await.unwrap();
    assert_eq!(report.updated, vec!["temperature", "mode"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].attribute, "firmware");
    assert!(matches!(report.failures[0].error, Error::Transport(_)));
}

#[tokio::test]
async fn test_write_resolves_device_and_value_placeholders() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/devices/T-100/mode"))
        .and(body_json(json!({"mode": "cool", "by": "Hallway"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    let manager = setup(&server, None).await;

    let stored = manager
        .write_attribute("t1", "mode", Value::from("cool"))
        .await
        .unwrap();
    assert_eq!(stored, Value::from("cool"));
    let device = manager.device("t1").unwrap();
    assert_eq!(device.attribute_value("mode"), Some(Value::from("cool")));

    let err = manager
        .write_attribute("t1", "firmware", Value::from("2.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{err}");
}

#[tokio::test]
async fn test_polling_loop_runs_until_stopped() {
    let server = MockServer::start().await;
    mount_status(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/devices/T-100/firmware"))
        .respond_with(ResponseTemplate::new(200).set_body_string("1.4.2"))
        .mount(&server)
        .await;
    let manager = setup(&server, Some("1s")).await;

    assert_eq!(manager.start_polling().await.unwrap(), 1);
    assert!(manager.is_device_polled("t1"));
    // Already scheduled devices are not scheduled twice.
    assert_eq!(manager.start_polling().await.unwrap(), 0);

    let device = manager.device("t1").unwrap();
    for _ in 0..200 {
        if device.attribute_value("temperature").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(device.attribute_value("temperature"), Some(Value::Float(21.5)));

    assert_eq!(manager.stop_polling().await, 1);
    assert!(!manager.is_polling());
    assert_eq!(manager.task_count(), 0);
}

#[tokio::test]
async fn test_devices_added_while_polling_are_scheduled() {
    let server = MockServer::start().await;
    mount_status(&server).await;
    let manager = setup(&server, Some("1m")).await;
    manager.start_polling().await.unwrap();

    manager
        .add_device(DeviceRecord::new("t2", "thermostat", "lan").with_config("serial", "T-200"))
        .await
        .unwrap();
    assert!(manager.is_device_polled("t2"));

    manager.remove_device("t2").await.unwrap();
    assert!(!manager.is_device_polled("t2"));
    assert!(manager.device("t2").is_none());
    manager.shutdown().await;
    assert_eq!(manager.task_count(), 0);
}
