//! Devices: a driver bound to a transport and a device config.
//!
//! A [`Device`] owns the live attribute state. Addresses are resolved against
//! the device context (the config plus `device_id` and `device_name`) right
//! before each I/O call, and every call is bounded by the driver's timeout.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use unison_core::{Context, Error, Result, TransportError, TransportResult, Value};
use unison_transports::{AddressId, PushMessage, SharedTransport, TransportAddress};

use crate::attribute::{Attribute, AttributeDriver, AttributeSnapshot};
use crate::driver::DriverDefinition;
use crate::records::DeviceRecord;

/// Identity and configuration of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceBase {
    pub id: String,
    pub name: String,
    pub config: Context,
}

impl DeviceBase {
    pub fn new(id: impl Into<String>, name: impl Into<String>, config: Context) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            config,
        }
    }
}

/// One attribute that could not be refreshed.
#[derive(Debug)]
pub struct AttributeFailure {
    pub attribute: String,
    pub error: Error,
}

/// Outcome of one polling cycle.
#[derive(Debug, Default)]
pub struct PollReport {
    pub device_id: String,
    /// Attributes that received a value
    pub updated: Vec<String>,
    /// Subset of `updated` whose value differs from before
    pub changed: Vec<String>,
    pub failures: Vec<AttributeFailure>,
}

impl PollReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Device DTO handed to the facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub transport: String,
    pub config: Context,
    pub attributes: Vec<AttributeSnapshot>,
}

pub struct Device {
    id: String,
    base: RwLock<DeviceBase>,
    driver: Arc<DriverDefinition>,
    transport: SharedTransport,
    attributes: RwLock<BTreeMap<String, Attribute>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("driver", &self.driver.id)
            .field("transport", &self.transport.metadata().id)
            .finish()
    }
}

impl Device {
    /// Bind `driver` to `transport`. Both must speak the same protocol.
    pub fn new(base: DeviceBase, driver: Arc<DriverDefinition>, transport: SharedTransport) -> Result<Self> {
        if driver.protocol != transport.protocol() {
            return Err(Error::invalid(format!(
                "driver '{}' speaks {} but transport '{}' is {}",
                driver.id,
                driver.protocol,
                transport.metadata().id,
                transport.protocol()
            )));
        }
        let attributes = driver
            .attributes
            .iter()
            .map(|a| (a.name.clone(), a.instantiate()))
            .collect();
        Ok(Self {
            id: base.id.clone(),
            base: RwLock::new(base),
            driver,
            transport,
            attributes: RwLock::new(attributes),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.base.read().name.clone()
    }

    pub fn base(&self) -> DeviceBase {
        self.base.read().clone()
    }

    pub fn driver(&self) -> &Arc<DriverDefinition> {
        &self.driver
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Replace name and config in place; attribute state is kept.
    pub fn update_base(&self, name: impl Into<String>, config: Context) {
        let mut base = self.base.write();
        base.name = name.into();
        base.config = config;
    }

    /// Template context: the config plus `device_id` and `device_name`.
    pub fn context(&self) -> Context {
        let base = self.base.read();
        let mut context = base.config.clone();
        context.insert("device_id".into(), Value::from(base.id.as_str()));
        context.insert("device_name".into(), Value::from(base.name.as_str()));
        context
    }

    pub fn attribute(&self, name: &str) -> Option<Attribute> {
        self.attributes.read().get(name).cloned()
    }

    pub fn attribute_value(&self, name: &str) -> Option<Value> {
        self.attributes.read().get(name).and_then(|a| a.value().cloned())
    }

    /// Resolved read address of every attribute.
    ///
    /// Attributes whose template cannot be resolved against the current
    /// context are reported as errors.
    pub fn read_addresses(&self) -> Vec<(String, Result<TransportAddress>)> {
        let context = self.context();
        self.driver
            .attributes
            .iter()
            .map(|a| (a.name.clone(), a.read.resolve(&context).map_err(Error::from)))
            .collect()
    }

    async fn bounded<T>(&self, future: impl Future<Output = TransportResult<T>>, what: &str) -> Result<T> {
        let timeout = self.driver.update_strategy.timeout;
        match tokio::time::timeout(timeout, future).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout(format!("{what} after {timeout:?}")).into()),
        }
    }

    async fn read_driver(&self, driver: &AttributeDriver, context: &Context) -> Result<Value> {
        let address = driver.read.resolve(context)?;
        let raw = self
            .bounded(self.transport.read(&address), &format!("reading {address}"))
            .await?;
        let value = driver.pipeline.decode(raw)?;
        driver.data_type.cast(value)
    }

    /// Read, decode and cast one attribute without storing it.
    pub async fn read_attribute(&self, name: &str) -> Result<Value> {
        let driver = self
            .driver
            .attribute(name)
            .ok_or_else(|| Error::not_found(format!("attribute '{name}' on device '{}'", self.id)))?;
        self.read_driver(driver, &self.context()).await
    }

    /// Refresh every readable attribute.
    ///
    /// Reads run one after the other; a failing attribute is logged and
    /// recorded in the report while the rest of the cycle continues.
    pub async fn update_attributes(&self) -> PollReport {
        let context = self.context();
        let mut report = PollReport {
            device_id: self.id.clone(),
            ..PollReport::default()
        };

        for driver in &self.driver.attributes {
            let readable = self
                .attributes
                .read()
                .get(&driver.name)
                .map(|a| a.is_readable())
                .unwrap_or(false);
            if !readable {
                continue;
            }

            let outcome = match self.read_driver(driver, &context).await {
                Ok(value) => self.store(&driver.name, value),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(changed) => {
                    report.updated.push(driver.name.clone());
                    if changed {
                        report.changed.push(driver.name.clone());
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        device_id = %self.id,
                        attribute = %driver.name,
                        error = %error,
                        "Failed to update attribute"
                    );
                    report.failures.push(AttributeFailure {
                        attribute: driver.name.clone(),
                        error,
                    });
                }
            }
        }

        tracing::debug!(
            device_id = %self.id,
            updated = report.updated.len(),
            changed = report.changed.len(),
            failed = report.failures.len(),
            "Polling cycle finished"
        );
        report
    }

    fn store(&self, name: &str, value: Value) -> Result<bool> {
        let mut attributes = self.attributes.write();
        let attribute = attributes
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("attribute '{name}' on device '{}'", self.id)))?;
        attribute.update_value(value)
    }

    /// Write `value` to an attribute and return the stored value.
    ///
    /// The value is cast to the attribute type, encoded through the pipeline
    /// and written to the resolved write address. With `confirm` set, the
    /// attribute is read back and must match.
    pub async fn write_attribute_value(&self, name: &str, value: Value) -> Result<Value> {
        let driver = self
            .driver
            .attribute(name)
            .ok_or_else(|| Error::not_found(format!("attribute '{name}' on device '{}'", self.id)))?;
        let write = driver
            .write
            .as_ref()
            .ok_or_else(|| Error::invalid(format!("attribute '{name}' is read-only")))?;

        let value = driver.data_type.cast(value)?;
        let encoded = driver.pipeline.encode(value.clone())?;
        let context = self.context();
        // `${value}` belongs to the transport, which fills in the encoded value.
        let mut write_context = context.clone();
        write_context.insert("value".into(), Value::from("${value}"));
        let address = write.resolve(&write_context)?;
        self.bounded(self.transport.write(&address, encoded), &format!("writing {address}"))
            .await?;

        if driver.confirm {
            let actual = self.read_driver(driver, &context).await?;
            if !actual.approx_eq(&value) {
                return Err(Error::Confirmation {
                    attribute: name.to_string(),
                    expected: value.to_text(),
                    actual: actual.to_text(),
                });
            }
        }

        self.store(name, value.clone())?;
        tracing::info!(device_id = %self.id, attribute = %name, value = %value.to_text(), "Attribute written");
        Ok(value)
    }

    /// Apply a pushed payload to every attribute read from the message's
    /// address. Returns how many attributes were updated.
    pub fn handle_push(&self, message: &PushMessage) -> usize {
        let context = self.context();
        let mut updated = 0;
        for driver in &self.driver.attributes {
            let matches = driver
                .read
                .resolve(&context)
                .map(|address| address.id() == message.address_id)
                .unwrap_or(false);
            if !matches {
                continue;
            }
            let outcome = driver
                .pipeline
                .decode(message.payload.clone())
                .and_then(|value| self.store(&driver.name, value));
            match outcome {
                Ok(_) => updated += 1,
                Err(e) => tracing::warn!(
                    device_id = %self.id,
                    attribute = %driver.name,
                    topic = %message.topic,
                    error = %e,
                    "Failed to apply pushed value"
                ),
            }
        }
        updated
    }

    /// Address ids this device listens to for pushed values.
    pub fn push_address_ids(&self) -> Vec<AddressId> {
        let mut ids: Vec<AddressId> = self
            .read_addresses()
            .into_iter()
            .filter_map(|(_, address)| address.ok().map(|a| a.id()))
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids.dedup();
        ids
    }

    /// Persistable form of this device.
    pub fn record(&self) -> DeviceRecord {
        let base = self.base.read().clone();
        DeviceRecord {
            id: base.id,
            name: Some(base.name),
            driver: self.driver.id.clone(),
            transport: self.transport.metadata().id.clone(),
            config: base.config,
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let base = self.base.read().clone();
        DeviceSnapshot {
            id: base.id,
            name: base.name,
            driver: self.driver.id.clone(),
            transport: self.transport.metadata().id.clone(),
            config: base.config,
            attributes: self.attributes.read().values().map(Attribute::snapshot).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use unison_transports::{ConnectionState, Protocol, TransportClient, TransportMetadata};

    /// In-memory transport keyed by canonical address.
    struct MemoryTransport {
        metadata: TransportMetadata,
        values: Mutex<HashMap<String, Value>>,
        /// Writes are accepted but not stored
        drop_writes: bool,
    }

    impl MemoryTransport {
        fn new(values: &[(&str, Value)]) -> Self {
            Self {
                metadata: TransportMetadata::new("mem", "Memory"),
                values: Mutex::new(values.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()),
                drop_writes: false,
            }
        }

        fn key(address: &TransportAddress) -> String {
            address.to_string()
        }
    }

    #[async_trait]
    impl TransportClient for MemoryTransport {
        fn protocol(&self) -> Protocol {
            Protocol::Modbus
        }

        fn metadata(&self) -> &TransportMetadata {
            &self.metadata
        }

        fn state(&self) -> ConnectionState {
            ConnectionState::Connected
        }

        async fn connect(&self) -> TransportResult<()> {
            Ok(())
        }

        async fn read(&self, address: &TransportAddress) -> TransportResult<Value> {
            let key = Self::key(address);
            if key.contains("99") {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            self.values
                .lock()
                .get(&key)
                .cloned()
                .ok_or_else(|| TransportError::Read(format!("nothing at {key}")))
        }

        async fn write(&self, address: &TransportAddress, value: Value) -> TransportResult<()> {
            if !self.drop_writes {
                self.values.lock().insert(Self::key(address), value);
            }
            Ok(())
        }

        async fn close(&self) -> TransportResult<()> {
            Ok(())
        }
    }

    fn driver() -> Arc<DriverDefinition> {
        Arc::new(
            DriverDefinition::from_json(json!({
                "id": "boiler",
                "transport": "modbus",
                "update_strategy": {"timeout": "1s"},
                "attributes": [
                    {"name": "temperature", "data_type": "float", "read": "holding:${base}", "scale": 0.1},
                    {"name": "setpoint", "data_type": "float", "read_write": "holding:10", "scale": 0.5, "confirm": true},
                    {"name": "stuck", "data_type": "int", "read": "holding:99"},
                    {"name": "missing", "data_type": "int", "read": "holding:20"}
                ]
            }))
            .unwrap(),
        )
    }

    fn device(transport: MemoryTransport) -> Device {
        let mut config = Context::new();
        config.insert("base".into(), Value::Int(1));
        Device::new(DeviceBase::new("b1", "Boiler", config), driver(), Arc::new(transport)).unwrap()
    }

    fn key(raw: &str) -> String {
        TransportAddress::parse(Protocol::Modbus, raw).unwrap().to_string()
    }

    #[tokio::test]
    async fn test_poll_isolates_failures() {
        let transport = MemoryTransport::new(&[(&key("holding:1"), Value::Int(215)), (&key("holding:10"), Value::Int(40))]);
        let device = device(transport);

        let report = device.update_attributes().await;
        assert_eq!(report.updated, vec!["temperature", "setpoint"]);
        let failed: Vec<_> = report.failures.iter().map(|f| f.attribute.as_str()).collect();
        assert_eq!(failed, vec!["stuck", "missing"]);
        assert!(report.failures[0].error.as_transport().unwrap().is_timeout());
        assert_eq!(device.attribute_value("temperature"), Some(Value::Float(21.5)));
        assert_eq!(device.attribute_value("setpoint"), Some(Value::Float(20.0)));
        assert_eq!(device.attribute_value("stuck"), None);
    }

    #[tokio::test]
    async fn test_write_encodes_and_confirms() {
        let device = device(MemoryTransport::new(&[]));
        let stored = device.write_attribute_value("setpoint", Value::Int(22)).await.unwrap();
        assert_eq!(stored, Value::Float(22.0));
        assert_eq!(device.attribute_value("setpoint"), Some(Value::Float(22.0)));
        assert_eq!(
            device.transport().read(&TransportAddress::parse(Protocol::Modbus, "holding:10").unwrap()).await.unwrap(),
            Value::Float(44.0)
        );
    }

    #[tokio::test]
    async fn test_confirmation_tolerates_register_rounding() {
        let driver = DriverDefinition::from_json(json!({
            "id": "flowmeter",
            "transport": "modbus",
            "attributes": [
                {"name": "flow", "data_type": "float", "read_write": "holding:30:2", "float32_registers": null, "confirm": true}
            ]
        }))
        .unwrap();
        let device = Device::new(
            DeviceBase::new("f1", "Flow meter", Context::new()),
            Arc::new(driver),
            Arc::new(MemoryTransport::new(&[])),
        )
        .unwrap();

        let stored = device.write_attribute_value("flow", Value::Float(21.7)).await.unwrap();
        assert_eq!(stored, Value::Float(21.7));
        let read_back = device.read_attribute("flow").await.unwrap();
        assert_ne!(read_back, Value::Float(21.7));
        assert!(read_back.approx_eq(&stored));
    }

    #[tokio::test]
    async fn test_confirmation_mismatch() {
        let mut transport = MemoryTransport::new(&[(&key("holding:10"), Value::Int(40))]);
        transport.drop_writes = true;
        let device = device(transport);
        let err = device.write_attribute_value("setpoint", Value::Float(25.0)).await.unwrap_err();
        assert!(matches!(err, Error::Confirmation { .. }), "{err}");
        assert_eq!(device.attribute_value("setpoint"), None);
    }

    #[tokio::test]
    async fn test_write_rejections() {
        let device = device(MemoryTransport::new(&[]));
        assert!(matches!(
            device.write_attribute_value("temperature", Value::Float(1.0)).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            device.write_attribute_value("nope", Value::Int(1)).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            device.write_attribute_value("setpoint", Value::Bool(true)).await,
            Err(Error::Type { .. })
        ));
    }

    #[test]
    fn test_push_updates_matching_attributes() {
        let device = device(MemoryTransport::new(&[]));
        let address = TransportAddress::parse(Protocol::Modbus, "holding:1").unwrap();
        let message = PushMessage {
            address_id: address.id(),
            topic: address.to_string(),
            payload: Value::Int(200),
        };
        assert_eq!(device.handle_push(&message), 1);
        assert_eq!(device.attribute_value("temperature"), Some(Value::Float(20.0)));
        assert_eq!(device.push_address_ids().len(), 4);
    }

    #[test]
    fn test_context_and_in_place_update() {
        let device = device(MemoryTransport::new(&[]));
        assert_eq!(device.context().get("device_name"), Some(&Value::from("Boiler")));

        let mut config = Context::new();
        config.insert("base".into(), Value::Int(2));
        device.update_base("Boiler 2", config);
        let snapshot = device.snapshot();
        assert_eq!(snapshot.name, "Boiler 2");
        assert_eq!(snapshot.driver, "boiler");
        assert_eq!(snapshot.attributes.len(), 4);
        assert_eq!(device.read_addresses()[0].1.as_ref().unwrap().to_string(), key("holding:2"));
    }
}
