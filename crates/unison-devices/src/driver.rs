//! Driver definitions.
//!
//! A [`DriverRecord`] is the authoring format, as written in YAML or JSON.
//! [`DriverDefinition::from_record`] normalizes it once: read/write address
//! fallback, adapter shorthand expansion, duration parsing and eager adapter
//! construction. Everything downstream works on the normalized form only.
//!
//! ```yaml
//! id: thermostat
//! transport: http
//! device_config:
//!   - name: id
//!     json_pointer: /serial
//! attributes:
//!   - name: temperature
//!     data_type: float
//!     read: GET /api/${device_id}/status
//!     json_pointer: /temp
//!     scale: 0.1
//!   - name: setpoint
//!     data_type: float
//!     read_write:
//!       method: PUT
//!       path: /api/${device_id}/setpoint
//!       body: { target: "${value}" }
//!     confirm: true
//! update_strategy:
//!   polling: 15s
//!   timeout: 5s
//! ```

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use unison_core::config::defaults;
use unison_core::{parse_duration, AdapterPipeline, AdapterSpec, Context, DataType, Error, Result, Value};
use unison_transports::{AddressTemplate, Protocol};

use crate::attribute::AttributeDriver;

/// Adapter shorthand keys, in authoring order.
pub type AdapterShorthand = serde_json::Map<String, serde_json::Value>;

/// Authoring form of one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub name: String,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<Value>,
    /// One address for both directions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_write: Option<Value>,
    #[serde(default)]
    pub confirm: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_adapters: Vec<AdapterSpec>,
    /// `<adapter-name>: <argument>` keys
    #[serde(flatten)]
    pub adapters: AdapterShorthand,
}

/// Authoring form of a device-config field extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_adapters: Vec<AdapterSpec>,
    #[serde(flatten)]
    pub adapters: AdapterShorthand,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateStrategyRecord {
    /// Polling interval such as `"15min"`; polling is off when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling: Option<String>,
    /// Per-I/O timeout such as `"5s"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryRecord {
    /// Address pattern to subscribe, e.g. an MQTT topic with wildcards
    pub address: Value,
    /// Field extractors; the driver's `device_config` is used when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_config: Vec<FieldRecord>,
}

/// Driver definition as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub transport: Protocol,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_config: Vec<FieldRecord>,
    pub attributes: Vec<AttributeRecord>,
    #[serde(default)]
    pub update_strategy: UpdateStrategyRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryRecord>,
}

/// Shorthand keys first, in authoring order, then the explicit list.
fn adapter_specs(shorthand: &AdapterShorthand, explicit: &[AdapterSpec]) -> Vec<AdapterSpec> {
    shorthand
        .iter()
        .map(|(name, argument)| AdapterSpec::new(name.clone(), Value::from(argument.clone())))
        .chain(explicit.iter().cloned())
        .collect()
}

/// Named extractor of one device-config field from a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldGetter {
    pub name: String,
    pub pipeline: AdapterPipeline,
}

impl FieldGetter {
    fn from_record(record: &FieldRecord) -> Result<Self> {
        let specs = adapter_specs(&record.adapters, &record.value_adapters);
        let pipeline = AdapterPipeline::from_specs(&specs)
            .map_err(|e| Error::Config(format!("field '{}': {e}", record.name)))?;
        Ok(Self {
            name: record.name.clone(),
            pipeline,
        })
    }

    pub fn extract(&self, payload: &Value) -> Result<Value> {
        self.pipeline.decode(payload.clone())
    }
}

/// Run every getter over `payload`, collecting scalar fields.
///
/// Fields that fail to extract, are null, or are not scalars are skipped.
pub fn extract_fields(getters: &[FieldGetter], payload: &Value) -> Context {
    let mut fields = Context::new();
    for getter in getters {
        match getter.extract(payload) {
            Ok(value) if value.is_scalar() && !value.is_null() => {
                fields.insert(getter.name.clone(), value);
            }
            Ok(value) => {
                tracing::debug!(field = %getter.name, kind = value.kind(), "Skipping non-scalar field");
            }
            Err(e) => {
                tracing::debug!(field = %getter.name, error = %e, "Field not extracted");
            }
        }
    }
    fields
}

/// Polling and timeout policy of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateStrategy {
    pub polling: bool,
    pub interval: Duration,
    /// Bound on every single read or write
    pub timeout: Duration,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            polling: false,
            interval: Duration::from_secs(defaults::POLLING_INTERVAL_SECS),
            timeout: Duration::from_secs(defaults::READ_TIMEOUT_SECS),
        }
    }
}

impl UpdateStrategy {
    fn from_record(record: &UpdateStrategyRecord) -> Result<Self> {
        let mut strategy = Self::default();
        if let Some(polling) = &record.polling {
            strategy.polling = true;
            strategy.interval = parse_duration(polling)?;
        }
        if let Some(timeout) = &record.timeout {
            strategy.timeout = parse_duration(timeout)?;
        }
        Ok(strategy)
    }
}

/// Push subscription that materializes devices from payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryListener {
    pub address: AddressTemplate,
    pub device_config: Vec<FieldGetter>,
}

/// Normalized driver definition.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverDefinition {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    pub device_config: Vec<FieldGetter>,
    pub attributes: Vec<AttributeDriver>,
    pub update_strategy: UpdateStrategy,
    pub discovery: Option<DiscoveryListener>,
    record: DriverRecord,
}

impl DriverDefinition {
    pub fn from_record(record: DriverRecord) -> Result<Self> {
        let context = |e: Error| Error::Config(format!("driver '{}': {e}", record.id));
        if record.id.trim().is_empty() {
            return Err(Error::Config("driver id is empty".into()));
        }
        let protocol = record.transport;

        let device_config = record
            .device_config
            .iter()
            .map(FieldGetter::from_record)
            .collect::<Result<Vec<_>>>()
            .map_err(context)?;

        let mut seen = HashSet::new();
        let mut attributes = Vec::with_capacity(record.attributes.len());
        for attr in &record.attributes {
            if !seen.insert(attr.name.as_str()) {
                return Err(context(Error::invalid(format!(
                    "duplicate attribute '{}'",
                    attr.name
                ))));
            }
            attributes.push(normalize_attribute(protocol, attr).map_err(context)?);
        }

        let update_strategy = UpdateStrategy::from_record(&record.update_strategy).map_err(context)?;

        let discovery = match &record.discovery {
            Some(discovery) => {
                let address = AddressTemplate::new(protocol, discovery.address.clone())
                    .map_err(|e| context(e.into()))?;
                let getters = if discovery.device_config.is_empty() {
                    device_config.clone()
                } else {
                    discovery
                        .device_config
                        .iter()
                        .map(FieldGetter::from_record)
                        .collect::<Result<Vec<_>>>()
                        .map_err(context)?
                };
                Some(DiscoveryListener {
                    address,
                    device_config: getters,
                })
            }
            None => None,
        };

        Ok(Self {
            id: record.id.clone(),
            name: record.name.clone().unwrap_or_else(|| record.id.clone()),
            protocol,
            device_config,
            attributes,
            update_strategy,
            discovery,
            record,
        })
    }

    pub fn from_yaml(input: &str) -> Result<Self> {
        let record: DriverRecord =
            serde_yaml::from_str(input).map_err(|e| Error::Config(format!("driver YAML: {e}")))?;
        Self::from_record(record)
    }

    pub fn from_json(input: serde_json::Value) -> Result<Self> {
        Self::from_record(serde_json::from_value(input)?)
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDriver> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// The authoring record this definition was normalized from.
    pub fn record(&self) -> &DriverRecord {
        &self.record
    }
}

fn normalize_attribute(protocol: Protocol, record: &AttributeRecord) -> Result<AttributeDriver> {
    let context = |e: Error| Error::Config(format!("attribute '{}': {e}", record.name));

    let read = record
        .read
        .clone()
        .or_else(|| record.read_write.clone())
        .ok_or_else(|| context(Error::invalid("missing read address")))?;
    let write = record.write.clone().or_else(|| record.read_write.clone());

    let read = AddressTemplate::new(protocol, read).map_err(|e| context(e.into()))?;
    let write = write
        .map(|w| AddressTemplate::new(protocol, w))
        .transpose()
        .map_err(|e| context(e.into()))?;

    let specs = adapter_specs(&record.adapters, &record.value_adapters);
    let pipeline = AdapterPipeline::from_specs(&specs).map_err(context)?;

    Ok(AttributeDriver {
        name: record.name.clone(),
        data_type: record.data_type,
        read,
        write,
        pipeline,
        confirm: record.confirm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const THERMOSTAT: &str = r#"
id: thermostat
transport: http
attributes:
  - name: temperature
    data_type: float
    read: GET /api/status
    json_pointer: /temp
    scale: 0.1
  - name: setpoint
    data_type: float
    read_write: PUT /api/setpoint
    scale: 0.5
    value_adapters:
      - name: scale
        argument: 2
update_strategy:
  polling: 15min
  timeout: 5s
"#;

    #[test]
    fn test_normalizes_authoring_format() {
        let driver = DriverDefinition::from_yaml(THERMOSTAT).unwrap();
        assert_eq!(driver.name, "thermostat");
        assert_eq!(driver.protocol, Protocol::Http);
        assert!(driver.update_strategy.polling);
        assert_eq!(driver.update_strategy.interval, Duration::from_secs(900));
        assert_eq!(driver.update_strategy.timeout, Duration::from_secs(5));

        let temperature = driver.attribute("temperature").unwrap();
        assert!(!temperature.is_writable());
        let names: Vec<_> = temperature.pipeline.stages().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["json_pointer", "scale"]);
        let raw: Value = serde_json::json!({"temp": 215}).into();
        assert_eq!(temperature.pipeline.decode(raw).unwrap(), Value::Float(21.5));

        let setpoint = driver.attribute("setpoint").unwrap();
        assert!(setpoint.is_writable());
        assert_eq!(setpoint.read.raw(), setpoint.write.as_ref().unwrap().raw());
        // Shorthand runs before the explicit list.
        assert_eq!(setpoint.pipeline.decode(Value::Int(10)).unwrap(), Value::Int(10));
    }

    #[test]
    fn test_unknown_adapter_fails_at_load() {
        let input = THERMOSTAT.replace("scale: 0.1", "scael: 0.1");
        let err = DriverDefinition::from_yaml(&input).unwrap_err();
        assert!(err.to_string().contains("unsupported adapter 'scael'"), "{err}");
    }

    #[test]
    fn test_bad_arguments_fail_at_load() {
        assert!(DriverDefinition::from_yaml(&THERMOSTAT.replace("scale: 0.1", "scale: 0")).is_err());
        assert!(DriverDefinition::from_yaml(&THERMOSTAT.replace("15min", "0s")).is_err());
        assert!(DriverDefinition::from_yaml(&THERMOSTAT.replace("GET /api/status", "FETCH /api/status")).is_err());
    }

    #[test]
    fn test_duplicate_attribute_rejected() {
        let input = THERMOSTAT.replace("name: setpoint", "name: temperature");
        let err = DriverDefinition::from_yaml(&input).unwrap_err();
        assert!(err.to_string().contains("duplicate attribute"), "{err}");
    }

    #[test]
    fn test_polling_off_without_interval() {
        let driver = DriverDefinition::from_json(serde_json::json!({
            "id": "sensor",
            "transport": "mqtt",
            "device_config": [{"name": "id", "json_pointer": "/id"}],
            "attributes": [{
                "name": "temperature",
                "data_type": "float",
                "read": {"topic": "sensors/${id}/state"},
                "json_pointer": "/t"
            }],
            "discovery": {"address": {"topic": "sensors/+/announce"}}
        }))
        .unwrap();
        assert!(!driver.update_strategy.polling);
        let discovery = driver.discovery.as_ref().unwrap();
        assert_eq!(discovery.device_config, driver.device_config);
        assert!(driver.attribute("temperature").unwrap().read.is_templated());
    }

    #[test]
    fn test_extract_fields_keeps_scalars() {
        let getters = vec![
            FieldGetter::from_record(&serde_json::from_value(serde_json::json!({"name": "id", "json_pointer": "/id"})).unwrap()).unwrap(),
            FieldGetter::from_record(&serde_json::from_value(serde_json::json!({"name": "meta", "json_pointer": "/meta"})).unwrap()).unwrap(),
            FieldGetter::from_record(&serde_json::from_value(serde_json::json!({"name": "room", "json_pointer": "/room"})).unwrap()).unwrap(),
        ];
        let payload: Value = serde_json::json!({"id": "a1", "meta": {"fw": 2}}).into();
        let fields = extract_fields(&getters, &payload);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("id"), Some(&Value::from("a1")));
    }
}
