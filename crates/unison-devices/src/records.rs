//! Persisted configuration records for devices and transports.
//!
//! Driver records live in [`crate::driver`] since they double as the driver
//! authoring format.

use serde::{Deserialize, Serialize};
use unison_core::{Context, Result};
use unison_transports::{create_client, Protocol, SharedTransport, TransportConfig, TransportMetadata};

/// A device bound to a driver and a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub driver: String,
    pub transport: String,
    /// Scalar fields the driver's address templates resolve against
    #[serde(default)]
    pub config: Context,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>, driver: impl Into<String>, transport: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            driver: driver.into(),
            transport: transport.into(),
            config: Context::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<unison_core::Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A configured transport instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub protocol: Protocol,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl TransportRecord {
    pub fn new(id: impl Into<String>, protocol: Protocol, config: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: None,
            protocol,
            config,
        }
    }

    pub fn metadata(&self) -> TransportMetadata {
        TransportMetadata::new(&self.id, self.name.as_deref().unwrap_or(&self.id))
    }

    /// Validate the protocol configuration and build an idle client.
    pub fn build(&self) -> Result<SharedTransport> {
        let config = TransportConfig::from_json(self.protocol, self.config.clone())?;
        Ok(create_client(self.metadata(), config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unison_core::Value;
    use unison_transports::ConnectionState;

    #[test]
    fn test_device_record_from_yaml() {
        let record: DeviceRecord = serde_yaml::from_str(
            "id: thermostat-1\ndriver: thermostat\ntransport: lan\nconfig:\n  host: 10.0.0.5\n  zone: 3\n",
        )
        .unwrap();
        assert_eq!(record.display_name(), "thermostat-1");
        assert_eq!(record.config.get("zone"), Some(&Value::Int(3)));
        assert!(serde_yaml::from_str::<DeviceRecord>("id: a\ndriver: b\ntransport: c\nextra: 1\n").is_err());
    }

    #[test]
    fn test_transport_record_builds_client() {
        let record: TransportRecord =
            serde_yaml::from_str("id: broker\nprotocol: mqtt\nconfig:\n  host: localhost\n").unwrap();
        let client = record.build().unwrap();
        assert_eq!(client.protocol(), Protocol::Mqtt);
        assert_eq!(client.metadata().name, "broker");
        assert_eq!(client.state(), ConnectionState::Idle);

        let bad = TransportRecord::new("plc", Protocol::Modbus, serde_json::json!({"host": "x", "baud": 9600}));
        assert!(bad.build().is_err());
    }
}
