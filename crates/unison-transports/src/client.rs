//! Transport client contract.
//!
//! Every protocol client implements [`TransportClient`]. Reads and writes call
//! [`TransportClient::ensure_connected`] first, so an unconnected client never
//! attempts I/O. Protocol library errors are converted to
//! [`TransportError`] inside each client and never cross this boundary.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use unison_core::{Error, Result, TransportError, TransportResult, Value};

use crate::address::{AddressId, Protocol, TransportAddress};
use crate::bacnet::{BacnetClient, BacnetConfig};
use crate::http::{HttpClient, HttpConfig};
use crate::modbus::{ModbusClient, ModbusConfig};
use crate::mqtt::{MqttClient, MqttConfig};
use crate::state::ConnectionState;

/// Identity of a transport instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMetadata {
    pub id: String,
    pub name: String,
}

impl TransportMetadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A message delivered by a push transport.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    /// Identity of the subscribed address the message matched
    pub address_id: AddressId,
    /// Concrete topic or locator the message arrived on
    pub topic: String,
    pub payload: Value,
}

/// Per-protocol connection object.
#[async_trait]
pub trait TransportClient: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn metadata(&self) -> &TransportMetadata;

    fn state(&self) -> ConnectionState;

    /// Open the connection. Idempotent while connected.
    async fn connect(&self) -> TransportResult<()>;

    /// Connect when not connected. Any failure surfaces as
    /// [`TransportError::Connection`].
    async fn ensure_connected(&self) -> TransportResult<()> {
        if self.state().is_connected() {
            return Ok(());
        }
        self.connect().await.map_err(|e| match e {
            TransportError::Connection(_) => e,
            other => TransportError::Connection(other.to_string()),
        })
    }

    async fn read(&self, address: &TransportAddress) -> TransportResult<Value>;

    async fn write(&self, address: &TransportAddress, value: Value) -> TransportResult<()>;

    /// Release the connection. Always passes through `Closing` to `Closed`.
    async fn close(&self) -> TransportResult<()>;

    fn supports_push(&self) -> bool {
        false
    }

    /// Start receiving pushed messages for `address`.
    async fn subscribe(&self, address: &TransportAddress) -> TransportResult<AddressId> {
        Err(TransportError::Unsupported(format!(
            "{} transport cannot subscribe to {address}",
            self.protocol()
        )))
    }

    async fn unsubscribe(&self, address: &TransportAddress) -> TransportResult<()> {
        Err(TransportError::Unsupported(format!(
            "{} transport cannot unsubscribe from {address}",
            self.protocol()
        )))
    }

    /// Stream of pushed messages, for push-capable transports.
    fn messages(&self) -> Option<broadcast::Receiver<PushMessage>> {
        None
    }
}

/// Shared handle to a transport client.
pub type SharedTransport = Arc<dyn TransportClient>;

/// Error for an address of another protocol.
pub(crate) fn protocol_mismatch(expected: Protocol, address: &TransportAddress) -> TransportError {
    TransportError::InvalidAddress(format!(
        "{} address '{address}' given to a {expected} transport",
        address.protocol()
    ))
}

/// Typed, closed-schema client configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    Http(HttpConfig),
    Mqtt(MqttConfig),
    Modbus(ModbusConfig),
    Bacnet(BacnetConfig),
}

impl TransportConfig {
    /// Parse a protocol's config map. Unknown keys are rejected.
    pub fn from_json(protocol: Protocol, config: serde_json::Value) -> Result<Self> {
        let config = match config {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };
        let invalid = |e: serde_json::Error| Error::Config(format!("invalid {protocol} config: {e}"));
        Ok(match protocol {
            Protocol::Http => Self::Http(serde_json::from_value(config).map_err(invalid)?),
            Protocol::Mqtt => Self::Mqtt(serde_json::from_value(config).map_err(invalid)?),
            Protocol::Modbus => Self::Modbus(serde_json::from_value(config).map_err(invalid)?),
            Protocol::Bacnet => Self::Bacnet(serde_json::from_value(config).map_err(invalid)?),
        })
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Http(_) => Protocol::Http,
            Self::Mqtt(_) => Protocol::Mqtt,
            Self::Modbus(_) => Protocol::Modbus,
            Self::Bacnet(_) => Protocol::Bacnet,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let json = match self {
            Self::Http(c) => serde_json::to_value(c),
            Self::Mqtt(c) => serde_json::to_value(c),
            Self::Modbus(c) => serde_json::to_value(c),
            Self::Bacnet(c) => serde_json::to_value(c),
        };
        json.unwrap_or(serde_json::Value::Null)
    }
}

/// Build a client for `config`. Nothing connects until first use.
pub fn create_client(metadata: TransportMetadata, config: TransportConfig) -> SharedTransport {
    match config {
        TransportConfig::Http(c) => Arc::new(HttpClient::new(metadata, c)),
        TransportConfig::Mqtt(c) => Arc::new(MqttClient::new(metadata, c)),
        TransportConfig::Modbus(c) => Arc::new(ModbusClient::new(metadata, c)),
        TransportConfig::Bacnet(c) => Arc::new(BacnetClient::new(metadata, c)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_rejects_unknown_fields() {
        let err = TransportConfig::from_json(
            Protocol::Modbus,
            json!({"host": "10.0.0.2", "prot": 502}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("prot"), "{err}");
    }

    #[test]
    fn test_config_defaults() {
        let config = TransportConfig::from_json(Protocol::Mqtt, json!({"host": "broker"})).unwrap();
        match config {
            TransportConfig::Mqtt(c) => assert_eq!(c.port, 1883),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_created_clients_start_idle() {
        let config = TransportConfig::from_json(
            Protocol::Http,
            json!({"base_url": "http://127.0.0.1:1"}),
        )
        .unwrap();
        let client = create_client(TransportMetadata::new("t1", "Gateway"), config);
        assert_eq!(client.state(), ConnectionState::Idle);
        assert_eq!(client.protocol(), Protocol::Http);
        assert!(!client.supports_push());
        assert!(client.messages().is_none());
    }
}
