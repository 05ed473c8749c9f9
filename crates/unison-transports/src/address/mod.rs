//! Transport addresses.
//!
//! Every protocol has its own address shape. All of them can be built from a
//! structured map (optionally merged with extra context, usually the device
//! config) and all of them share one identity scheme: the first 16 hex
//! characters of the SHA-256 of the address's canonical JSON form. Identical
//! content always yields the identical [`AddressId`], which is what push
//! dispatch and read waiters key on.

mod bacnet;
mod http;
mod modbus;
mod mqtt;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unison_core::template::{self, Context};
use unison_core::{TransportError, TransportResult, Value};

pub use bacnet::{BacnetAddress, BacnetObjectType, PROPERTY_PRESENT_VALUE};
pub use http::HttpAddress;
pub use modbus::{ModbusAddress, RegisterKind};
pub use mqtt::{topic_matches, MqttAddress};

/// Number of hex characters kept from the address digest.
pub const ADDRESS_ID_LEN: usize = 16;

/// Supported wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Mqtt,
    Modbus,
    Bacnet,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Mqtt => "mqtt",
            Self::Modbus => "modbus",
            Self::Bacnet => "bacnet",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Self::Http),
            "mqtt" => Ok(Self::Mqtt),
            "modbus" | "modbus-tcp" | "modbus_tcp" => Ok(Self::Modbus),
            "bacnet" | "bacnet-ip" | "bacnet_ip" => Ok(Self::Bacnet),
            other => Err(TransportError::Unsupported(format!("protocol '{other}'"))),
        }
    }
}

/// Content-derived address identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressId(String);

impl AddressId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AddressId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A concrete, fully resolved address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum TransportAddress {
    Http(HttpAddress),
    Mqtt(MqttAddress),
    Modbus(ModbusAddress),
    Bacnet(BacnetAddress),
}

impl TransportAddress {
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Http(_) => Protocol::Http,
            Self::Mqtt(_) => Protocol::Mqtt,
            Self::Modbus(_) => Protocol::Modbus,
            Self::Bacnet(_) => Protocol::Bacnet,
        }
    }

    /// Parse the compact string form of an address.
    pub fn parse(protocol: Protocol, input: &str) -> TransportResult<Self> {
        match protocol {
            Protocol::Http => HttpAddress::parse(input).map(Self::Http),
            Protocol::Mqtt => MqttAddress::parse(input).map(Self::Mqtt),
            Protocol::Modbus => ModbusAddress::parse(input).map(Self::Modbus),
            Protocol::Bacnet => BacnetAddress::parse(input).map(Self::Bacnet),
        }
    }

    /// Build from a compact string or a structured map.
    ///
    /// For maps, keys of `extra` fill in fields the map does not set; keys
    /// that are not address fields are ignored.
    pub fn from_value(protocol: Protocol, value: &Value, extra: Option<&Context>) -> TransportResult<Self> {
        match value {
            Value::String(s) => Self::parse(protocol, s),
            Value::Map(map) => {
                let mut merged = map.clone();
                if let Some(extra) = extra {
                    for (key, v) in extra {
                        merged.entry(key.clone()).or_insert_with(|| v.clone());
                    }
                }
                let json = Value::Map(merged).to_json();
                let invalid = |e: serde_json::Error| {
                    TransportError::InvalidAddress(format!("{protocol} address: {e}"))
                };
                let address = match protocol {
                    Protocol::Http => Self::Http(serde_json::from_value(json).map_err(invalid)?),
                    Protocol::Mqtt => Self::Mqtt(serde_json::from_value(json).map_err(invalid)?),
                    Protocol::Modbus => Self::Modbus(serde_json::from_value(json).map_err(invalid)?),
                    Protocol::Bacnet => Self::Bacnet(serde_json::from_value(json).map_err(invalid)?),
                };
                address.validate()?;
                Ok(address)
            }
            other => Err(TransportError::InvalidAddress(format!(
                "{protocol} address must be a string or a map, got {}",
                other.describe()
            ))),
        }
    }

    fn validate(&self) -> TransportResult<()> {
        match self {
            Self::Http(a) => a.validate(),
            Self::Mqtt(a) => a.validate(),
            Self::Modbus(a) => a.validate(),
            Self::Bacnet(a) => a.validate(),
        }
    }

    /// Canonical serialization the identity is derived from.
    pub fn canonical(&self) -> String {
        // Struct fields serialize in declaration order and maps are BTreeMaps.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Stable 16-hex identity of this address.
    pub fn id(&self) -> AddressId {
        let digest = Sha256::digest(self.canonical().as_bytes());
        let mut id = hex::encode(digest);
        id.truncate(ADDRESS_ID_LEN);
        AddressId(id)
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(a) => write!(f, "{a}"),
            Self::Mqtt(a) => write!(f, "{a}"),
            Self::Modbus(a) => write!(f, "{a}"),
            Self::Bacnet(a) => write!(f, "{a}"),
        }
    }
}

/// An address that may still contain `${field}` placeholders.
///
/// Held by attribute drivers and resolved against the owning device's
/// context before every I/O call.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressTemplate {
    protocol: Protocol,
    raw: Value,
}

impl AddressTemplate {
    /// Wrap a raw address. Addresses without placeholders are parsed right
    /// away so malformed ones fail at load time.
    pub fn new(protocol: Protocol, raw: Value) -> TransportResult<Self> {
        if !template::is_templated(&raw) {
            TransportAddress::from_value(protocol, &raw, None)?;
        }
        Ok(Self { protocol, raw })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn is_templated(&self) -> bool {
        template::is_templated(&self.raw)
    }

    /// Resolve placeholders strictly and build the concrete address.
    pub fn resolve(&self, context: &Context) -> TransportResult<TransportAddress> {
        let resolved = template::resolve_strict(&self.raw, context)
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))?;
        TransportAddress::from_value(self.protocol, &resolved, Some(context))
    }
}
