use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use unison_core::{TransportError, TransportResult};

/// `present-value` property identifier.
pub const PROPERTY_PRESENT_VALUE: u32 = 85;

const NAMED_PROPERTIES: &[(&str, u32)] = &[
    ("description", 28),
    ("object-name", 77),
    ("out-of-service", 81),
    ("present-value", PROPERTY_PRESENT_VALUE),
    ("priority-array", 87),
    ("relinquish-default", 104),
    ("status-flags", 111),
    ("units", 117),
];

/// BACnet object types this client addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BacnetObjectType {
    #[serde(alias = "ai")]
    AnalogInput,
    #[serde(alias = "ao")]
    AnalogOutput,
    #[serde(alias = "av")]
    AnalogValue,
    #[serde(alias = "bi")]
    BinaryInput,
    #[serde(alias = "bo")]
    BinaryOutput,
    #[serde(alias = "bv")]
    BinaryValue,
    Device,
    #[serde(alias = "msi")]
    MultiStateInput,
    #[serde(alias = "mso")]
    MultiStateOutput,
    #[serde(alias = "msv")]
    MultiStateValue,
}

impl BacnetObjectType {
    /// Numeric object type from the BACnet standard.
    pub fn code(&self) -> u16 {
        match self {
            Self::AnalogInput => 0,
            Self::AnalogOutput => 1,
            Self::AnalogValue => 2,
            Self::BinaryInput => 3,
            Self::BinaryOutput => 4,
            Self::BinaryValue => 5,
            Self::Device => 8,
            Self::MultiStateInput => 13,
            Self::MultiStateOutput => 14,
            Self::MultiStateValue => 19,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0 => Self::AnalogInput,
            1 => Self::AnalogOutput,
            2 => Self::AnalogValue,
            3 => Self::BinaryInput,
            4 => Self::BinaryOutput,
            5 => Self::BinaryValue,
            8 => Self::Device,
            13 => Self::MultiStateInput,
            14 => Self::MultiStateOutput,
            19 => Self::MultiStateValue,
            _ => return None,
        })
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::BinaryInput | Self::BinaryOutput | Self::BinaryValue)
    }

    pub fn is_multi_state(&self) -> bool {
        matches!(
            self,
            Self::MultiStateInput | Self::MultiStateOutput | Self::MultiStateValue
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnalogInput => "analog-input",
            Self::AnalogOutput => "analog-output",
            Self::AnalogValue => "analog-value",
            Self::BinaryInput => "binary-input",
            Self::BinaryOutput => "binary-output",
            Self::BinaryValue => "binary-value",
            Self::Device => "device",
            Self::MultiStateInput => "multi-state-input",
            Self::MultiStateOutput => "multi-state-output",
            Self::MultiStateValue => "multi-state-value",
        }
    }
}

impl fmt::Display for BacnetObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BacnetObjectType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        let found = match normalized.as_str() {
            "ai" => Some(Self::AnalogInput),
            "ao" => Some(Self::AnalogOutput),
            "av" => Some(Self::AnalogValue),
            "bi" => Some(Self::BinaryInput),
            "bo" => Some(Self::BinaryOutput),
            "bv" => Some(Self::BinaryValue),
            "msi" => Some(Self::MultiStateInput),
            "mso" => Some(Self::MultiStateOutput),
            "msv" => Some(Self::MultiStateValue),
            other => (0..=19)
                .filter_map(Self::from_code)
                .find(|t| t.as_str() == other),
        };
        found.ok_or_else(|| TransportError::InvalidAddress(format!("unknown BACnet object type '{s}'")))
    }
}

fn default_property() -> u32 {
    PROPERTY_PRESENT_VALUE
}

fn parse_property(input: &str) -> TransportResult<u32> {
    let normalized = input.trim().to_ascii_lowercase().replace('_', "-");
    if let Ok(number) = normalized.parse::<u32>() {
        return Ok(number);
    }
    NAMED_PROPERTIES
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|(_, id)| *id)
        .ok_or_else(|| TransportError::InvalidAddress(format!("unknown BACnet property '{input}'")))
}

fn deserialize_property<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Property {
        Id(u32),
        Name(String),
    }
    match Property::deserialize(deserializer)? {
        Property::Id(id) => Ok(id),
        Property::Name(name) => parse_property(&name).map_err(serde::de::Error::custom),
    }
}

/// BACnet object property locator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacnetAddress {
    pub object_type: BacnetObjectType,
    pub instance: u32,
    #[serde(default = "default_property", deserialize_with = "deserialize_property")]
    pub property: u32,
    /// Command priority for writes (1..=16)
    #[serde(default)]
    pub priority: Option<u8>,
}

impl BacnetAddress {
    pub fn new(object_type: BacnetObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
            property: PROPERTY_PRESENT_VALUE,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// `"<object-type>:<instance>[:<property>][@<priority>]"`.
    pub fn parse(input: &str) -> TransportResult<Self> {
        let invalid = || {
            TransportError::InvalidAddress(format!(
                "BACnet address must look like '<object-type>:<instance>[:<property>][@<priority>]', got '{input}'"
            ))
        };
        let (locator, priority) = match input.trim().split_once('@') {
            Some((locator, priority)) => (
                locator,
                Some(priority.trim().parse::<u8>().map_err(|_| invalid())?),
            ),
            None => (input.trim(), None),
        };
        let parts: Vec<&str> = locator.split(':').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(invalid());
        }
        let address = Self {
            object_type: parts[0].parse()?,
            instance: parts[1].trim().parse().map_err(|_| invalid())?,
            property: match parts.get(2) {
                Some(property) => parse_property(property)?,
                None => PROPERTY_PRESENT_VALUE,
            },
            priority,
        };
        address.validate()?;
        Ok(address)
    }

    pub(super) fn validate(&self) -> TransportResult<()> {
        if self.instance >= 1 << 22 {
            return Err(TransportError::InvalidAddress(format!(
                "BACnet instance {} exceeds 22 bits",
                self.instance
            )));
        }
        if let Some(priority) = self.priority {
            if !(1..=16).contains(&priority) {
                return Err(TransportError::InvalidAddress(format!(
                    "BACnet priority must be between 1 and 16, got {priority}"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for BacnetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.object_type.as_str(), self.instance, self.property)?;
        if let Some(priority) = self.priority {
            write!(f, "@{priority}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let address = BacnetAddress::parse("analog-value:3:present-value@8").unwrap();
        assert_eq!(address, BacnetAddress::new(BacnetObjectType::AnalogValue, 3).with_priority(8));
        assert_eq!(BacnetAddress::parse("bo:1").unwrap().object_type, BacnetObjectType::BinaryOutput);
        assert_eq!(BacnetAddress::parse("ai:1:77").unwrap().property, 77);
        assert!(BacnetAddress::parse("analog-value").is_err());
        assert!(BacnetAddress::parse("pump:1").is_err());
        assert!(BacnetAddress::parse("av:1@17").is_err());
    }

    #[test]
    fn test_map_form_accepts_property_names() {
        let json = serde_json::json!({"object_type": "av", "instance": 2, "property": "units"});
        let address: BacnetAddress = serde_json::from_value(json).unwrap();
        assert_eq!(address.property, 117);
    }
}
