use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use unison_core::{TransportError, TransportResult};

/// Modbus data table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    #[serde(alias = "hr", alias = "holding_register")]
    Holding,
    #[serde(alias = "ir", alias = "input_register")]
    Input,
    #[serde(alias = "co")]
    Coil,
    #[serde(alias = "di", alias = "discrete_input")]
    Discrete,
}

impl RegisterKind {
    /// Coils and discrete inputs carry booleans.
    pub fn is_bit(&self) -> bool {
        matches!(self, Self::Coil | Self::Discrete)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Holding | Self::Coil)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Holding => "holding",
            Self::Input => "input",
            Self::Coil => "coil",
            Self::Discrete => "discrete",
        }
    }
}

impl FromStr for RegisterKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "holding" | "hr" | "holding_register" => Ok(Self::Holding),
            "input" | "ir" | "input_register" => Ok(Self::Input),
            "coil" | "co" => Ok(Self::Coil),
            "discrete" | "di" | "discrete_input" => Ok(Self::Discrete),
            other => Err(TransportError::InvalidAddress(format!(
                "unknown Modbus register kind '{other}'"
            ))),
        }
    }
}

fn default_count() -> u16 {
    1
}

/// Modbus register range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusAddress {
    pub kind: RegisterKind,
    pub index: u16,
    #[serde(default = "default_count")]
    pub count: u16,
    /// Unit id override; the client's configured unit is used when absent
    #[serde(default)]
    pub unit: Option<u8>,
}

impl ModbusAddress {
    pub fn new(kind: RegisterKind, index: u16) -> Self {
        Self {
            kind,
            index,
            count: 1,
            unit: None,
        }
    }

    pub fn with_count(mut self, count: u16) -> Self {
        self.count = count;
        self
    }

    pub fn with_unit(mut self, unit: u8) -> Self {
        self.unit = Some(unit);
        self
    }

    /// `"<kind>:<index>[:<count>]"`.
    pub fn parse(input: &str) -> TransportResult<Self> {
        let invalid = || {
            TransportError::InvalidAddress(format!(
                "Modbus address must look like '<kind>:<index>[:<count>]', got '{input}'"
            ))
        };
        let parts: Vec<&str> = input.trim().split(':').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(invalid());
        }
        let kind = parts[0].parse()?;
        let index = parts[1].trim().parse().map_err(|_| invalid())?;
        let count = match parts.get(2) {
            Some(count) => count.trim().parse().map_err(|_| invalid())?,
            None => 1,
        };
        let address = Self {
            kind,
            index,
            count,
            unit: None,
        };
        address.validate()?;
        Ok(address)
    }

    pub(super) fn validate(&self) -> TransportResult<()> {
        let max = if self.kind.is_bit() { 2000 } else { 125 };
        if self.count == 0 || self.count > max {
            return Err(TransportError::InvalidAddress(format!(
                "Modbus {} count must be between 1 and {max}, got {}",
                self.kind.as_str(),
                self.count
            )));
        }
        if u32::from(self.index) + u32::from(self.count) > 0x1_0000 {
            return Err(TransportError::InvalidAddress(format!(
                "Modbus range {}+{} exceeds the register space",
                self.index, self.count
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ModbusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.index)?;
        if self.count != 1 {
            write!(f, ":{}", self.count)?;
        }
        if let Some(unit) = self.unit {
            write!(f, "@{unit}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let address = ModbusAddress::parse("holding:100:2").unwrap();
        assert_eq!(address, ModbusAddress::new(RegisterKind::Holding, 100).with_count(2));
        assert_eq!(ModbusAddress::parse("di:5").unwrap().kind, RegisterKind::Discrete);
        assert!(ModbusAddress::parse("holding").is_err());
        assert!(ModbusAddress::parse("holding:x").is_err());
        assert!(ModbusAddress::parse("holding:1:0").is_err());
        assert!(ModbusAddress::parse("holding:65535:2").is_err());
    }
}
