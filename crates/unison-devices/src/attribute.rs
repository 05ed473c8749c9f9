//! Attributes and the drivers that bind them to transport addresses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unison_core::{AdapterPipeline, DataType, Result, Value};
use unison_transports::AddressTemplate;

/// How one attribute is read and written.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDriver {
    pub name: String,
    pub data_type: DataType,
    pub read: AddressTemplate,
    /// Absent for read-only attributes
    pub write: Option<AddressTemplate>,
    pub pipeline: AdapterPipeline,
    /// Read back after every write and fail when the value differs
    pub confirm: bool,
}

impl AttributeDriver {
    pub fn is_writable(&self) -> bool {
        self.write.is_some()
    }

    /// Fresh live attribute with no value yet.
    pub fn instantiate(&self) -> Attribute {
        Attribute::new(self.name.clone(), self.data_type, self.is_writable())
    }
}

/// Live, device-scoped attribute state.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    name: String,
    data_type: DataType,
    readable: bool,
    writable: bool,
    value: Option<Value>,
    last_updated: Option<DateTime<Utc>>,
    last_changed: Option<DateTime<Utc>>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, data_type: DataType, writable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            readable: true,
            writable,
            value: None,
            last_updated: None,
            last_changed: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn last_changed(&self) -> Option<DateTime<Utc>> {
        self.last_changed
    }

    /// Cast and store a new value.
    ///
    /// `last_updated` is refreshed on every call; `last_changed` only when the
    /// stored value actually changes. Returns whether it changed. A value the
    /// declared type rejects leaves the attribute untouched.
    pub fn update_value(&mut self, value: Value) -> Result<bool> {
        let value = self.data_type.cast(value)?;
        let now = Utc::now();
        let changed = self.value.as_ref() != Some(&value);
        self.value = Some(value);
        self.last_updated = Some(now);
        if changed {
            self.last_changed = Some(now);
        }
        Ok(changed)
    }

    pub fn snapshot(&self) -> AttributeSnapshot {
        AttributeSnapshot {
            name: self.name.clone(),
            data_type: self.data_type,
            readable: self.readable,
            writable: self.writable,
            value: self.value.clone(),
            last_updated: self.last_updated,
            last_changed: self.last_changed,
        }
    }
}

/// Attribute DTO handed to the facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSnapshot {
    pub name: String,
    pub data_type: DataType,
    pub readable: bool,
    pub writable: bool,
    pub value: Option<Value>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_changed: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_changed_only_moves_on_change() {
        let mut attr = Attribute::new("temperature", DataType::Float, false);
        assert!(attr.update_value(Value::Float(21.5)).unwrap());
        let changed = attr.last_changed().unwrap();
        let updated = attr.last_updated().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!attr.update_value(Value::Float(21.5)).unwrap());
        assert_eq!(attr.last_changed(), Some(changed));
        assert!(attr.last_updated().unwrap() > updated);

        assert!(attr.update_value(Value::Int(22)).unwrap());
        assert_eq!(attr.value(), Some(&Value::Float(22.0)));
        assert!(attr.last_changed().unwrap() > changed);
    }

    #[test]
    fn test_rejected_value_leaves_state() {
        let mut attr = Attribute::new("power", DataType::Bool, true);
        attr.update_value(Value::Int(1)).unwrap();
        for bad in [Value::Int(2), Value::Int(-2), Value::Float(4.0), Value::Float(1.0), Value::from("on")] {
            assert!(attr.update_value(bad).is_err());
        }
        assert_eq!(attr.value(), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_int_and_float_casts() {
        let mut count = Attribute::new("count", DataType::Int, false);
        assert!(count.update_value(Value::Bool(true)).is_err());
        assert!(count.update_value(Value::from("many")).is_err());
        count.update_value(Value::from("42")).unwrap();
        assert_eq!(count.value(), Some(&Value::Int(42)));

        let mut level = Attribute::new("level", DataType::Float, false);
        assert!(level.update_value(Value::Bool(false)).is_err());
        assert!(level.update_value(Value::from("high")).is_err());
        level.update_value(Value::from("0.75")).unwrap();
        assert_eq!(level.value(), Some(&Value::Float(0.75)));
    }
}
