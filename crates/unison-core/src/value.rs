//! Dynamic value model.
//!
//! [`Value`] is the currency of the adapter pipeline: transports produce raw
//! values, adapters transform them, and attributes store the cast result.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A dynamically typed value travelling between wire and attribute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Raw bytes (serialized as a list of byte numbers)
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// True for null, bool, numbers and strings.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::String(_)
        )
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of ints and floats. Booleans are not numbers here.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Equality that tolerates float rounding: numbers compare within a
    /// relative tolerance of `1e-6` once either side is a float, so values
    /// that went through `f32` registers or a scale factor still match.
    pub fn approx_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float(_), Self::Float(_) | Self::Int(_)) | (Self::Int(_), Self::Float(_)) => {
                let (a, b) = match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return false,
                };
                a == b || (a - b).abs() <= 1e-6 * a.abs().max(b.abs())
            }
            _ => self == other,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Byte view of `Bytes` or of a list whose items all fit in a byte.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Bytes(b) => Some(b.clone()),
            Self::List(items) => items
                .iter()
                .map(|v| v.as_i64().and_then(|i| u8::try_from(i).ok()))
                .collect(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a key in a map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// String rendering used for template substitution and `string` casts.
    pub fn to_text(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::List(_) | Self::Map(_) | Self::Bytes(_) => {
                serde_json::Value::from(self.clone()).to_string()
            }
            other => other.to_string(),
        }
    }

    /// Description of the value for error messages (strings are quoted).
    pub fn describe(&self) -> String {
        match self {
            Self::String(s) => format!("{s:?}"),
            other => format!("{other}"),
        }
    }

    /// Convert into a `serde_json::Value`.
    pub fn to_json(&self) -> serde_json::Value {
        self.clone().into()
    }

    /// Decode a wire payload: JSON when it parses, UTF-8 text otherwise,
    /// and raw bytes as the last resort.
    pub fn from_payload(payload: &[u8]) -> Self {
        if let Ok(json) = serde_json::from_slice::<serde_json::Value>(payload) {
            return json.into();
        }
        match std::str::from_utf8(payload) {
            Ok(text) => Self::String(text.to_string()),
            Err(_) => Self::Bytes(payload.to_vec()),
        }
    }

    /// Encode a value as a wire payload (inverse of [`Value::from_payload`]).
    pub fn to_payload(&self) -> Vec<u8> {
        match self {
            Self::String(s) => s.as_bytes().to_vec(),
            Self::Bytes(b) => b.clone(),
            other => other.to_json().to_string().into_bytes(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => (*a as f64) == *b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Self::List(_) | Self::Map(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Int(i) => Self::from(i),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(Self::Number)
                .unwrap_or(Self::Null),
            Value::String(s) => Self::String(s),
            Value::Bytes(b) => Self::Array(b.into_iter().map(Self::from).collect()),
            Value::List(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Map(map) => Self::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Self::Map(v)
    }
}

/// Declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[serde(alias = "boolean")]
    Bool,
    #[serde(alias = "integer")]
    Int,
    #[serde(alias = "double", alias = "number")]
    Float,
    #[serde(alias = "str")]
    String,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::String => write!(f, "string"),
        }
    }
}

impl DataType {
    /// Cast a value to this type.
    ///
    /// Booleans are never numbers: `int` and `float` reject them, and `bool`
    /// only takes `true`, `false`, `0`, `1` (or their string spelling of
    /// `"true"`/`"false"`).
    pub fn cast(self, value: Value) -> Result<Value> {
        let rejected = |value: &Value| Error::type_error(value.describe(), self.to_string());
        match self {
            Self::Bool => match value {
                Value::Bool(b) => Ok(Value::Bool(b)),
                Value::Int(0) => Ok(Value::Bool(false)),
                Value::Int(1) => Ok(Value::Bool(true)),
                Value::String(ref s) if s == "true" => Ok(Value::Bool(true)),
                Value::String(ref s) if s == "false" => Ok(Value::Bool(false)),
                other => Err(rejected(&other)),
            },
            Self::Int => match value {
                Value::Int(i) => Ok(Value::Int(i)),
                Value::Float(f) => lossless_int(f)
                    .map(Value::Int)
                    .ok_or_else(|| rejected(&Value::Float(f))),
                Value::String(ref s) => parse_int(s)
                    .map(Value::Int)
                    .ok_or_else(|| rejected(&value)),
                other => Err(rejected(&other)),
            },
            Self::Float => match value {
                Value::Int(i) => Ok(Value::Float(i as f64)),
                Value::Float(f) => Ok(Value::Float(f)),
                Value::String(ref s) => parse_float(s)
                    .map(Value::Float)
                    .ok_or_else(|| rejected(&value)),
                other => Err(rejected(&other)),
            },
            Self::String => match value {
                Value::Null => Err(rejected(&Value::Null)),
                other => Ok(Value::String(other.to_text())),
            },
        }
    }
}

/// Integer equal to `f`, when the conversion is exact.
pub(crate) fn lossless_int(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn parse_float(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|f| f.is_finite())
}

fn parse_int(s: &str) -> Option<i64> {
    let trimmed = s.trim();
    trimmed
        .parse::<i64>()
        .ok()
        .or_else(|| parse_float(trimmed).and_then(lossless_int))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_approx_eq_tolerates_float_rounding() {
        let stored = Value::Float(f64::from(21.7_f32));
        assert_ne!(stored, Value::Float(21.7));
        assert!(stored.approx_eq(&Value::Float(21.7)));
        assert!(Value::Int(22).approx_eq(&Value::Float(22.000_001)));
        assert!(!Value::Float(21.7).approx_eq(&Value::Float(21.8)));
        assert!(!Value::Float(0.0).approx_eq(&Value::Float(1e-3)));
        assert!(Value::Int(3).approx_eq(&Value::Int(3)));
        assert!(!Value::Int(3).approx_eq(&Value::Int(4)));
        assert!(!Value::from("1.0").approx_eq(&Value::Float(1.0)));
    }

    #[test]
    fn test_bool_cast() {
        assert_eq!(DataType::Bool.cast(Value::Int(1)).unwrap(), Value::Bool(true));
        assert_eq!(DataType::Bool.cast(Value::Int(0)).unwrap(), Value::Bool(false));
        assert_eq!(DataType::Bool.cast("true".into()).unwrap(), Value::Bool(true));
        for bad in [
            Value::Int(2),
            Value::Int(-2),
            Value::Float(4.0),
            Value::Float(1.0),
            Value::from("yes"),
            Value::from("1.0"),
        ] {
            assert!(DataType::Bool.cast(bad.clone()).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_int_cast() {
        assert_eq!(DataType::Int.cast(Value::Float(3.0)).unwrap(), Value::Int(3));
        assert_eq!(DataType::Int.cast("42".into()).unwrap(), Value::Int(42));
        assert_eq!(DataType::Int.cast("42.0".into()).unwrap(), Value::Int(42));
        assert!(DataType::Int.cast(Value::Float(3.5)).is_err());
        assert!(DataType::Int.cast(Value::Bool(true)).is_err());
        assert!(DataType::Int.cast(Value::Bool(false)).is_err());
        assert!(DataType::Int.cast("abc".into()).is_err());
    }

    #[test]
    fn test_float_cast() {
        assert_eq!(DataType::Float.cast(Value::Int(3)).unwrap(), Value::Float(3.0));
        assert_eq!(DataType::Float.cast(" 2.5 ".into()).unwrap(), Value::Float(2.5));
        assert!(DataType::Float.cast(Value::Bool(true)).is_err());
        assert!(DataType::Float.cast("warm".into()).is_err());
    }

    #[test]
    fn test_string_cast() {
        assert_eq!(DataType::String.cast(Value::Int(7)).unwrap(), Value::from("7"));
        assert_eq!(DataType::String.cast(Value::Bool(false)).unwrap(), Value::from("false"));
        assert!(DataType::String.cast(Value::Null).is_err());
    }

    #[test]
    fn test_json_conversion() {
        let value = Value::from(json!({"a": [1, 2.5, "x"], "b": null}));
        assert_eq!(value.get("a"), Some(&Value::List(vec![1.into(), 2.5.into(), "x".into()])));
        assert_eq!(value.to_json(), json!({"a": [1, 2.5, "x"], "b": null}));
    }

    #[test]
    fn test_numeric_equality() {
        assert_eq!(Value::Int(10), Value::Float(10.0));
        assert_ne!(Value::Int(1), Value::Bool(true));
    }

    #[test]
    fn test_payload_decoding() {
        assert_eq!(Value::from_payload(b"21.5"), Value::Float(21.5));
        assert_eq!(Value::from_payload(b"on"), Value::from("on"));
        assert_eq!(Value::from_payload(&[0xff, 0xfe]), Value::Bytes(vec![0xff, 0xfe]));
    }
}
