//! Type-length-value sensor frames.
//!
//! A frame is a run of `type byte + value bytes` entries. The type table maps
//! each type byte to a field name, a value length, a scale and a signedness.
//! Parsing stops at the first unknown type byte or truncated value; whatever
//! was parsed up to that point is kept.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Error, Result};
use crate::value::Value;

use super::json::JsonPointer;
use super::Codec;

/// One entry of the type table.
#[derive(Debug, Clone, PartialEq)]
pub struct TlvField {
    pub name: String,
    pub length: usize,
    pub scale: f64,
    pub signed: bool,
}

impl TlvField {
    pub fn new(name: &str, length: usize) -> Self {
        Self {
            name: name.to_string(),
            length,
            scale: 1.0,
            signed: false,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    fn read(&self, bytes: &[u8]) -> Value {
        let raw = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        let number = if self.signed {
            let shift = 64 - (self.length as u32 * 8);
            ((raw << shift) as i64) >> shift
        } else {
            raw as i64
        };
        if self.scale == 1.0 {
            Value::Int(number)
        } else {
            Value::Float(number as f64 * self.scale)
        }
    }
}

/// Type table used when a driver does not supply one.
pub fn default_types() -> BTreeMap<u8, TlvField> {
    BTreeMap::from([
        (0x01, TlvField::new("temperature", 2).with_scale(0.1).signed()),
        (0x02, TlvField::new("humidity", 1).with_scale(0.5)),
        (0x03, TlvField::new("co2", 2)),
        (0x04, TlvField::new("light", 2)),
        (0x05, TlvField::new("battery", 1)),
    ])
}

/// Decodes a TLV frame into a map and extracts one field by pointer.
#[derive(Debug, Clone, PartialEq)]
pub struct Tlv {
    pointer: JsonPointer,
    types: BTreeMap<u8, TlvField>,
}

impl Tlv {
    pub fn new(pointer: &str, types: BTreeMap<u8, TlvField>) -> Result<Self> {
        let pointer = if pointer.is_empty() || pointer.starts_with('/') {
            pointer.to_string()
        } else {
            format!("/{pointer}")
        };
        Ok(Self {
            pointer: JsonPointer::parse(&pointer)?,
            types,
        })
    }

    /// Accepts a pointer string or `{pointer, types}` where `types` maps
    /// `"0x01"`-style keys to `{field, length, scale?, signed?}`.
    pub fn from_argument(argument: &Value) -> Result<Self> {
        match argument {
            Value::String(pointer) => Self::new(pointer, default_types()),
            Value::Map(map) => {
                let pointer = map.get("pointer").and_then(Value::as_str).unwrap_or("");
                let types = match map.get("types") {
                    None | Some(Value::Null) => default_types(),
                    Some(table) => parse_table(table)?,
                };
                Self::new(pointer, types)
            }
            other => Err(Error::invalid(format!(
                "tlv expects a pointer or {{pointer, types}}, got {}",
                other.describe()
            ))),
        }
    }

    /// Parse a frame into a field map.
    pub fn parse_frame(&self, frame: &[u8]) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        let mut offset = 0;
        while offset < frame.len() {
            let Some(field) = self.types.get(&frame[offset]) else {
                tracing::debug!(type_byte = frame[offset], offset, "Unknown TLV type, stopping");
                break;
            };
            let start = offset + 1;
            let end = start + field.length;
            if end > frame.len() {
                tracing::debug!(field = %field.name, offset, "Truncated TLV value, stopping");
                break;
            }
            fields.insert(field.name.clone(), field.read(&frame[start..end]));
            offset = end;
        }
        fields
    }
}

impl Codec for Tlv {
    fn decode(&self, raw: Value) -> Result<Value> {
        let frame = match &raw {
            Value::String(s) => STANDARD
                .decode(s.trim())
                .map_err(|e| Error::invalid(format!("invalid base64 TLV frame: {e}")))?,
            other => other
                .to_bytes()
                .ok_or_else(|| Error::type_error(other.describe(), "TLV frame"))?,
        };
        let document = Value::Map(self.parse_frame(&frame));
        self.pointer
            .get(&document)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("TLV field '{}'", self.pointer.as_str())))
    }
}

fn parse_table(table: &Value) -> Result<BTreeMap<u8, TlvField>> {
    let invalid = |why: String| Error::invalid(format!("invalid tlv type table: {why}"));
    let entries = table
        .as_map()
        .ok_or_else(|| invalid(format!("expected a map, got {}", table.describe())))?;

    let mut types = BTreeMap::new();
    for (key, entry) in entries {
        let code = match key.strip_prefix("0x").or_else(|| key.strip_prefix("0X")) {
            Some(hex) => u8::from_str_radix(hex, 16),
            None => key.parse::<u8>(),
        }
        .map_err(|_| invalid(format!("bad type byte '{key}'")))?;

        let name = entry
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(format!("type {key} has no field name")))?;
        let length = entry
            .get("length")
            .and_then(Value::as_i64)
            .filter(|l| (1..=8).contains(l))
            .ok_or_else(|| invalid(format!("type {key} needs a length between 1 and 8")))?;
        let scale = entry.get("scale").and_then(Value::as_f64).unwrap_or(1.0);
        let signed = entry.get("signed").and_then(Value::as_bool).unwrap_or(false);

        let mut field = TlvField::new(name, length as usize).with_scale(scale);
        field.signed = signed;
        types.insert(code, field);
    }
    Ok(types)
}
