//! Numeric adapters: scaling, boolean tokens and IEEE-754 register pairs.

use crate::error::{Error, Result};
use crate::value::{lossless_int, Value};

use super::Codec;

/// Tolerance used to snap encoded results back to integers.
const SNAP_EPSILON: f64 = 1e-9;

/// `decode = x * factor`, `encode = x / factor`.
#[derive(Debug, Clone, PartialEq)]
pub struct Scale {
    factor: f64,
}

impl Scale {
    pub fn new(factor: f64) -> Result<Self> {
        if !factor.is_finite() || factor == 0.0 {
            return Err(Error::invalid(format!(
                "scale factor must be finite and non-zero, got {factor}"
            )));
        }
        Ok(Self { factor })
    }

    pub fn from_argument(argument: &Value) -> Result<Self> {
        let factor = match argument {
            Value::Int(i) => *i as f64,
            Value::Float(f) => *f,
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| Error::invalid(format!("invalid scale factor '{s}'")))?,
            other => {
                return Err(Error::invalid(format!(
                    "scale expects a number, got {}",
                    other.describe()
                )))
            }
        };
        Self::new(factor)
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    fn multiply(&self, raw: Value) -> Result<Value> {
        match raw {
            Value::Int(i) => match lossless_int(self.factor).and_then(|f| i.checked_mul(f)) {
                Some(product) => Ok(Value::Int(product)),
                None => Ok(Value::Float(i as f64 * self.factor)),
            },
            Value::Float(f) => Ok(Value::Float(f * self.factor)),
            Value::List(items) => items
                .into_iter()
                .map(|v| self.multiply(v))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            other => Err(Error::type_error(other.describe(), "number")),
        }
    }

    fn divide(&self, value: Value) -> Result<Value> {
        match value {
            Value::Int(_) | Value::Float(_) => {
                let quotient = value.as_f64().unwrap_or_default() / self.factor;
                let rounded = quotient.round();
                if (quotient - rounded).abs() < SNAP_EPSILON {
                    if let Some(i) = lossless_int(rounded) {
                        return Ok(Value::Int(i));
                    }
                }
                Ok(Value::Float(quotient))
            }
            Value::List(items) => items
                .into_iter()
                .map(|v| self.divide(v))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            other => Err(Error::type_error(other.describe(), "number")),
        }
    }
}

impl Codec for Scale {
    fn decode(&self, raw: Value) -> Result<Value> {
        self.multiply(raw)
    }

    fn encode(&self, value: Value) -> Result<Value> {
        self.divide(value)
    }
}

/// Maps two raw tokens (`"<false>/<true>"`) to booleans and back.
#[derive(Debug, Clone, PartialEq)]
pub struct BoolFormat {
    false_token: String,
    true_token: String,
}

impl BoolFormat {
    pub fn parse(format: &str) -> Result<Self> {
        let (f, t) = format
            .split_once('/')
            .ok_or_else(|| Error::invalid(format!("bool_format expects '<false>/<true>', got '{format}'")))?;
        let (f, t) = (f.trim(), t.trim());
        if f.is_empty() || t.is_empty() || f == t || t.contains('/') {
            return Err(Error::invalid(format!("invalid bool_format '{format}'")));
        }
        Ok(Self {
            false_token: f.to_string(),
            true_token: t.to_string(),
        })
    }

    pub fn from_argument(argument: &Value) -> Result<Self> {
        match argument {
            Value::Null => Self::parse("0/1"),
            Value::String(s) => Self::parse(s),
            other => Err(Error::invalid(format!(
                "bool_format expects a string, got {}",
                other.describe()
            ))),
        }
    }

    fn token_value(token: &str) -> Value {
        token
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::String(token.to_string()))
    }
}

impl Codec for BoolFormat {
    fn decode(&self, raw: Value) -> Result<Value> {
        let token = match &raw {
            Value::Int(_) | Value::String(_) | Value::Bool(_) => raw.to_text(),
            _ => return Err(Error::type_error(raw.describe(), "bool token")),
        };
        if token == self.true_token {
            Ok(Value::Bool(true))
        } else if token == self.false_token {
            Ok(Value::Bool(false))
        } else {
            Err(Error::type_error(raw.describe(), "bool token"))
        }
    }

    fn encode(&self, value: Value) -> Result<Value> {
        match value {
            Value::Bool(true) => Ok(Self::token_value(&self.true_token)),
            Value::Bool(false) => Ok(Self::token_value(&self.false_token)),
            other => Err(Error::type_error(other.describe(), "bool")),
        }
    }
}

/// IEEE-754 single precision spread over two 16-bit registers, high word first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Float32Registers;

impl Codec for Float32Registers {
    fn decode(&self, raw: Value) -> Result<Value> {
        let registers = match &raw {
            Value::List(items) if items.len() == 2 => items
                .iter()
                .map(|v| v.as_i64().and_then(|i| u16::try_from(i).ok()))
                .collect::<Option<Vec<u16>>>(),
            _ => None,
        }
        .ok_or_else(|| Error::invalid(format!("float32_registers expects two 16-bit registers, got {}", raw.describe())))?;

        let bits = (u32::from(registers[0]) << 16) | u32::from(registers[1]);
        Ok(Value::Float(f64::from(f32::from_bits(bits))))
    }

    fn encode(&self, value: Value) -> Result<Value> {
        let number = value
            .as_f64()
            .ok_or_else(|| Error::type_error(value.describe(), "float"))?;
        let bits = (number as f32).to_bits();
        Ok(Value::List(vec![
            Value::Int(i64::from(bits >> 16)),
            Value::Int(i64::from(bits & 0xFFFF)),
        ]))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_round_trip() {
        let scale = Scale::new(0.1).unwrap();
        assert_eq!(scale.decode(Value::Int(10)).unwrap(), Value::Float(1.0));
        assert_eq!(scale.encode(Value::Float(1.0)).unwrap(), Value::Int(10));

        let raw = Value::Int(215);
        let decoded = scale.decode(raw.clone()).unwrap();
        assert_eq!(scale.encode(decoded).unwrap(), raw);
    }

    #[test]
    fn test_integral_scale_keeps_ints() {
        let scale = Scale::new(10.0).unwrap();
        assert!(matches!(scale.decode(Value::Int(3)).unwrap(), Value::Int(30)));
        assert!(scale.decode(Value::from("3")).is_err());
    }

    #[test]
    fn test_scale_rejects_zero_and_nan() {
        assert!(Scale::new(0.0).is_err());
        assert!(Scale::new(f64::NAN).is_err());
        assert!(Scale::from_argument(&Value::from("abc")).is_err());
    }

    #[test]
    fn test_bool_format_round_trip() {
        let format = BoolFormat::parse("0/1").unwrap();
        assert_eq!(format.decode(Value::Int(1)).unwrap(), Value::Bool(true));
        assert_eq!(format.decode(Value::from("0")).unwrap(), Value::Bool(false));
        assert_eq!(format.encode(Value::Bool(true)).unwrap(), Value::Int(1));
        assert!(format.decode(Value::Int(2)).is_err());
        assert!(format.decode(Value::Float(1.0)).is_err());

        let words = BoolFormat::parse("OFF/ON").unwrap();
        assert_eq!(words.encode(Value::Bool(false)).unwrap(), Value::from("OFF"));
        assert_eq!(words.decode(Value::from("ON")).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_float32_registers_round_trip() {
        let adapter = Float32Registers;
        // 21.5f32 == 0x41AC_0000
        let registers = Value::List(vec![Value::Int(0x41AC), Value::Int(0)]);
        let decoded = adapter.decode(registers.clone()).unwrap();
        assert_eq!(decoded, Value::Float(21.5));
        assert_eq!(adapter.encode(decoded).unwrap(), registers);

        assert!(adapter.decode(Value::List(vec![Value::Int(1)])).is_err());
        assert!(adapter
            .decode(Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]))
            .is_err());
    }
}
