//! Byte-level adapters for binary device protocols.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Error, Result};
use crate::value::Value;

use super::Codec;

/// Python-style `start:stop[:step]` slice.
///
/// Negative indices count from the end and out-of-range bounds are clamped,
/// so slicing never fails once the spec has been parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    start: Option<i64>,
    stop: Option<i64>,
    step: i64,
}

impl Slice {
    pub fn parse(spec: &str) -> Result<Self> {
        let malformed = || Error::invalid(format!("malformed slice '{spec}'"));
        let parts: Vec<&str> = spec.split(':').collect();
        if spec.trim().is_empty() || !(2..=3).contains(&parts.len()) {
            return Err(malformed());
        }
        let bound = |part: &str| -> Result<Option<i64>> {
            let part = part.trim();
            if part.is_empty() {
                Ok(None)
            } else {
                part.parse().map(Some).map_err(|_| malformed())
            }
        };
        let start = bound(parts[0])?;
        let stop = bound(parts[1])?;
        let step = match parts.get(2) {
            Some(part) => bound(part)?.unwrap_or(1),
            None => 1,
        };
        if step == 0 {
            return Err(Error::invalid(format!("slice step cannot be zero in '{spec}'")));
        }
        Ok(Self { start, stop, step })
    }

    /// Indices selected from a sequence of length `len`.
    pub fn indices(&self, len: usize) -> Vec<usize> {
        let len = len as i64;
        let (lower, upper) = if self.step > 0 { (0, len) } else { (-1, len - 1) };
        let clamp = |bound: i64| {
            if bound < 0 {
                (bound + len).max(lower)
            } else {
                bound.min(upper)
            }
        };
        let start = self
            .start
            .map(clamp)
            .unwrap_or(if self.step > 0 { lower } else { upper });
        let stop = self
            .stop
            .map(clamp)
            .unwrap_or(if self.step > 0 { upper } else { lower });

        let mut out = Vec::new();
        let mut i = start;
        while (self.step > 0 && i < stop) || (self.step < 0 && i > stop) {
            out.push(i as usize);
            i += self.step;
        }
        out
    }

    fn pick<T: Clone>(&self, items: &[T]) -> Vec<T> {
        self.indices(items.len())
            .into_iter()
            .map(|i| items[i].clone())
            .collect()
    }

    /// Slice treating strings as their UTF-8 bytes.
    pub(super) fn decode_bytes(&self, raw: Value) -> Result<Value> {
        let bytes = match raw {
            Value::String(s) => s.into_bytes(),
            other => other
                .to_bytes()
                .ok_or_else(|| Error::type_error(other.describe(), "bytes"))?,
        };
        Ok(Value::Bytes(self.pick(&bytes)))
    }
}

impl Codec for Slice {
    fn decode(&self, raw: Value) -> Result<Value> {
        match raw {
            Value::Bytes(b) => Ok(Value::Bytes(self.pick(&b))),
            Value::List(items) => Ok(Value::List(self.pick(&items))),
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(Value::String(self.pick(&chars).into_iter().collect()))
            }
            other => Err(Error::type_error(other.describe(), "sequence")),
        }
    }
}

/// Fixed-header frame: one payload byte behind a constant prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteFrame {
    index: usize,
    prefix: Vec<u8>,
}

impl ByteFrame {
    pub fn new(index: usize, prefix_hex: &str) -> Result<Self> {
        let prefix = hex::decode(prefix_hex.trim())
            .map_err(|e| Error::invalid(format!("invalid byte_frame prefix '{prefix_hex}': {e}")))?;
        Ok(Self { index, prefix })
    }

    /// Accepts `"<index>:<hexPrefix>"` or `[index, "hexPrefix"]`.
    pub fn from_argument(argument: &Value) -> Result<Self> {
        let invalid = || {
            Error::invalid(format!(
                "byte_frame expects '<index>:<hexPrefix>', got {}",
                argument.describe()
            ))
        };
        match argument {
            Value::String(s) => {
                let (index, prefix) = s.split_once(':').unwrap_or((s.as_str(), ""));
                let index = index.trim().parse::<usize>().map_err(|_| invalid())?;
                Self::new(index, prefix)
            }
            Value::List(items) if items.len() == 2 => {
                let index = items[0]
                    .as_i64()
                    .and_then(|i| usize::try_from(i).ok())
                    .ok_or_else(invalid)?;
                let prefix = items[1].as_str().ok_or_else(invalid)?;
                Self::new(index, prefix)
            }
            _ => Err(invalid()),
        }
    }
}

impl Codec for ByteFrame {
    fn decode(&self, raw: Value) -> Result<Value> {
        let bytes = raw
            .to_bytes()
            .ok_or_else(|| Error::type_error(raw.describe(), "bytes"))?;
        bytes
            .get(self.index)
            .map(|b| Value::Int(i64::from(*b)))
            .ok_or_else(|| {
                Error::invalid(format!(
                    "byte_frame index {} out of range for {} bytes",
                    self.index,
                    bytes.len()
                ))
            })
    }

    fn encode(&self, value: Value) -> Result<Value> {
        let byte = value
            .as_i64()
            .and_then(|i| u8::try_from(i).ok())
            .ok_or_else(|| Error::type_error(value.describe(), "byte"))?;
        let mut frame = self.prefix.clone();
        frame.push(byte);
        Ok(Value::Bytes(frame))
    }
}

/// Fixed-width integer with explicit signedness and endianness (`u16be`, `i32le`, `u8`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteConvert {
    width: usize,
    signed: bool,
    little_endian: bool,
}

impl ByteConvert {
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || Error::invalid(format!("invalid byte_convert type '{spec}'"));
        let lower = spec.trim().to_ascii_lowercase();
        let (signed, rest) = if let Some(rest) = lower.strip_prefix('u') {
            (false, rest)
        } else if let Some(rest) = lower.strip_prefix('i') {
            (true, rest)
        } else {
            return Err(invalid());
        };
        let (bits, little_endian) = if let Some(bits) = rest.strip_suffix("le") {
            (bits, true)
        } else if let Some(bits) = rest.strip_suffix("be") {
            (bits, false)
        } else {
            (rest, false)
        };
        let width = match bits {
            "8" => 1,
            "16" => 2,
            "32" => 4,
            "64" => 8,
            _ => return Err(invalid()),
        };
        Ok(Self {
            width,
            signed,
            little_endian,
        })
    }

    fn type_name(&self) -> String {
        format!(
            "{}{}{}",
            if self.signed { "i" } else { "u" },
            self.width * 8,
            if self.little_endian { "le" } else { "be" }
        )
    }
}

impl Codec for ByteConvert {
    fn decode(&self, raw: Value) -> Result<Value> {
        let mut bytes = raw
            .to_bytes()
            .ok_or_else(|| Error::type_error(raw.describe(), "bytes"))?;
        if bytes.len() != self.width {
            return Err(Error::invalid(format!(
                "{} needs exactly {} bytes, got {}",
                self.type_name(),
                self.width,
                bytes.len()
            )));
        }
        if self.little_endian {
            bytes.reverse();
        }
        let mut buf = [0u8; 8];
        buf[8 - self.width..].copy_from_slice(&bytes);
        let unsigned = u64::from_be_bytes(buf);

        if self.signed {
            let shift = 64 - self.width as u32 * 8;
            Ok(Value::Int(((unsigned << shift) as i64) >> shift))
        } else {
            i64::try_from(unsigned)
                .map(Value::Int)
                .map_err(|_| Error::invalid(format!("{unsigned} does not fit in a signed 64-bit value")))
        }
    }

    fn encode(&self, value: Value) -> Result<Value> {
        let number = value
            .as_i64()
            .ok_or_else(|| Error::type_error(value.describe(), self.type_name()))?;
        let bits = self.width as u32 * 8;
        let in_range = if self.signed {
            bits == 64 || (number >= -(1i64 << (bits - 1)) && number < (1i64 << (bits - 1)))
        } else {
            number >= 0 && (bits == 64 || number < (1i64 << bits))
        };
        if !in_range {
            return Err(Error::type_error(number, self.type_name()));
        }
        let full = (number as u64).to_be_bytes();
        let mut bytes = full[8 - self.width..].to_vec();
        if self.little_endian {
            bytes.reverse();
        }
        Ok(Value::Bytes(bytes))
    }
}

/// Base64 text on the wire; bytes or UTF-8 text in the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Base64Codec {
    utf8: bool,
}

impl Base64Codec {
    pub fn from_argument(argument: &Value) -> Result<Self> {
        match argument {
            Value::Null => Ok(Self { utf8: false }),
            Value::String(s) if s == "bytes" => Ok(Self { utf8: false }),
            Value::String(s) if s == "utf8" || s == "utf-8" || s == "string" => Ok(Self { utf8: true }),
            other => Err(Error::invalid(format!(
                "base64 expects \"bytes\" or \"utf8\", got {}",
                other.describe()
            ))),
        }
    }
}

impl Codec for Base64Codec {
    fn decode(&self, raw: Value) -> Result<Value> {
        let text = match &raw {
            Value::String(s) => s.trim().to_string(),
            Value::Bytes(b) => String::from_utf8_lossy(b).trim().to_string(),
            _ => return Err(Error::type_error(raw.describe(), "base64 string")),
        };
        let bytes = STANDARD
            .decode(text.as_bytes())
            .map_err(|e| Error::invalid(format!("invalid base64: {e}")))?;
        if self.utf8 {
            String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|e| Error::invalid(format!("base64 payload is not UTF-8: {e}")))
        } else {
            Ok(Value::Bytes(bytes))
        }
    }

    fn encode(&self, value: Value) -> Result<Value> {
        let bytes = match value {
            Value::String(s) => s.into_bytes(),
            other => other
                .to_bytes()
                .ok_or_else(|| Error::type_error(other.describe(), "bytes"))?,
        };
        Ok(Value::String(STANDARD.encode(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(b: &[u8]) -> Value {
        Value::Bytes(b.to_vec())
    }

    #[test]
    fn test_slice_python_semantics() {
        let data = bytes(&[0, 1, 2, 3, 4, 5]);
        let decode = |spec: &str| Slice::parse(spec).unwrap().decode(data.clone()).unwrap();
        assert_eq!(decode("1:3"), bytes(&[1, 2]));
        assert_eq!(decode("-2:"), bytes(&[4, 5]));
        assert_eq!(decode("::2"), bytes(&[0, 2, 4]));
        assert_eq!(decode("::-1"), bytes(&[5, 4, 3, 2, 1, 0]));
        assert_eq!(decode("4:100"), bytes(&[4, 5]));
        assert_eq!(decode("10:20"), bytes(&[]));

        let text = Slice::parse("0:3").unwrap().decode("héllo".into()).unwrap();
        assert_eq!(text, Value::from("hél"));
    }

    #[test]
    fn test_slice_rejects_malformed_specs() {
        for bad in ["", "3", "a:b", "1:2:0", "1:2:3:4"] {
            assert!(Slice::parse(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn test_byte_frame_round_trip() {
        let frame = ByteFrame::from_argument(&Value::from("2:a55a")).unwrap();
        let raw = bytes(&[0xa5, 0x5a, 0x07]);
        let decoded = frame.decode(raw.clone()).unwrap();
        assert_eq!(decoded, Value::Int(7));
        assert_eq!(frame.encode(decoded).unwrap(), raw);

        assert!(frame.decode(bytes(&[0xa5])).is_err());
        assert!(frame.encode(Value::Int(256)).is_err());

        let listed = Value::List(vec![Value::Int(2), Value::from("a55a")]);
        assert_eq!(ByteFrame::from_argument(&listed).unwrap(), frame);
    }

    #[test]
    fn test_byte_convert() {
        let u16be = ByteConvert::parse("u16be").unwrap();
        assert_eq!(u16be.decode(bytes(&[0x01, 0x02])).unwrap(), Value::Int(258));
        assert_eq!(u16be.encode(Value::Int(258)).unwrap(), bytes(&[0x01, 0x02]));
        assert!(u16be.decode(bytes(&[0x01])).is_err());
        assert!(u16be.encode(Value::Int(70_000)).is_err());

        let i16le = ByteConvert::parse("i16le").unwrap();
        assert_eq!(i16le.decode(bytes(&[0xFE, 0xFF])).unwrap(), Value::Int(-2));
        assert_eq!(i16le.encode(Value::Int(-2)).unwrap(), bytes(&[0xFE, 0xFF]));

        assert_eq!(ByteConvert::parse("i8").unwrap().decode(bytes(&[0x80])).unwrap(), Value::Int(-128));
    }

    #[test]
    fn test_base64_round_trip() {
        let codec = Base64Codec::from_argument(&Value::from("utf8")).unwrap();
        let decoded = codec.decode("aGVsbG8=".into()).unwrap();
        assert_eq!(decoded, Value::from("hello"));
        assert_eq!(codec.encode(decoded).unwrap(), Value::from("aGVsbG8="));

        let raw = Base64Codec::from_argument(&Value::Null).unwrap();
        assert_eq!(raw.decode("AQI=".into()).unwrap(), bytes(&[1, 2]));
        assert_eq!(raw.encode(bytes(&[1, 2])).unwrap(), Value::from("AQI="));
    }
}
