//! Bidirectional value adapters.
//!
//! An adapter turns a raw wire value into a domain value (`decode`) and back
//! (`encode`). Adapters are pure: the same input always decodes to the same
//! output. They are chained into an [`AdapterPipeline`], which decodes
//! left-to-right and encodes right-to-left.
//!
//! Every built-in adapter is constructed from a single argument and validates
//! it eagerly, so a bad driver definition fails at load time rather than on
//! the first poll.

mod bytes;
mod json;
mod numeric;
mod tlv;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::Value;

pub use bytes::{Base64Codec, ByteConvert, ByteFrame, Slice};
pub use json::{JsonPath, JsonPointer};
pub use numeric::{BoolFormat, Float32Registers, Scale};
pub use tlv::{Tlv, TlvField};

/// Shared contract of every adapter.
pub trait Codec {
    /// Raw wire value to domain value.
    fn decode(&self, raw: Value) -> Result<Value>;

    /// Domain value to raw wire value. Defaults to passthrough.
    fn encode(&self, value: Value) -> Result<Value> {
        Ok(value)
    }
}

/// One adapter in a pipeline, as named in driver definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub name: String,
    #[serde(default)]
    pub argument: Value,
}

impl AdapterSpec {
    pub fn new(name: impl Into<String>, argument: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            argument: argument.into(),
        }
    }
}

/// Names accepted by [`ValueAdapter::build`].
pub const ADAPTER_NAMES: &[&str] = &[
    "identity",
    "scale",
    "json_pointer",
    "json_path",
    "bool_format",
    "slice",
    "byte_slice",
    "byte_frame",
    "byte_convert",
    "float32_registers",
    "base64",
    "tlv",
];

/// Closed set of built-in adapters.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueAdapter {
    Identity,
    Scale(Scale),
    JsonPointer(JsonPointer),
    JsonPath(JsonPath),
    BoolFormat(BoolFormat),
    Slice(Slice),
    ByteSlice(Slice),
    ByteFrame(ByteFrame),
    ByteConvert(ByteConvert),
    Float32Registers(Float32Registers),
    Base64(Base64Codec),
    Tlv(Tlv),
}

impl ValueAdapter {
    /// Build an adapter from its name and argument.
    pub fn build(name: &str, argument: &Value) -> Result<Self> {
        let adapter = match name {
            "identity" => Self::Identity,
            "scale" => Self::Scale(Scale::from_argument(argument)?),
            "json_pointer" => Self::JsonPointer(JsonPointer::parse(string_argument(name, argument)?)?),
            "json_path" => Self::JsonPath(JsonPath::parse(string_argument(name, argument)?)?),
            "bool_format" => Self::BoolFormat(BoolFormat::from_argument(argument)?),
            "slice" => Self::Slice(Slice::parse(string_argument(name, argument)?)?),
            "byte_slice" => Self::ByteSlice(Slice::parse(string_argument(name, argument)?)?),
            "byte_frame" => Self::ByteFrame(ByteFrame::from_argument(argument)?),
            "byte_convert" => Self::ByteConvert(ByteConvert::parse(string_argument(name, argument)?)?),
            "float32_registers" => Self::Float32Registers(Float32Registers),
            "base64" => Self::Base64(Base64Codec::from_argument(argument)?),
            "tlv" => Self::Tlv(Tlv::from_argument(argument)?),
            other => return Err(Error::invalid(format!("unsupported adapter '{other}'"))),
        };
        Ok(adapter)
    }

    /// Build from an [`AdapterSpec`].
    pub fn from_spec(spec: &AdapterSpec) -> Result<Self> {
        Self::build(&spec.name, &spec.argument)
    }

    /// Registered name of the adapter.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Scale(_) => "scale",
            Self::JsonPointer(_) => "json_pointer",
            Self::JsonPath(_) => "json_path",
            Self::BoolFormat(_) => "bool_format",
            Self::Slice(_) => "slice",
            Self::ByteSlice(_) => "byte_slice",
            Self::ByteFrame(_) => "byte_frame",
            Self::ByteConvert(_) => "byte_convert",
            Self::Float32Registers(_) => "float32_registers",
            Self::Base64(_) => "base64",
            Self::Tlv(_) => "tlv",
        }
    }

    fn codec(&self) -> &dyn Codec {
        match self {
            Self::Identity => &IDENTITY,
            Self::Scale(a) => a,
            Self::JsonPointer(a) => a,
            Self::JsonPath(a) => a,
            Self::BoolFormat(a) => a,
            Self::Slice(a) => a,
            Self::ByteSlice(a) => a,
            Self::ByteFrame(a) => a,
            Self::ByteConvert(a) => a,
            Self::Float32Registers(a) => a,
            Self::Base64(a) => a,
            Self::Tlv(a) => a,
        }
    }

    pub fn decode(&self, raw: Value) -> Result<Value> {
        match self {
            Self::ByteSlice(slice) => slice.decode_bytes(raw),
            other => other.codec().decode(raw),
        }
    }

    pub fn encode(&self, value: Value) -> Result<Value> {
        self.codec().encode(value)
    }
}

impl fmt::Display for ValueAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct Identity;

const IDENTITY: Identity = Identity;

impl Codec for Identity {
    fn decode(&self, raw: Value) -> Result<Value> {
        Ok(raw)
    }
}

fn string_argument<'a>(adapter: &str, argument: &'a Value) -> Result<&'a str> {
    argument.as_str().ok_or_else(|| {
        Error::invalid(format!(
            "adapter '{adapter}' expects a string argument, got {}",
            argument.describe()
        ))
    })
}

/// Ordered chain of adapters. The empty pipeline is the identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterPipeline {
    stages: Vec<ValueAdapter>,
}

impl AdapterPipeline {
    /// The identity pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every stage from `(name, argument)` specs, failing on the first
    /// invalid one.
    pub fn from_specs(specs: &[AdapterSpec]) -> Result<Self> {
        let stages = specs
            .iter()
            .map(ValueAdapter::from_spec)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { stages })
    }

    /// Append a stage.
    pub fn then(mut self, adapter: ValueAdapter) -> Self {
        self.stages.push(adapter);
        self
    }

    /// Pipeline that decodes through `self` and then `next`.
    pub fn compose(&self, next: &AdapterPipeline) -> Self {
        compose(self, next)
    }

    pub fn stages(&self) -> &[ValueAdapter] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn decode(&self, raw: Value) -> Result<Value> {
        self.stages
            .iter()
            .try_fold(raw, |value, stage| stage.decode(value))
    }

    pub fn encode(&self, value: Value) -> Result<Value> {
        self.stages
            .iter()
            .rev()
            .try_fold(value, |value, stage| stage.encode(value))
    }
}

impl From<ValueAdapter> for AdapterPipeline {
    fn from(adapter: ValueAdapter) -> Self {
        Self {
            stages: vec![adapter],
        }
    }
}

impl FromIterator<ValueAdapter> for AdapterPipeline {
    fn from_iter<I: IntoIterator<Item = ValueAdapter>>(iter: I) -> Self {
        Self {
            stages: iter.into_iter().collect(),
        }
    }
}

/// `decode = b.decode(a.decode(x))`, `encode = a.encode(b.encode(x))`.
pub fn compose(a: &AdapterPipeline, b: &AdapterPipeline) -> AdapterPipeline {
    a.stages.iter().chain(b.stages.iter()).cloned().collect()
}
