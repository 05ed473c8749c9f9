//! Core types for Unison.
//!
//! This crate holds the pieces every other crate builds on: the error
//! taxonomy, the dynamic [`Value`] model with its [`DataType`] casts, the
//! value adapter pipeline, `${}` templating and the duration grammar used by
//! driver update strategies.

pub mod adapter;
pub mod config;
pub mod duration;
pub mod error;
pub mod template;
pub mod value;

pub use adapter::{compose, AdapterPipeline, AdapterSpec, Codec, ValueAdapter};
pub use duration::parse_duration;
pub use error::{Error, Result, TransportError, TransportResult};
pub use template::Context;
pub use value::{DataType, Value};
