use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use unison_core::{TransportError, TransportResult, Value};

const METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];

fn default_method() -> String {
    "GET".to_string()
}

/// HTTP request locator, relative to the client's base URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpAddress {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    /// Request body; `${value}` is replaced by the encoded value on writes
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl HttpAddress {
    pub fn new(method: &str, path: impl Into<String>) -> TransportResult<Self> {
        let address = Self {
            method: method.to_ascii_uppercase(),
            path: path.into(),
            body: None,
            headers: BTreeMap::new(),
        };
        address.validate()?;
        Ok(address)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// `"METHOD path"`, or a bare path for `GET`.
    pub fn parse(input: &str) -> TransportResult<Self> {
        let input = input.trim();
        match input.split_once(char::is_whitespace) {
            Some((method, path)) => Self::new(method, path.trim()),
            None => Self::new("GET", input),
        }
    }

    pub(super) fn validate(&self) -> TransportResult<()> {
        if !METHODS.contains(&self.method.as_str()) {
            return Err(TransportError::InvalidAddress(format!(
                "unsupported HTTP method '{}'",
                self.method
            )));
        }
        if self.path.is_empty() {
            return Err(TransportError::InvalidAddress("HTTP path is empty".into()));
        }
        Ok(())
    }
}

impl fmt::Display for HttpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}
