//! HTTP transport.
//!
//! One request per read or write against `base_url` + the address path.
//! Reads return the parsed JSON body, or the body text when it is not JSON.
//! Writes send the address body with `${value}` replaced by the encoded value,
//! or the value itself as JSON when the address has no body.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use unison_core::config::defaults;
use unison_core::template::{self, Context};
use unison_core::{TransportError, TransportResult, Value};

use crate::address::{HttpAddress, Protocol, TransportAddress};
use crate::client::{protocol_mismatch, TransportClient, TransportMetadata};
use crate::state::{ConnectionState, StateCell};

fn default_timeout() -> u64 {
    defaults::TRANSPORT_TIMEOUT_SECS
}

fn default_verify_tls() -> bool {
    true
}

/// HTTP transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Base URL every address path is joined to
    pub base_url: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Bearer token for the `Authorization` header
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

impl HttpConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: default_timeout(),
            headers: BTreeMap::new(),
            bearer_token: None,
            verify_tls: true,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }
}

/// HTTP request/response client.
pub struct HttpClient {
    metadata: TransportMetadata,
    config: HttpConfig,
    state: StateCell,
    client: Mutex<Option<Client>>,
}

impl HttpClient {
    pub fn new(metadata: TransportMetadata, config: HttpConfig) -> Self {
        let state = StateCell::new(metadata.id.clone());
        Self {
            metadata,
            config,
            state,
            client: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn http(&self) -> TransportResult<Client> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Connection("HTTP client is not connected".into()))
    }

    async fn send(
        &self,
        address: &HttpAddress,
        body: Option<Value>,
        write: bool,
    ) -> TransportResult<reqwest::Response> {
        let client = self.http()?;
        let method = reqwest::Method::from_bytes(address.method.as_bytes())
            .map_err(|_| TransportError::InvalidAddress(format!("bad HTTP method '{}'", address.method)))?;

        let mut request = client
            .request(method, self.url(&address.path))
            .timeout(Duration::from_secs(self.config.timeout));

        for (key, value) in self.config.headers.iter().chain(address.headers.iter()) {
            request = request.header(key, value);
        }
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }
        request = match body {
            Some(Value::String(text)) => request.body(text),
            Some(Value::Bytes(bytes)) => request.body(bytes),
            Some(other) => request.json(&other.to_json()),
            None => request,
        };

        request.send().await.map_err(|e| classify(e, write))
    }
}

fn classify(error: reqwest::Error, write: bool) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(format!("HTTP request timed out: {error}"))
    } else if error.is_connect() {
        TransportError::Connection(format!("HTTP request failed: {error}"))
    } else if error.is_decode() || error.is_body() {
        TransportError::Protocol(format!("HTTP body error: {error}"))
    } else if write {
        TransportError::Write(format!("HTTP request failed: {error}"))
    } else {
        TransportError::Read(format!("HTTP request failed: {error}"))
    }
}

fn parse_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    Value::from_payload(bytes)
}

#[async_trait]
impl TransportClient for HttpClient {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn metadata(&self) -> &TransportMetadata {
        &self.metadata
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn connect(&self) -> TransportResult<()> {
        if self.state.get().is_connected() {
            return Ok(());
        }
        self.state.set(ConnectionState::Connecting);
        let built = Client::builder()
            .timeout(Duration::from_secs(self.config.timeout))
            .danger_accept_invalid_certs(!self.config.verify_tls)
            .build();
        match built {
            Ok(client) => {
                *self.client.lock() = Some(client);
                self.state.set(ConnectionState::Connected);
                debug!(transport_id = %self.metadata.id, base_url = %self.config.base_url, "HTTP transport ready");
                Ok(())
            }
            Err(e) => {
                self.state.set(ConnectionState::ConnectionError);
                Err(TransportError::Connection(format!("Failed to build HTTP client: {e}")))
            }
        }
    }

    async fn read(&self, address: &TransportAddress) -> TransportResult<Value> {
        self.ensure_connected().await?;
        let TransportAddress::Http(address) = address else {
            return Err(protocol_mismatch(Protocol::Http, address));
        };

        let response = self.send(address, address.body.clone(), false).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Read(format!("HTTP error: {status}")));
        }
        let bytes = response.bytes().await.map_err(|e| classify(e, false))?;
        Ok(parse_body(&bytes))
    }

    async fn write(&self, address: &TransportAddress, value: Value) -> TransportResult<()> {
        self.ensure_connected().await?;
        let TransportAddress::Http(address) = address else {
            return Err(protocol_mismatch(Protocol::Http, address));
        };

        let body = match &address.body {
            Some(body) => {
                let mut context = Context::new();
                context.insert("value".to_string(), value);
                template::resolve(body, &context)
            }
            None => value,
        };
        let response = self.send(address, Some(body), true).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Write(format!("HTTP error: {status}")));
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.state.set(ConnectionState::Closing);
        self.client.lock().take();
        self.state.set(ConnectionState::Closed);
        Ok(())
    }
}
