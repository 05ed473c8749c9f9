use std::fmt;

use serde::{Deserialize, Serialize};
use unison_core::{TransportError, TransportResult, Value};

/// MQTT topic locator.
///
/// When `request_topic` is set, reads publish `request_message` there and wait
/// for the reply on `topic`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttAddress {
    pub topic: String,
    #[serde(default)]
    pub request_topic: Option<String>,
    #[serde(default)]
    pub request_message: Option<Value>,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

impl MqttAddress {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            request_topic: None,
            request_message: None,
            qos: 0,
            retain: false,
        }
    }

    pub fn with_request(mut self, topic: impl Into<String>, message: Value) -> Self {
        self.request_topic = Some(topic.into());
        self.request_message = Some(message);
        self
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    /// MQTT addresses carry too much structure for a compact form.
    pub fn parse(input: &str) -> TransportResult<Self> {
        Err(TransportError::Unsupported(format!(
            "MQTT addresses cannot be parsed from a string ('{input}'), use a map with a 'topic'"
        )))
    }

    /// True when the topic contains `+` or `#` wildcards.
    pub fn is_wildcard(&self) -> bool {
        self.topic.split('/').any(|level| level == "+" || level == "#")
    }

    pub(super) fn validate(&self) -> TransportResult<()> {
        if self.topic.is_empty() {
            return Err(TransportError::InvalidAddress("MQTT topic is empty".into()));
        }
        if self.qos > 2 {
            return Err(TransportError::InvalidAddress(format!(
                "MQTT QoS must be 0, 1 or 2, got {}",
                self.qos
            )));
        }
        Ok(())
    }
}

impl fmt::Display for MqttAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.request_topic {
            Some(request) => write!(f, "{} (via {request})", self.topic),
            None => f.write_str(&self.topic),
        }
    }
}

/// MQTT topic filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
