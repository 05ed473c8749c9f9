//! MQTT transport.
//!
//! The client owns a background task driving the `rumqttc` event loop. Every
//! inbound publish is cached per topic, fanned out as a [`PushMessage`] to each
//! matching push subscription, and delivered to any read waiting on that
//! topic. Subscriptions are re-issued whenever the broker acknowledges a
//! (re)connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use unison_core::config::{defaults, transports};
use unison_core::{TransportError, TransportResult, Value};

use crate::address::{topic_matches, AddressId, MqttAddress, Protocol, TransportAddress};
use crate::client::{protocol_mismatch, PushMessage, TransportClient, TransportMetadata};
use crate::registry::ReadHandlerRegistry;
use crate::state::{ConnectionState, StateCell};

fn default_port() -> u16 {
    transports::MQTT_PORT
}

fn default_keep_alive() -> u64 {
    transports::MQTT_KEEP_ALIVE_SECS
}

fn default_timeout() -> u64 {
    defaults::TRANSPORT_TIMEOUT_SECS
}

fn default_clean_session() -> bool {
    true
}

/// MQTT transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client id; a random one is generated when absent
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    /// Connect and read timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

impl MqttConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            timeout: default_timeout(),
            clean_session: true,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

struct Session {
    client: AsyncClient,
    task: JoinHandle<()>,
}

/// State shared between the client and its event loop task.
struct Shared {
    transport_id: String,
    state: StateCell,
    /// Push subscriptions: address id → (topic filter, qos)
    subscriptions: Mutex<HashMap<AddressId, (String, QoS)>>,
    /// Filters that reads are waiting on: address id → topic filter
    read_filters: Mutex<HashMap<AddressId, String>>,
    /// Filters currently subscribed on the broker
    subscribed: Mutex<HashSet<String>>,
    /// Last payload seen per concrete topic
    cache: Mutex<HashMap<String, Value>>,
    read_handlers: ReadHandlerRegistry,
    push_tx: broadcast::Sender<PushMessage>,
}

impl Shared {
    fn handle_publish(&self, topic: &str, payload: &[u8]) {
        let value = Value::from_payload(payload);
        debug!(transport_id = %self.transport_id, topic, bytes = payload.len(), "MQTT message received");
        self.cache.lock().insert(topic.to_string(), value.clone());

        let matched: Vec<AddressId> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|(_, (filter, _))| topic_matches(filter, topic))
            .map(|(id, _)| id.clone())
            .collect();
        for address_id in matched {
            // No receivers is fine: nobody is listening yet.
            let _ = self.push_tx.send(PushMessage {
                address_id,
                topic: topic.to_string(),
                payload: value.clone(),
            });
        }

        let waiting: Vec<AddressId> = self
            .read_filters
            .lock()
            .iter()
            .filter(|(_, filter)| topic_matches(filter, topic))
            .map(|(id, _)| id.clone())
            .collect();
        for address_id in waiting {
            self.read_handlers.resolve(&address_id, &value);
        }
    }

    fn resubscribe(&self, client: &AsyncClient) {
        let mut filters: HashMap<String, QoS> = self
            .subscriptions
            .lock()
            .values()
            .map(|(filter, qos)| (filter.clone(), *qos))
            .collect();
        for filter in self.read_filters.lock().values() {
            filters.entry(filter.clone()).or_insert(QoS::AtLeastOnce);
        }

        let mut subscribed = self.subscribed.lock();
        subscribed.clear();
        for (filter, qos) in filters {
            match client.try_subscribe(filter.clone(), qos) {
                Ok(()) => {
                    subscribed.insert(filter);
                }
                Err(e) => {
                    warn!(transport_id = %self.transport_id, filter = %filter, error = %e, "Failed to re-subscribe");
                }
            }
        }
    }
}

/// A read waiting for the next message on its filter.
///
/// Dropping it withdraws the filter unless another read still waits on the
/// same address, whichever way the read ended.
struct PendingRead {
    shared: Arc<Shared>,
    address_id: AddressId,
    rx: Option<oneshot::Receiver<Value>>,
}

impl Shared {
    fn begin_read(self: &Arc<Self>, address_id: AddressId, filter: String) -> PendingRead {
        self.read_filters.lock().insert(address_id.clone(), filter);
        let rx = self.read_handlers.register(address_id.clone());
        PendingRead {
            shared: self.clone(),
            address_id,
            rx: Some(rx),
        }
    }
}

impl Drop for PendingRead {
    fn drop(&mut self) {
        self.rx.take();
        self.shared.read_handlers.prune();
        if self.shared.read_handlers.pending(&self.address_id) == 0 {
            self.shared.read_filters.lock().remove(&self.address_id);
        }
    }
}

async fn run_event_loop(shared: Arc<Shared>, client: AsyncClient, mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(transport_id = %shared.transport_id, "MQTT connection acknowledged");
                shared.state.set(ConnectionState::Connected);
                shared.resubscribe(&client);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                shared.handle_publish(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                if matches!(
                    shared.state.get(),
                    ConnectionState::Closing | ConnectionState::Closed
                ) {
                    break;
                }
                warn!(transport_id = %shared.transport_id, error = %e, "MQTT event loop error");
                shared.state.set(ConnectionState::ConnectionError);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    debug!(transport_id = %shared.transport_id, "MQTT event loop stopped");
}

/// MQTT publish/subscribe client.
pub struct MqttClient {
    metadata: TransportMetadata,
    config: MqttConfig,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl MqttClient {
    pub fn new(metadata: TransportMetadata, config: MqttConfig) -> Self {
        let (push_tx, _) = broadcast::channel(defaults::PUSH_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            transport_id: metadata.id.clone(),
            state: StateCell::new(metadata.id.clone()),
            subscriptions: Mutex::new(HashMap::new()),
            read_filters: Mutex::new(HashMap::new()),
            subscribed: Mutex::new(HashSet::new()),
            cache: Mutex::new(HashMap::new()),
            read_handlers: ReadHandlerRegistry::new(),
            push_tx,
        });
        Self {
            metadata,
            config,
            shared,
            session: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout)
    }

    fn client(&self) -> TransportResult<AsyncClient> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or_else(|| TransportError::Connection("MQTT client is not connected".into()))
    }

    fn options(&self) -> MqttOptions {
        let client_id = self.config.client_id.clone().unwrap_or_else(|| {
            format!("unison-{}-{}", self.metadata.id, uuid::Uuid::new_v4().simple())
        });
        let mut options = MqttOptions::new(client_id, self.config.host.clone(), self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive.max(5)));
        options.set_clean_session(self.config.clean_session);
        if let Some(username) = &self.config.username {
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }
        options
    }

    async fn ensure_subscribed(&self, filter: &str, qos: QoS) -> TransportResult<()> {
        if self.shared.subscribed.lock().contains(filter) {
            return Ok(());
        }
        self.client()?
            .subscribe(filter.to_string(), qos)
            .await
            .map_err(|e| TransportError::Connection(format!("MQTT subscribe to '{filter}' failed: {e}")))?;
        self.shared.subscribed.lock().insert(filter.to_string());
        Ok(())
    }

    async fn await_reply(&self, address: &MqttAddress, pending: &mut PendingRead) -> TransportResult<Value> {
        let closed = || TransportError::Read(format!("MQTT reply channel for '{}' closed", address.topic));
        let rx = pending.rx.take().ok_or_else(closed)?;
        match tokio::time::timeout(self.timeout(), rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(closed()),
            Err(_) => Err(TransportError::Timeout(format!(
                "no MQTT message on '{}' within {}s",
                address.topic, self.config.timeout
            ))),
        }
    }

    fn filter_in_use(&self, filter: &str) -> bool {
        self.shared
            .subscriptions
            .lock()
            .values()
            .any(|(f, _)| f == filter)
            || self.shared.read_filters.lock().values().any(|f| f == filter)
    }
}

#[async_trait]
impl TransportClient for MqttClient {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn metadata(&self) -> &TransportMetadata {
        &self.metadata
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    async fn connect(&self) -> TransportResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.shared.state.get().is_connected() {
            return Ok(());
        }
        self.shared.state.set(ConnectionState::Connecting);
        if let Some(stale) = self.session.lock().take() {
            stale.task.abort();
        }
        self.shared.subscribed.lock().clear();

        let (client, eventloop) = AsyncClient::new(self.options(), 64);
        let task = tokio::spawn(run_event_loop(self.shared.clone(), client.clone(), eventloop));
        *self.session.lock() = Some(Session { client, task });

        let outcome = self
            .shared
            .state
            .wait_for(self.timeout(), |s| {
                matches!(s, ConnectionState::Connected | ConnectionState::ConnectionError)
            })
            .await;
        if outcome == Some(ConnectionState::Connected) {
            info!(
                transport_id = %self.metadata.id,
                broker = %format!("{}:{}", self.config.host, self.config.port),
                "Connected to MQTT broker"
            );
            return Ok(());
        }

        if let Some(session) = self.session.lock().take() {
            session.task.abort();
        }
        self.shared.state.set(ConnectionState::ConnectionError);
        Err(TransportError::Connection(format!(
            "Failed to connect to MQTT broker {}:{}",
            self.config.host, self.config.port
        )))
    }

    async fn read(&self, address: &TransportAddress) -> TransportResult<Value> {
        self.ensure_connected().await?;
        let TransportAddress::Mqtt(mqtt) = address else {
            return Err(protocol_mismatch(Protocol::Mqtt, address));
        };
        let address_id = address.id();

        if mqtt.request_topic.is_none() && !mqtt.is_wildcard() {
            if let Some(value) = self.shared.cache.lock().get(&mqtt.topic).cloned() {
                return Ok(value);
            }
        }

        let mut pending = self.shared.begin_read(address_id, mqtt.topic.clone());
        self.ensure_subscribed(&mqtt.topic, qos(mqtt.qos)).await?;

        if let Some(request_topic) = &mqtt.request_topic {
            let payload = mqtt
                .request_message
                .as_ref()
                .map(Value::to_payload)
                .unwrap_or_default();
            self.client()?
                .publish(request_topic.clone(), qos(mqtt.qos), false, payload)
                .await
                .map_err(|e| TransportError::Read(format!("MQTT request publish failed: {e}")))?;
        }

        self.await_reply(mqtt, &mut pending).await
    }

    async fn write(&self, address: &TransportAddress, value: Value) -> TransportResult<()> {
        self.ensure_connected().await?;
        let TransportAddress::Mqtt(mqtt) = address else {
            return Err(protocol_mismatch(Protocol::Mqtt, address));
        };
        if mqtt.is_wildcard() {
            return Err(TransportError::InvalidAddress(format!(
                "cannot publish to wildcard topic '{}'",
                mqtt.topic
            )));
        }
        self.client()?
            .publish(mqtt.topic.clone(), qos(mqtt.qos), mqtt.retain, value.to_payload())
            .await
            .map_err(|e| TransportError::Write(format!("MQTT publish failed: {e}")))
    }

    async fn close(&self) -> TransportResult<()> {
        self.shared.state.set(ConnectionState::Closing);
        let session = self.session.lock().take();
        if let Some(session) = session {
            if let Err(e) = session.client.disconnect().await {
                debug!(transport_id = %self.metadata.id, error = %e, "MQTT disconnect failed");
            }
            session.task.abort();
            let _ = session.task.await;
        }
        self.shared.subscribed.lock().clear();
        self.shared.state.set(ConnectionState::Closed);
        Ok(())
    }

    fn supports_push(&self) -> bool {
        true
    }

    /// The subscription is recorded before connecting, so if the broker is
    /// unreachable now it is still issued after the next successful connect.
    async fn subscribe(&self, address: &TransportAddress) -> TransportResult<AddressId> {
        let TransportAddress::Mqtt(mqtt) = address else {
            return Err(protocol_mismatch(Protocol::Mqtt, address));
        };
        let address_id = address.id();
        self.shared
            .subscriptions
            .lock()
            .insert(address_id.clone(), (mqtt.topic.clone(), qos(mqtt.qos)));
        self.ensure_connected().await?;
        self.ensure_subscribed(&mqtt.topic, qos(mqtt.qos)).await?;
        debug!(transport_id = %self.metadata.id, topic = %mqtt.topic, address_id = %address_id, "MQTT push subscription added");
        Ok(address_id)
    }

    async fn unsubscribe(&self, address: &TransportAddress) -> TransportResult<()> {
        let TransportAddress::Mqtt(mqtt) = address else {
            return Err(protocol_mismatch(Protocol::Mqtt, address));
        };
        self.shared.subscriptions.lock().remove(&address.id());
        if self.filter_in_use(&mqtt.topic) || !self.shared.subscribed.lock().contains(&mqtt.topic) {
            return Ok(());
        }
        self.shared.subscribed.lock().remove(&mqtt.topic);
        if let Ok(client) = self.client() {
            client
                .unsubscribe(mqtt.topic.clone())
                .await
                .map_err(|e| TransportError::Connection(format!("MQTT unsubscribe failed: {e}")))?;
        }
        Ok(())
    }

    fn messages(&self) -> Option<broadcast::Receiver<PushMessage>> {
        Some(self.shared.push_tx.subscribe())
    }
}
