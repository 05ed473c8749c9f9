//! BACnet/IP transport.
//!
//! ReadProperty and WriteProperty as confirmed requests over UDP. One request
//! is in flight per client; replies with a stale invoke id are discarded.

pub mod codec;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info};
use unison_core::config::{defaults, transports};
use unison_core::{TransportError, TransportResult, Value};

use crate::address::{BacnetAddress, Protocol, TransportAddress};
use crate::client::{protocol_mismatch, TransportClient, TransportMetadata};
use crate::state::{ConnectionState, StateCell};
use codec::{ApplicationValue, ObjectId, Response};

fn default_port() -> u16 {
    transports::BACNET_PORT
}

fn default_timeout() -> u64 {
    defaults::TRANSPORT_TIMEOUT_SECS
}

fn default_max_apdu() -> usize {
    transports::BACNET_MAX_APDU
}

/// BACnet/IP transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BacnetConfig {
    /// Device IP address or host name
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_apdu")]
    pub max_apdu: usize,
}

impl BacnetConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            timeout: default_timeout(),
            max_apdu: default_max_apdu(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }
}

/// BACnet/IP client.
pub struct BacnetClient {
    metadata: TransportMetadata,
    config: BacnetConfig,
    state: StateCell,
    socket: Mutex<Option<UdpSocket>>,
    invoke_id: AtomicU8,
}

fn map_io(error: io::Error) -> TransportError {
    match error.kind() {
        io::ErrorKind::TimedOut => TransportError::Timeout(format!("BACnet I/O timed out: {error}")),
        _ => TransportError::Connection(format!("BACnet socket error: {error}")),
    }
}

impl BacnetClient {
    pub fn new(metadata: TransportMetadata, config: BacnetConfig) -> Self {
        let state = StateCell::new(metadata.id.clone());
        Self {
            metadata,
            config,
            state,
            socket: Mutex::new(None),
            invoke_id: AtomicU8::new(0),
        }
    }

    pub fn config(&self) -> &BacnetConfig {
        &self.config
    }

    fn next_invoke_id(&self) -> u8 {
        self.invoke_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn peer(&self) -> TransportResult<SocketAddr> {
        tokio::net::lookup_host((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| TransportError::Connection(format!("cannot resolve {}: {e}", self.config.host)))?
            .next()
            .ok_or_else(|| TransportError::Connection(format!("no address for {}", self.config.host)))
    }

    /// Send one confirmed request and wait for the matching reply.
    async fn transact(&self, build: impl FnOnce(u8) -> Vec<u8>) -> TransportResult<Response> {
        let guard = self.socket.lock().await;
        let socket = guard
            .as_ref()
            .ok_or_else(|| TransportError::Connection("BACnet client is not connected".into()))?;

        let invoke_id = self.next_invoke_id();
        let apdu = build(invoke_id);
        if apdu.len() > self.config.max_apdu {
            return Err(TransportError::Protocol(format!(
                "request of {} bytes exceeds max APDU {}",
                apdu.len(),
                self.config.max_apdu
            )));
        }
        socket
            .send(&codec::encode_frame(&apdu, true))
            .await
            .map_err(map_io)?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.timeout);
        let mut buf = vec![0u8; self.config.max_apdu + 64];
        loop {
            let len = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map_err(|_| {
                    TransportError::Timeout(format!(
                        "no BACnet reply to invoke id {invoke_id} within {}s",
                        self.config.timeout
                    ))
                })?
                .map_err(map_io)?;
            let response = codec::decode_frame(&buf[..len]).and_then(codec::decode_response);
            match response {
                Ok(response) if response.invoke_id() == invoke_id => return Ok(response),
                Ok(stale) => {
                    debug!(transport_id = %self.metadata.id, expected = invoke_id, got = stale.invoke_id(), "Discarding stale BACnet reply");
                }
                Err(e) => {
                    debug!(transport_id = %self.metadata.id, error = %e, "Discarding undecodable BACnet datagram");
                }
            }
        }
    }

    async fn after(&self, result: &TransportResult<Response>) {
        if let Err(e) = result {
            if e.is_connection() {
                self.socket.lock().await.take();
                self.state.set(ConnectionState::ConnectionError);
            }
        }
    }
}

fn object_id(address: &BacnetAddress) -> ObjectId {
    ObjectId::new(address.object_type.code(), address.instance)
}

#[async_trait]
impl TransportClient for BacnetClient {
    fn protocol(&self) -> Protocol {
        Protocol::Bacnet
    }

    fn metadata(&self) -> &TransportMetadata {
        &self.metadata
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn connect(&self) -> TransportResult<()> {
        let mut guard = self.socket.lock().await;
        if guard.is_some() && self.state.get().is_connected() {
            return Ok(());
        }
        self.state.set(ConnectionState::Connecting);

        let bound = async {
            let peer = self.peer().await?;
            let local: SocketAddr = if peer.is_ipv4() {
                SocketAddr::from(([0, 0, 0, 0], 0))
            } else {
                SocketAddr::from(([0u16; 8], 0))
            };
            let socket = UdpSocket::bind(local).await.map_err(map_io)?;
            socket.connect(peer).await.map_err(map_io)?;
            Ok::<_, TransportError>((socket, peer))
        }
        .await;

        match bound {
            Ok((socket, peer)) => {
                *guard = Some(socket);
                self.state.set(ConnectionState::Connected);
                info!(transport_id = %self.metadata.id, %peer, "BACnet/IP client ready");
                Ok(())
            }
            Err(e) => {
                self.state.set(ConnectionState::ConnectionError);
                Err(e)
            }
        }
    }

    async fn read(&self, address: &TransportAddress) -> TransportResult<Value> {
        self.ensure_connected().await?;
        let TransportAddress::Bacnet(bacnet) = address else {
            return Err(protocol_mismatch(Protocol::Bacnet, address));
        };
        let max_apdu = self.config.max_apdu;
        let result = self
            .transact(|invoke_id| codec::encode_read_property(invoke_id, object_id(bacnet), bacnet.property, max_apdu))
            .await;
        self.after(&result).await;

        match result? {
            Response::ComplexAck { value, .. } => Ok(value.into_value()),
            Response::Error { class, code, .. } => Err(TransportError::Read(format!(
                "BACnet error reading {bacnet}: class {class}, code {code}"
            ))),
            Response::Reject { reason, .. } => Err(TransportError::Protocol(format!(
                "BACnet device rejected read of {bacnet}: reason {reason}"
            ))),
            Response::Abort { reason, .. } => Err(TransportError::Protocol(format!(
                "BACnet device aborted read of {bacnet}: reason {reason}"
            ))),
            Response::SimpleAck { .. } => Err(TransportError::Protocol(
                "unexpected SimpleACK for ReadProperty".into(),
            )),
        }
    }

    async fn write(&self, address: &TransportAddress, value: Value) -> TransportResult<()> {
        self.ensure_connected().await?;
        let TransportAddress::Bacnet(bacnet) = address else {
            return Err(protocol_mismatch(Protocol::Bacnet, address));
        };
        let encoded = ApplicationValue::for_object(bacnet.object_type, &value)?;
        let max_apdu = self.config.max_apdu;
        let result = self
            .transact(|invoke_id| {
                codec::encode_write_property(
                    invoke_id,
                    object_id(bacnet),
                    bacnet.property,
                    &encoded,
                    bacnet.priority,
                    max_apdu,
                )
            })
            .await;
        self.after(&result).await;

        match result? {
            Response::SimpleAck { .. } => Ok(()),
            Response::Error { class, code, .. } => Err(TransportError::Write(format!(
                "BACnet error writing {bacnet}: class {class}, code {code}"
            ))),
            Response::Reject { reason, .. } => Err(TransportError::Protocol(format!(
                "BACnet device rejected write to {bacnet}: reason {reason}"
            ))),
            Response::Abort { reason, .. } => Err(TransportError::Protocol(format!(
                "BACnet device aborted write to {bacnet}: reason {reason}"
            ))),
            Response::ComplexAck { .. } => Err(TransportError::Protocol(
                "unexpected ComplexACK for WriteProperty".into(),
            )),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.state.set(ConnectionState::Closing);
        self.socket.lock().await.take();
        self.state.set(ConnectionState::Closed);
        Ok(())
    }
}
