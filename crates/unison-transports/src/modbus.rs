//! Modbus-TCP transport.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};
use unison_core::config::{defaults, transports};
use unison_core::{TransportError, TransportResult, Value};

use crate::address::{ModbusAddress, Protocol, RegisterKind, TransportAddress};
use crate::client::{protocol_mismatch, TransportClient, TransportMetadata};
use crate::state::{ConnectionState, StateCell};

fn default_port() -> u16 {
    transports::MODBUS_PORT
}

fn default_unit_id() -> u8 {
    transports::MODBUS_UNIT_ID
}

fn default_timeout() -> u64 {
    defaults::TRANSPORT_TIMEOUT_SECS
}

/// Modbus-TCP transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModbusConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Unit id used when an address does not carry its own
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Connect and request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl ModbusConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            unit_id: default_unit_id(),
            timeout: default_timeout(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }
}

/// Modbus-TCP register client.
///
/// One TCP connection per client; requests are serialized on it.
pub struct ModbusClient {
    metadata: TransportMetadata,
    config: ModbusConfig,
    state: StateCell,
    context: Mutex<Option<Context>>,
}

fn map_io(error: io::Error, write: bool) -> TransportError {
    match error.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => TransportError::Connection(format!("Modbus connection lost: {error}")),
        io::ErrorKind::TimedOut => TransportError::Timeout(format!("Modbus request timed out: {error}")),
        io::ErrorKind::InvalidData => TransportError::Protocol(format!("Modbus exception: {error}")),
        _ if write => TransportError::Write(format!("Modbus write failed: {error}")),
        _ => TransportError::Read(format!("Modbus read failed: {error}")),
    }
}

/// Register word for a value; negative ints are written as two's complement.
fn register_word(value: &Value) -> TransportResult<u16> {
    let number = match value {
        Value::Bool(b) => i64::from(*b),
        Value::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() <= 65535.0 => *f as i64,
        other => other.as_i64().ok_or_else(|| {
            TransportError::Write(format!("cannot write {} to a Modbus register", other.describe()))
        })?,
    };
    match number {
        0..=0xFFFF => Ok(number as u16),
        -0x8000..=-1 => Ok(number as i16 as u16),
        _ => Err(TransportError::Write(format!(
            "{number} does not fit in a 16-bit Modbus register"
        ))),
    }
}

fn coil_bit(value: &Value) -> TransportResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Int(0) => Ok(false),
        Value::Int(1) => Ok(true),
        other => Err(TransportError::Write(format!(
            "cannot write {} to a Modbus coil",
            other.describe()
        ))),
    }
}

fn elements<T>(
    address: &ModbusAddress,
    value: &Value,
    convert: fn(&Value) -> TransportResult<T>,
) -> TransportResult<Vec<T>> {
    let items = match value {
        Value::List(items) => items.iter().map(convert).collect::<TransportResult<Vec<_>>>()?,
        scalar => vec![convert(scalar)?],
    };
    if items.is_empty() {
        return Err(TransportError::Write("nothing to write".into()));
    }
    if address.count > 1 && items.len() != usize::from(address.count) {
        return Err(TransportError::Write(format!(
            "{address} expects {} values, got {}",
            address.count,
            items.len()
        )));
    }
    Ok(items)
}

fn registers_value(words: Vec<u16>) -> Value {
    match words.as_slice() {
        [single] => Value::Int(i64::from(*single)),
        _ => Value::List(words.into_iter().map(Value::from).collect()),
    }
}

fn bits_value(mut bits: Vec<bool>, count: u16) -> Value {
    // Coil responses are padded to whole bytes.
    bits.truncate(usize::from(count));
    match bits.as_slice() {
        [single] => Value::Bool(*single),
        _ => Value::List(bits.into_iter().map(Value::Bool).collect()),
    }
}

impl ModbusClient {
    pub fn new(metadata: TransportMetadata, config: ModbusConfig) -> Self {
        let state = StateCell::new(metadata.id.clone());
        Self {
            metadata,
            config,
            state,
            context: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ModbusConfig {
        &self.config
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout)
    }

    async fn socket_addr(&self) -> TransportResult<SocketAddr> {
        tokio::net::lookup_host((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| TransportError::Connection(format!("cannot resolve {}: {e}", self.config.host)))?
            .next()
            .ok_or_else(|| TransportError::Connection(format!("no address for {}", self.config.host)))
    }

    /// Drop the connection after a connection-class failure so the next
    /// operation reconnects.
    async fn note_failure(&self, error: &TransportError) {
        if error.is_connection() {
            warn!(transport_id = %self.metadata.id, error = %error, "Modbus connection dropped");
            self.context.lock().await.take();
            self.state.set(ConnectionState::ConnectionError);
        }
    }

    async fn read_raw(&self, address: &ModbusAddress) -> TransportResult<Value> {
        let mut guard = self.context.lock().await;
        let ctx = guard
            .as_mut()
            .ok_or_else(|| TransportError::Connection("Modbus client is not connected".into()))?;
        ctx.set_slave(Slave(address.unit.unwrap_or(self.config.unit_id)));

        let (index, count) = (address.index, address.count);
        let timed_out = || TransportError::Timeout(format!("Modbus read of {address} timed out"));
        let value = match address.kind {
            RegisterKind::Holding => registers_value(
                tokio::time::timeout(self.timeout(), ctx.read_holding_registers(index, count))
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|e| map_io(e, false))?,
            ),
            RegisterKind::Input => registers_value(
                tokio::time::timeout(self.timeout(), ctx.read_input_registers(index, count))
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|e| map_io(e, false))?,
            ),
            RegisterKind::Coil => bits_value(
                tokio::time::timeout(self.timeout(), ctx.read_coils(index, count))
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|e| map_io(e, false))?,
                count,
            ),
            RegisterKind::Discrete => bits_value(
                tokio::time::timeout(self.timeout(), ctx.read_discrete_inputs(index, count))
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|e| map_io(e, false))?,
                count,
            ),
        };
        Ok(value)
    }

    async fn write_raw(&self, address: &ModbusAddress, value: &Value) -> TransportResult<()> {
        let mut guard = self.context.lock().await;
        let ctx = guard
            .as_mut()
            .ok_or_else(|| TransportError::Connection("Modbus client is not connected".into()))?;
        ctx.set_slave(Slave(address.unit.unwrap_or(self.config.unit_id)));

        let index = address.index;
        let timed_out = || TransportError::Timeout(format!("Modbus write of {address} timed out"));
        let result = match address.kind {
            RegisterKind::Holding => {
                let words = elements(address, value, register_word)?;
                if let [word] = words.as_slice() {
                    tokio::time::timeout(self.timeout(), ctx.write_single_register(index, *word)).await
                } else {
                    tokio::time::timeout(self.timeout(), ctx.write_multiple_registers(index, &words)).await
                }
            }
            RegisterKind::Coil => {
                let bits = elements(address, value, coil_bit)?;
                if let [bit] = bits.as_slice() {
                    tokio::time::timeout(self.timeout(), ctx.write_single_coil(index, *bit)).await
                } else {
                    tokio::time::timeout(self.timeout(), ctx.write_multiple_coils(index, &bits)).await
                }
            }
            RegisterKind::Input | RegisterKind::Discrete => {
                return Err(read_only(address));
            }
        };
        result.map_err(|_| timed_out())?.map_err(|e| map_io(e, true))
    }
}

fn read_only(address: &ModbusAddress) -> TransportError {
    TransportError::InvalidAddress(format!(
        "Modbus {} table is read-only ({address})",
        address.kind.as_str()
    ))
}

#[async_trait]
impl TransportClient for ModbusClient {
    fn protocol(&self) -> Protocol {
        Protocol::Modbus
    }

    fn metadata(&self) -> &TransportMetadata {
        &self.metadata
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn connect(&self) -> TransportResult<()> {
        let mut guard = self.context.lock().await;
        if guard.is_some() && self.state.get().is_connected() {
            return Ok(());
        }
        self.state.set(ConnectionState::Connecting);

        let socket_addr = match self.socket_addr().await {
            Ok(addr) => addr,
            Err(e) => {
                self.state.set(ConnectionState::ConnectionError);
                return Err(e);
            }
        };
        let connected = tokio::time::timeout(
            self.timeout(),
            tcp::connect_slave(socket_addr, Slave(self.config.unit_id)),
        )
        .await;
        match connected {
            Ok(Ok(ctx)) => {
                *guard = Some(ctx);
                self.state.set(ConnectionState::Connected);
                info!(transport_id = %self.metadata.id, %socket_addr, "Connected to Modbus TCP server");
                Ok(())
            }
            Ok(Err(e)) => {
                self.state.set(ConnectionState::ConnectionError);
                Err(TransportError::Connection(format!(
                    "Failed to connect to Modbus TCP server {socket_addr}: {e}"
                )))
            }
            Err(_) => {
                self.state.set(ConnectionState::ConnectionError);
                Err(TransportError::Connection(format!(
                    "Connection to Modbus TCP server {socket_addr} timed out after {}s",
                    self.config.timeout
                )))
            }
        }
    }

    async fn read(&self, address: &TransportAddress) -> TransportResult<Value> {
        self.ensure_connected().await?;
        let TransportAddress::Modbus(modbus) = address else {
            return Err(protocol_mismatch(Protocol::Modbus, address));
        };
        debug!(transport_id = %self.metadata.id, address = %modbus, "Modbus read");
        let result = self.read_raw(modbus).await;
        if let Err(e) = &result {
            self.note_failure(e).await;
        }
        result
    }

    async fn write(&self, address: &TransportAddress, value: Value) -> TransportResult<()> {
        let TransportAddress::Modbus(modbus) = address else {
            return Err(protocol_mismatch(Protocol::Modbus, address));
        };
        if !modbus.kind.is_writable() {
            return Err(read_only(modbus));
        }
        self.ensure_connected().await?;
        debug!(transport_id = %self.metadata.id, address = %modbus, value = %value, "Modbus write");
        let result = self.write_raw(modbus, &value).await;
        if let Err(e) = &result {
            self.note_failure(e).await;
        }
        result
    }

    async fn close(&self) -> TransportResult<()> {
        self.state.set(ConnectionState::Closing);
        self.context.lock().await.take();
        self.state.set(ConnectionState::Closed);
        Ok(())
    }
}
