//! Transport layer for Unison.
//!
//! Addresses locate a value on a device; clients move values over the wire:
//!
//! - [`http`]: single request/response over `reqwest`
//! - [`mqtt`]: publish/subscribe over `rumqttc`, with push delivery
//! - [`modbus`]: Modbus-TCP registers and coils over `tokio-modbus`
//! - [`bacnet`]: BACnet/IP ReadProperty / WriteProperty over UDP
//!
//! Every client implements [`TransportClient`] and reports a
//! [`ConnectionState`]. Push messages are routed to callbacks through the
//! [`ListenerRegistry`].

pub mod address;
pub mod bacnet;
pub mod client;
pub mod http;
pub mod modbus;
pub mod mqtt;
pub mod registry;
pub mod state;

pub use address::{
    topic_matches, AddressId, AddressTemplate, BacnetAddress, BacnetObjectType, HttpAddress,
    ModbusAddress, MqttAddress, Protocol, RegisterKind, TransportAddress,
};
pub use bacnet::{BacnetClient, BacnetConfig};
pub use client::{
    create_client, PushMessage, SharedTransport, TransportClient, TransportConfig,
    TransportMetadata,
};
pub use http::{HttpClient, HttpConfig};
pub use modbus::{ModbusClient, ModbusConfig};
pub use mqtt::{MqttClient, MqttConfig};
pub use registry::{listener, Listener, ListenerId, ListenerRegistry, ReadHandlerRegistry};
pub use state::{ConnectionState, StateCell};
