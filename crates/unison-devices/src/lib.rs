//! Device model and orchestration for Unison.
//!
//! - [`driver`]: authoring records normalized into [`DriverDefinition`]s
//! - [`attribute`]: attribute drivers and live attribute state
//! - [`device`]: a driver bound to a transport, with polling and writes
//! - [`manager`]: the [`DevicesManager`] owning devices, drivers, transports
//!   and their background tasks
//! - [`discovery`]: push-based device discovery
//! - [`tasks`]: keyed task registry

pub mod attribute;
pub mod device;
pub mod discovery;
pub mod driver;
pub mod manager;
pub mod records;
pub mod tasks;

pub use attribute::{Attribute, AttributeDriver, AttributeSnapshot};
pub use device::{AttributeFailure, Device, DeviceBase, DeviceSnapshot, PollReport};
pub use discovery::DiscoveryManager;
pub use driver::{
    extract_fields, AttributeRecord, DiscoveryListener, DiscoveryRecord, DriverDefinition,
    DriverRecord, FieldGetter, FieldRecord, UpdateStrategy, UpdateStrategyRecord,
};
pub use manager::{DevicesManager, TransportSnapshot};
pub use records::{DeviceRecord, TransportRecord};
pub use tasks::{TaskKey, TasksRegistry};
