//! Configuration persistence for Unison.
//!
//! Transport, driver and device records are kept in [`Repository`]
//! implementations keyed by id. [`Store`] groups the three repositories and
//! loads them into a [`unison_devices::DevicesManager`].

pub mod repository;
pub mod store;
pub mod yaml;

pub use repository::{MemoryRepository, Record, Repository};
pub use store::{BootstrapReport, LoadFailure, Store};
pub use yaml::YamlDirectory;
