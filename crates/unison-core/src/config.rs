//! Shared defaults and environment variable names.
//!
//! Constants live here so transports, devices and the binary agree on them
//! without redefining the same numbers in several crates.

/// Default values.
pub mod defaults {
    /// Polling interval when a driver does not declare one (seconds)
    pub const POLLING_INTERVAL_SECS: u64 = 60;
    /// Per-I/O timeout when a driver does not declare one (seconds)
    pub const READ_TIMEOUT_SECS: u64 = 5;
    /// Transport client timeout (seconds)
    pub const TRANSPORT_TIMEOUT_SECS: u64 = 10;
    /// Capacity of the push-message broadcast channel
    pub const PUSH_CHANNEL_CAPACITY: usize = 256;
    /// Settings file name looked up by the binary
    pub const SETTINGS_FILE: &str = "unison.yaml";
    /// Data directory when neither settings nor environment set one
    pub const DATA_DIR: &str = "./data";
    /// Record directories under the data directory
    pub const TRANSPORTS_DIR: &str = "transports";
    pub const DRIVERS_DIR: &str = "drivers";
    pub const DEVICES_DIR: &str = "devices";
    /// Log filter when `RUST_LOG` is unset
    pub const LOG_FILTER: &str = "unison=info";
}

/// Transport protocol defaults.
pub mod transports {
    pub const MQTT_PORT: u16 = 1883;
    pub const MQTT_KEEP_ALIVE_SECS: u64 = 30;
    pub const MODBUS_PORT: u16 = 502;
    pub const MODBUS_UNIT_ID: u8 = 1;
    pub const BACNET_PORT: u16 = 47808;
    pub const BACNET_MAX_APDU: usize = 1476;
}

/// Environment variable names.
pub mod env_vars {
    pub const DATA_DIR: &str = "UNISON_DATA_DIR";
    pub const LOG_JSON: &str = "UNISON_LOG_JSON";
    pub const RUST_LOG: &str = "RUST_LOG";
}

/// Read a boolean flag from the environment (`1`, `true`, `yes`, `on`).
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
