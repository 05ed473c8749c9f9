//! The three configuration repositories and manager bootstrap.

use std::path::Path;
use std::sync::Arc;

use unison_core::config::defaults;
use unison_core::{Error, Result};
use unison_devices::{DeviceRecord, DevicesManager, DriverDefinition, DriverRecord, TransportRecord};

use crate::repository::{MemoryRepository, Repository};
use crate::yaml::YamlDirectory;

/// A record that could not be applied during bootstrap.
#[derive(Debug)]
pub struct LoadFailure {
    pub kind: &'static str,
    pub id: String,
    pub error: Error,
}

/// What [`Store::bootstrap`] applied to the manager.
#[derive(Debug, Default)]
pub struct BootstrapReport {
    pub transports: usize,
    pub drivers: usize,
    pub devices: usize,
    pub failures: Vec<LoadFailure>,
}

impl BootstrapReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, kind: &'static str, id: &str, error: Error) {
        tracing::warn!(kind, id = %id, error = %error, "Failed to load record");
        self.failures.push(LoadFailure {
            kind,
            id: id.to_string(),
            error,
        });
    }
}

pub struct Store {
    pub transports: Arc<dyn Repository<TransportRecord>>,
    pub drivers: Arc<dyn Repository<DriverRecord>>,
    pub devices: Arc<dyn Repository<DeviceRecord>>,
}

impl Store {
    pub fn new(
        transports: Arc<dyn Repository<TransportRecord>>,
        drivers: Arc<dyn Repository<DriverRecord>>,
        devices: Arc<dyn Repository<DeviceRecord>>,
    ) -> Self {
        Self {
            transports,
            drivers,
            devices,
        }
    }

    /// Empty, non-persistent store.
    pub fn memory() -> Self {
        Self::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryRepository::new()),
        )
    }

    /// YAML store with `transports/`, `drivers/` and `devices/` under `root`.
    pub async fn open_dir(root: &Path) -> Result<Self> {
        Self::open_dirs(
            &root.join(defaults::TRANSPORTS_DIR),
            &root.join(defaults::DRIVERS_DIR),
            &root.join(defaults::DEVICES_DIR),
        )
        .await
    }

    pub async fn open_dirs(transports: &Path, drivers: &Path, devices: &Path) -> Result<Self> {
        Ok(Self::new(
            Arc::new(YamlDirectory::<TransportRecord>::open(transports).await?),
            Arc::new(YamlDirectory::<DriverRecord>::open(drivers).await?),
            Arc::new(YamlDirectory::<DeviceRecord>::open(devices).await?),
        ))
    }

    /// Load transports, then drivers, then devices into `manager`.
    ///
    /// A record that fails to parse, build or register is reported and
    /// skipped; only a store that cannot be listed aborts the bootstrap.
    pub async fn bootstrap(&self, manager: &DevicesManager) -> Result<BootstrapReport> {
        let mut report = BootstrapReport::default();

        for (key, record) in self.transports.load_entries().await? {
            let added = match record {
                Ok(record) => manager.add_transport(record).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match added {
                Ok(()) => report.transports += 1,
                Err(e) => report.fail("transport", &key, e),
            }
        }

        for (key, record) in self.drivers.load_entries().await? {
            let added = match record.and_then(DriverDefinition::from_record) {
                Ok(driver) => manager.add_driver(driver).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match added {
                Ok(()) => report.drivers += 1,
                Err(e) => report.fail("driver", &key, e),
            }
        }

        for (key, record) in self.devices.load_entries().await? {
            let added = match record {
                Ok(record) => manager.add_device(record).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match added {
                Ok(()) => report.devices += 1,
                Err(e) => report.fail("device", &key, e),
            }
        }

        tracing::info!(
            transports = report.transports,
            drivers = report.drivers,
            devices = report.devices,
            failed = report.failures.len(),
            "Configuration loaded"
        );
        Ok(report)
    }

    /// Register a device and persist it once the manager accepted it.
    pub async fn add_device(&self, manager: &DevicesManager, record: DeviceRecord) -> Result<()> {
        manager.add_device(record.clone()).await?;
        self.devices.write(&record).await
    }

    /// Remove a device from the manager and from storage.
    pub async fn remove_device(&self, manager: &DevicesManager, id: &str) -> Result<()> {
        manager.remove_device(id).await?;
        self.devices.delete(id).await?;
        Ok(())
    }

    /// Persist every device the manager holds that storage does not know
    /// about, such as discovered ones. Returns how many were written.
    pub async fn persist_new_devices(&self, manager: &DevicesManager) -> Result<usize> {
        let mut written = 0;
        for device in manager.devices() {
            if self.devices.read(device.id()).await?.is_none() {
                self.devices.write(&device.record()).await?;
                written += 1;
            }
        }
        if written > 0 {
            tracing::info!(written, "Discovered devices persisted");
        }
        Ok(written)
    }
}
