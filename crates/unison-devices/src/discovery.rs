//! Push-based device discovery.
//!
//! A registration subscribes a driver's discovery address on a transport.
//! Every message on it runs the discovery field getters over the payload;
//! the extracted fields become the device config, `id` names the device and
//! `name` (when present) its display name. Unknown ids create devices, known
//! ones are reconfigured in place.

use std::sync::Arc;

use unison_core::{Context, Error, Result};
use unison_transports::{listener, AddressId, PushMessage};

use crate::device::{Device, DeviceBase};
use crate::driver::extract_fields;
use crate::manager::{Binding, DevicesManager};

/// Field that names a discovered device.
pub const ID_FIELD: &str = "id";
/// Optional display name field.
pub const NAME_FIELD: &str = "name";

/// Discovery registrations of one [`DevicesManager`].
pub struct DiscoveryManager<'a> {
    manager: &'a DevicesManager,
}

impl<'a> DiscoveryManager<'a> {
    pub(crate) fn new(manager: &'a DevicesManager) -> Self {
        Self { manager }
    }

    /// Start discovering devices of `driver_id` on `transport_id`.
    pub async fn register(&self, driver_id: &str, transport_id: &str) -> Result<AddressId> {
        let manager = self.manager;
        let _guard = manager.mutation.lock().await;

        let key = (driver_id.to_string(), transport_id.to_string());
        if manager.discoveries.lock().contains_key(&key) {
            return Err(Error::AlreadyExists(format!(
                "discovery of driver '{driver_id}' on transport '{transport_id}'"
            )));
        }
        let driver = manager
            .driver(driver_id)
            .ok_or_else(|| Error::not_found(format!("driver '{driver_id}'")))?;
        let transport = manager
            .transport(transport_id)
            .ok_or_else(|| Error::not_found(format!("transport '{transport_id}'")))?;
        let discovery = driver
            .discovery
            .as_ref()
            .ok_or_else(|| Error::invalid(format!("driver '{driver_id}' has no discovery section")))?;
        if driver.protocol != transport.protocol() {
            return Err(Error::invalid(format!(
                "driver '{driver_id}' speaks {} but transport '{transport_id}' is {}",
                driver.protocol,
                transport.protocol()
            )));
        }
        if !transport.supports_push() {
            return Err(Error::invalid(format!(
                "transport '{transport_id}' does not deliver push messages"
            )));
        }

        let address = discovery.address.resolve(&Context::new())?;
        let address_id = match transport.subscribe(&address).await {
            Ok(id) => id,
            // Recorded subscriptions are re-issued once the client connects.
            Err(e) if e.is_connection() || e.is_timeout() => {
                tracing::warn!(transport_id = %transport_id, address = %address, error = %e, "Discovery subscribe deferred");
                address.id()
            }
            Err(e) => return Err(e.into()),
        };

        let target = manager.weak();
        let (d, t) = key.clone();
        let listener_id = manager.listeners.register(
            address_id.clone(),
            listener(move |message| {
                let target = target.clone();
                let (driver_id, transport_id) = (d.clone(), t.clone());
                async move {
                    let Some(manager) = target.upgrade() else {
                        return;
                    };
                    if let Err(e) = manager
                        .discovery_manager()
                        .materialize(&driver_id, &transport_id, &message)
                        .await
                    {
                        tracing::warn!(
                            driver_id = %driver_id,
                            transport_id = %transport_id,
                            topic = %message.topic,
                            error = %e,
                            "Discovery message rejected"
                        );
                    }
                }
            }),
        );

        manager.discoveries.lock().insert(
            key,
            Binding {
                listener: listener_id,
                address_id: address_id.clone(),
                address: address.clone(),
                transport,
            },
        );
        tracing::info!(driver_id = %driver_id, transport_id = %transport_id, address = %address, "Discovery registered");
        Ok(address_id)
    }

    /// Stop a discovery. Devices it created stay in place.
    pub async fn unregister(&self, driver_id: &str, transport_id: &str) -> bool {
        let manager = self.manager;
        let _guard = manager.mutation.lock().await;
        let binding = manager
            .discoveries
            .lock()
            .remove(&(driver_id.to_string(), transport_id.to_string()));
        match binding {
            Some(binding) => {
                manager.release(binding).await;
                tracing::info!(driver_id = %driver_id, transport_id = %transport_id, "Discovery unregistered");
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, driver_id: &str, transport_id: &str) -> bool {
        self.manager
            .discoveries
            .lock()
            .contains_key(&(driver_id.to_string(), transport_id.to_string()))
    }

    /// Registered `(driver, transport)` pairs.
    pub fn registrations(&self) -> Vec<(String, String)> {
        let mut keys: Vec<(String, String)> = self.manager.discoveries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Create or update the device described by a discovery message.
    ///
    /// Returns `None` when the payload carries no device id or the
    /// registration is gone.
    pub async fn materialize(
        &self,
        driver_id: &str,
        transport_id: &str,
        message: &PushMessage,
    ) -> Result<Option<Arc<Device>>> {
        let manager = self.manager;
        let _guard = manager.mutation.lock().await;

        let Some(driver) = manager.driver(driver_id) else {
            return Ok(None);
        };
        let Some(discovery) = driver.discovery.as_ref() else {
            return Ok(None);
        };

        let config = extract_fields(&discovery.device_config, &message.payload);
        let Some(id) = config.get(ID_FIELD).map(|v| v.to_text()) else {
            tracing::warn!(driver_id = %driver_id, topic = %message.topic, "Discovery payload has no device id");
            return Ok(None);
        };
        let name = config
            .get(NAME_FIELD)
            .map(|v| v.to_text())
            .unwrap_or_else(|| id.clone());

        if let Some(device) = manager.device(&id) {
            if device.driver().id != driver_id || device.transport().metadata().id != transport_id {
                return Err(Error::AlreadyExists(format!(
                    "device '{id}' is bound to driver '{}' on transport '{}'",
                    device.driver().id,
                    device.transport().metadata().id
                )));
            }
            if device.name() != name || device.base().config != config {
                manager.reconfigure_device(&device, name, config).await;
            }
            return Ok(Some(device));
        }

        let device = manager
            .insert_device(DeviceBase::new(&id, name, config), driver_id, transport_id)
            .await?;
        tracing::info!(device_id = %id, driver_id = %driver_id, "Device discovered");
        Ok(Some(device))
    }
}
