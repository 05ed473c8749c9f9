//! Devices manager.
//!
//! Owns the device, driver and transport maps plus every background task:
//! one polling loop per polled device and one dispatcher per push transport.
//! Entity maps are read lock-free; every mutation goes through one async
//! mutation lock so integrity checks and the change they guard are atomic.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use unison_core::{Context, Error, Result, Value};
use unison_transports::{
    listener, AddressId, ConnectionState, ListenerId, ListenerRegistry, Protocol, SharedTransport,
    TransportAddress,
};

use crate::device::{Device, DeviceBase, DeviceSnapshot, PollReport};
use crate::discovery::DiscoveryManager;
use crate::driver::DriverDefinition;
use crate::records::{DeviceRecord, TransportRecord};
use crate::tasks::{TaskKey, TasksRegistry};

/// A listener registration together with the subscription it relies on.
pub(crate) struct Binding {
    pub listener: ListenerId,
    pub address_id: AddressId,
    pub address: TransportAddress,
    pub transport: SharedTransport,
}

/// Transport DTO handed to the facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSnapshot {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    pub state: ConnectionState,
}

pub struct DevicesManager {
    this: Weak<DevicesManager>,
    pub(crate) devices: DashMap<String, Arc<Device>>,
    pub(crate) drivers: DashMap<String, Arc<DriverDefinition>>,
    pub(crate) transports: DashMap<String, SharedTransport>,
    tasks: TasksRegistry<TaskKey>,
    pub(crate) listeners: Arc<ListenerRegistry>,
    pub(crate) mutation: tokio::sync::Mutex<()>,
    polling: AtomicBool,
    device_bindings: parking_lot::Mutex<HashMap<String, Vec<Binding>>>,
    pub(crate) discoveries: parking_lot::Mutex<HashMap<(String, String), Binding>>,
}

impl DevicesManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            devices: DashMap::new(),
            drivers: DashMap::new(),
            transports: DashMap::new(),
            tasks: TasksRegistry::new(),
            listeners: Arc::new(ListenerRegistry::new()),
            mutation: tokio::sync::Mutex::new(()),
            polling: AtomicBool::new(false),
            device_bindings: parking_lot::Mutex::new(HashMap::new()),
            discoveries: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn weak(&self) -> Weak<DevicesManager> {
        self.this.clone()
    }

    // ========== Transports ==========

    /// Build a client from `record` and register it.
    pub async fn add_transport(&self, record: TransportRecord) -> Result<SharedTransport> {
        let client = record.build()?;
        self.add_transport_client(client.clone()).await?;
        Ok(client)
    }

    /// Register an already built client.
    ///
    /// Push-capable clients get a dispatcher task that forwards their
    /// messages to the listener registry.
    pub async fn add_transport_client(&self, client: SharedTransport) -> Result<()> {
        let _guard = self.mutation.lock().await;
        let id = client.metadata().id.clone();
        if self.transports.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("transport '{id}'")));
        }

        if let Some(mut messages) = client.messages() {
            let listeners = self.listeners.clone();
            let transport_id = id.clone();
            self.tasks.add(TaskKey::Dispatch(id.clone()), move || async move {
                loop {
                    match messages.recv().await {
                        Ok(message) => {
                            listeners.dispatch(message).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(transport_id = %transport_id, skipped, "Push dispatcher lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                tracing::debug!(transport_id = %transport_id, "Push dispatcher stopped");
            })?;
        }

        tracing::info!(transport_id = %id, protocol = %client.protocol(), "Transport added");
        self.transports.insert(id, client);
        Ok(())
    }

    /// Remove and close a transport no device or discovery still uses.
    pub async fn remove_transport(&self, id: &str) -> Result<()> {
        let _guard = self.mutation.lock().await;
        if !self.transports.contains_key(id) {
            return Err(Error::not_found(format!("transport '{id}'")));
        }
        let bound: Vec<String> = self
            .devices
            .iter()
            .filter(|d| d.transport().metadata().id == id)
            .map(|d| d.id().to_string())
            .collect();
        if !bound.is_empty() {
            return Err(Error::invalid(format!(
                "transport '{id}' is still used by devices: {}",
                bound.join(", ")
            )));
        }
        if self.discoveries.lock().keys().any(|(_, t)| t == id) {
            return Err(Error::invalid(format!("transport '{id}' has an active discovery")));
        }

        self.tasks.remove(&TaskKey::Dispatch(id.to_string())).await;
        if let Some((_, client)) = self.transports.remove(id) {
            if let Err(e) = client.close().await {
                tracing::warn!(transport_id = %id, error = %e, "Failed to close transport");
            }
        }
        tracing::info!(transport_id = %id, "Transport removed");
        Ok(())
    }

    pub fn transport(&self, id: &str) -> Option<SharedTransport> {
        self.transports.get(id).map(|t| t.value().clone())
    }

    pub fn transport_snapshots(&self) -> Vec<TransportSnapshot> {
        let mut snapshots: Vec<TransportSnapshot> = self
            .transports
            .iter()
            .map(|t| TransportSnapshot {
                id: t.metadata().id.clone(),
                name: t.metadata().name.clone(),
                protocol: t.protocol(),
                state: t.state(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    // ========== Drivers ==========

    pub async fn add_driver(&self, driver: DriverDefinition) -> Result<Arc<DriverDefinition>> {
        let _guard = self.mutation.lock().await;
        if self.drivers.contains_key(&driver.id) {
            return Err(Error::AlreadyExists(format!("driver '{}'", driver.id)));
        }
        let driver = Arc::new(driver);
        tracing::info!(
            driver_id = %driver.id,
            attributes = driver.attributes.len(),
            polling = driver.update_strategy.polling,
            "Driver added"
        );
        self.drivers.insert(driver.id.clone(), driver.clone());
        Ok(driver)
    }

    /// Remove a driver no device or discovery still uses.
    pub async fn remove_driver(&self, id: &str) -> Result<()> {
        let _guard = self.mutation.lock().await;
        if !self.drivers.contains_key(id) {
            return Err(Error::not_found(format!("driver '{id}'")));
        }
        let bound: Vec<String> = self
            .devices
            .iter()
            .filter(|d| d.driver().id == id)
            .map(|d| d.id().to_string())
            .collect();
        if !bound.is_empty() {
            return Err(Error::invalid(format!(
                "driver '{id}' is still used by devices: {}",
                bound.join(", ")
            )));
        }
        if self.discoveries.lock().keys().any(|(d, _)| d == id) {
            return Err(Error::invalid(format!("driver '{id}' has an active discovery")));
        }
        self.drivers.remove(id);
        tracing::info!(driver_id = %id, "Driver removed");
        Ok(())
    }

    pub fn driver(&self, id: &str) -> Option<Arc<DriverDefinition>> {
        self.drivers.get(id).map(|d| d.value().clone())
    }

    pub fn driver_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.drivers.iter().map(|d| d.key().clone()).collect();
        ids.sort();
        ids
    }

    // ========== Devices ==========

    /// Create a device from `record`, bind its push subscriptions and
    /// schedule it when polling is active.
    pub async fn add_device(&self, record: DeviceRecord) -> Result<Arc<Device>> {
        let _guard = self.mutation.lock().await;
        let base = DeviceBase::new(&record.id, record.display_name(), record.config.clone());
        self.insert_device(base, &record.driver, &record.transport).await
    }

    /// Insert a device. Callers hold the mutation lock.
    pub(crate) async fn insert_device(
        &self,
        base: DeviceBase,
        driver_id: &str,
        transport_id: &str,
    ) -> Result<Arc<Device>> {
        if self.devices.contains_key(&base.id) {
            return Err(Error::AlreadyExists(format!("device '{}'", base.id)));
        }
        let driver = self
            .driver(driver_id)
            .ok_or_else(|| Error::not_found(format!("driver '{driver_id}'")))?;
        let transport = self
            .transport(transport_id)
            .ok_or_else(|| Error::not_found(format!("transport '{transport_id}'")))?;

        let device = Arc::new(Device::new(base, driver, transport)?);
        self.devices.insert(device.id().to_string(), device.clone());
        self.bind_push(&device).await;
        if self.is_polling() {
            self.schedule_polling(&device)?;
        }
        tracing::info!(
            device_id = %device.id(),
            driver_id = %driver_id,
            transport_id = %transport_id,
            "Device added"
        );
        Ok(device)
    }

    /// Rename and reconfigure a device in place, then rebind its
    /// subscriptions. Callers hold the mutation lock.
    pub(crate) async fn reconfigure_device(&self, device: &Arc<Device>, name: String, config: Context) {
        self.unbind_push(device.id()).await;
        device.update_base(name, config);
        self.bind_push(device).await;
        tracing::info!(device_id = %device.id(), "Device updated");
    }

    /// Remove a device, stopping its polling task and push listeners.
    pub async fn remove_device(&self, id: &str) -> Result<()> {
        let _guard = self.mutation.lock().await;
        if self.devices.remove(id).is_none() {
            return Err(Error::not_found(format!("device '{id}'")));
        }
        self.tasks.remove(&TaskKey::Polling(id.to_string())).await;
        self.unbind_push(id).await;
        tracing::info!(device_id = %id, "Device removed");
        Ok(())
    }

    pub fn device(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.get(id).map(|d| d.value().clone())
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<Arc<Device>> = self.devices.iter().map(|d| d.value().clone()).collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_snapshots(&self) -> Vec<DeviceSnapshot> {
        self.devices().iter().map(|d| d.snapshot()).collect()
    }

    fn require_device(&self, id: &str) -> Result<Arc<Device>> {
        self.device(id)
            .ok_or_else(|| Error::not_found(format!("device '{id}'")))
    }

    /// Run one polling cycle on a device right now.
    pub async fn update_device(&self, id: &str) -> Result<PollReport> {
        Ok(self.require_device(id)?.update_attributes().await)
    }

    pub async fn write_attribute(&self, device_id: &str, attribute: &str, value: Value) -> Result<Value> {
        self.require_device(device_id)?
            .write_attribute_value(attribute, value)
            .await
    }

    // ========== Push bindings ==========

    async fn bind_push(&self, device: &Arc<Device>) {
        let transport = device.transport().clone();
        if !transport.supports_push() {
            return;
        }

        let mut seen = HashSet::new();
        let mut bindings = Vec::new();
        for (attribute, address) in device.read_addresses() {
            let address = match address {
                Ok(address) => address,
                Err(e) => {
                    tracing::warn!(device_id = %device.id(), attribute = %attribute, error = %e, "Cannot resolve read address");
                    continue;
                }
            };
            if !seen.insert(address.id()) {
                continue;
            }
            // A failed subscribe is retried by the client on reconnect, so
            // the listener is registered regardless.
            let address_id = match transport.subscribe(&address).await {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(device_id = %device.id(), address = %address, error = %e, "Subscribe failed");
                    address.id()
                }
            };
            let target = Arc::downgrade(device);
            let listener_id = self.listeners.register(
                address_id.clone(),
                listener(move |message| {
                    let target = target.clone();
                    async move {
                        if let Some(device) = target.upgrade() {
                            device.handle_push(&message);
                        }
                    }
                }),
            );
            bindings.push(Binding {
                listener: listener_id,
                address_id,
                address,
                transport: transport.clone(),
            });
        }

        tracing::debug!(device_id = %device.id(), subscriptions = bindings.len(), "Push bindings registered");
        self.device_bindings.lock().insert(device.id().to_string(), bindings);
    }

    async fn unbind_push(&self, device_id: &str) {
        let bindings = self.device_bindings.lock().remove(device_id).unwrap_or_default();
        for binding in bindings {
            self.release(binding).await;
        }
    }

    /// Drop a listener and unsubscribe once nobody else listens there.
    pub(crate) async fn release(&self, binding: Binding) {
        self.listeners.remove(&binding.listener);
        if self.listeners.listeners_for(&binding.address_id).is_empty() {
            if let Err(e) = binding.transport.unsubscribe(&binding.address).await {
                tracing::debug!(address = %binding.address, error = %e, "Unsubscribe failed");
            }
        }
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    // ========== Polling ==========

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    /// Schedule a polling loop for every polled device that has none yet.
    /// Devices added later are scheduled on insertion. Returns how many
    /// loops were started.
    pub async fn start_polling(&self) -> Result<usize> {
        let _guard = self.mutation.lock().await;
        self.polling.store(true, Ordering::SeqCst);
        let mut started = 0;
        for device in self.devices() {
            if self.schedule_polling(&device)? {
                started += 1;
            }
        }
        tracing::info!(started, "Polling started");
        Ok(started)
    }

    /// Stop every polling loop. Returns how many were stopped.
    pub async fn stop_polling(&self) -> usize {
        let _guard = self.mutation.lock().await;
        self.polling.store(false, Ordering::SeqCst);
        let stopped = self
            .tasks
            .remove_where(|key| matches!(key, TaskKey::Polling(_)))
            .await;
        tracing::info!(stopped, "Polling stopped");
        stopped
    }

    pub(crate) fn schedule_polling(&self, device: &Arc<Device>) -> Result<bool> {
        let strategy = device.driver().update_strategy;
        if !strategy.polling {
            return Ok(false);
        }
        let key = TaskKey::Polling(device.id().to_string());
        if self.tasks.has(&key) {
            return Ok(false);
        }
        let target = Arc::downgrade(device);
        self.tasks.add(key, move || poll_loop(target, strategy.interval))?;
        Ok(true)
    }

    pub fn is_device_polled(&self, id: &str) -> bool {
        self.tasks.is_running(&TaskKey::Polling(id.to_string()))
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    // ========== Discovery ==========

    pub fn discovery_manager(&self) -> DiscoveryManager<'_> {
        DiscoveryManager::new(self)
    }

    // ========== Lifecycle ==========

    /// Stop every task, drop all listeners and close every transport.
    pub async fn shutdown(&self) {
        let _guard = self.mutation.lock().await;
        self.polling.store(false, Ordering::SeqCst);
        self.tasks.shutdown().await;

        let device_bindings: Vec<Binding> = self
            .device_bindings
            .lock()
            .drain()
            .flat_map(|(_, bindings)| bindings)
            .collect();
        let discovery_bindings: Vec<Binding> = self.discoveries.lock().drain().map(|(_, b)| b).collect();
        for binding in device_bindings.into_iter().chain(discovery_bindings) {
            self.listeners.remove(&binding.listener);
        }

        let transports: Vec<SharedTransport> = self.transports.iter().map(|t| t.value().clone()).collect();
        for transport in transports {
            if let Err(e) = transport.close().await {
                tracing::warn!(transport_id = %transport.metadata().id, error = %e, "Failed to close transport");
            }
        }
        tracing::info!(devices = self.devices.len(), transports = self.transports.len(), "Devices manager shut down");
    }
}

async fn poll_loop(device: Weak<Device>, interval: Duration) {
    loop {
        let Some(device) = device.upgrade() else {
            break;
        };
        device.update_attributes().await;
        drop(device);
        tokio::time::sleep(interval).await;
    }
}
