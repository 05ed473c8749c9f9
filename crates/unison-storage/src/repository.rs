//! Repository trait and the in-memory implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use unison_core::{Error, Result};
use unison_devices::{DeviceRecord, DriverRecord, TransportRecord};

/// A configuration record stored under its id.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Human-readable kind used in log lines and errors
    const KIND: &'static str;

    fn id(&self) -> &str;
}

impl Record for TransportRecord {
    const KIND: &'static str = "transport";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for DriverRecord {
    const KIND: &'static str = "driver";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for DeviceRecord {
    const KIND: &'static str = "device";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Keyed record storage.
#[async_trait]
pub trait Repository<T: Record>: Send + Sync {
    /// Every record, ordered by id.
    async fn list_all(&self) -> Result<Vec<T>>;

    /// Every stored entry keyed by its storage key, each with its own load
    /// outcome. Only a failure to enumerate the store is an error.
    async fn load_entries(&self) -> Result<Vec<(String, Result<T>)>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .map(|record| (record.id().to_string(), Ok(record)))
            .collect())
    }

    async fn read(&self, id: &str) -> Result<Option<T>>;

    /// Insert or replace the record under its id.
    async fn write(&self, record: &T) -> Result<()>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    fn is_persistent(&self) -> bool;
}

/// Reject ids that cannot serve as a storage key.
pub(crate) fn check_id(kind: &str, id: &str) -> Result<()> {
    let valid = !id.trim().is_empty()
        && !id.starts_with('.')
        && !id.contains(['/', '\\'])
        && !id.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(Error::invalid(format!("invalid {kind} id '{id}'")))
    }
}

/// Non-persistent repository for tests and ephemeral setups.
pub struct MemoryRepository<T> {
    records: RwLock<BTreeMap<String, T>>,
}

impl<T> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: Record> MemoryRepository<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = T>) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.id().to_string(), r))
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }
}

#[async_trait]
impl<T: Record> Repository<T> for MemoryRepository<T> {
    async fn list_all(&self) -> Result<Vec<T>> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn read(&self, id: &str) -> Result<Option<T>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn write(&self, record: &T) -> Result<()> {
        check_id(T::KIND, record.id())?;
        self.records
            .write()
            .insert(record.id().to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.write().remove(id).is_some())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_repository_crud() {
        let repo = MemoryRepository::new();
        repo.write(&DeviceRecord::new("b", "boiler", "plc")).await.unwrap();
        repo.write(&DeviceRecord::new("a", "boiler", "plc")).await.unwrap();
        repo.write(&DeviceRecord::new("a", "boiler", "plc").with_name("Attic")).await.unwrap();

        let all = repo.list_all().await.unwrap();
        assert_eq!(all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(repo.read("a").await.unwrap().unwrap().display_name(), "Attic");

        assert!(repo.delete("a").await.unwrap());
        assert!(!repo.delete("a").await.unwrap());
        assert!(repo.read("a").await.unwrap().is_none());
        assert!(!repo.is_persistent());
    }

    #[test]
    fn test_id_check() {
        assert!(check_id("device", "boiler-1").is_ok());
        for bad in ["", "  ", "../etc", "a/b", ".hidden", "a\\b"] {
            assert!(check_id("device", bad).is_err(), "{bad}");
        }
    }
}
