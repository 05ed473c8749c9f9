//! YAML directory repository: one `<id>.yaml` file per record.

use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use unison_core::{Error, Result};

use crate::repository::{check_id, Record, Repository};

const EXTENSIONS: [&str; 2] = ["yaml", "yml"];

fn storage_error(action: &str, path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Storage(format!("failed to {action} {}: {e}", path.display()))
}

/// Records stored as YAML files in one directory.
///
/// Files ending in `.yaml` or `.yml` are loaded; anything else is ignored.
/// Writes go through a temporary file and a rename.
pub struct YamlDirectory<T> {
    root: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> YamlDirectory<T> {
    /// Open `root`, creating it when missing.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| storage_error("create", &root, e))?;
        Ok(Self {
            root,
            _record: PhantomData,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.yaml"))
    }

    /// Record files in the directory, sorted by name.
    pub async fn files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| storage_error("list", &self.root, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_error("list", &self.root, e))?
        {
            let path = entry.path();
            let is_record = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| EXTENSIONS.contains(&e))
                .unwrap_or(false);
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_record && is_file {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Parse one file.
    pub async fn load_file(path: &Path) -> Result<T> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| storage_error("read", path, e))?;
        serde_yaml::from_str(&text).map_err(|e| storage_error("parse", path, e))
    }

    /// Every file with its parse outcome, so callers can report bad files
    /// without giving up on the good ones.
    pub async fn load_each(&self) -> Result<Vec<(PathBuf, Result<T>)>> {
        let mut loaded = Vec::new();
        for path in self.files().await? {
            let record = Self::load_file(&path).await;
            loaded.push((path, record));
        }
        Ok(loaded)
    }
}

#[async_trait]
impl<T: Record> Repository<T> for YamlDirectory<T> {
    async fn list_all(&self) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for (_, record) in self.load_each().await? {
            records.push(record?);
        }
        records.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(records)
    }

    /// Keyed by file stem so unparseable files can still be named.
    async fn load_entries(&self) -> Result<Vec<(String, Result<T>)>> {
        Ok(self
            .load_each()
            .await?
            .into_iter()
            .map(|(path, record)| {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (stem, record)
            })
            .collect())
    }

    async fn read(&self, id: &str) -> Result<Option<T>> {
        check_id(T::KIND, id)?;
        for extension in EXTENSIONS {
            let path = self.root.join(format!("{id}.{extension}"));
            match Self::load_file(&path).await {
                Ok(record) => return Ok(Some(record)),
                Err(_) if !path.exists() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn write(&self, record: &T) -> Result<()> {
        check_id(T::KIND, record.id())?;
        let path = self.path_for(record.id());
        let text = serde_yaml::to_string(record).map_err(|e| storage_error("serialize", &path, e))?;

        let tmp = self.root.join(format!(".{}.yaml.tmp", record.id()));
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| storage_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_error("write", &path, e))?;
        // One file per id: drop a `.yml` twin.
        let twin = self.root.join(format!("{}.yml", record.id()));
        if let Err(e) = tokio::fs::remove_file(&twin).await {
            if e.kind() != ErrorKind::NotFound {
                return Err(storage_error("delete", &twin, e));
            }
        }
        tracing::debug!(kind = T::KIND, id = %record.id(), path = %path.display(), "Record written");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        check_id(T::KIND, id)?;
        let mut removed = false;
        for extension in EXTENSIONS {
            let path = self.root.join(format!("{id}.{extension}"));
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(storage_error("delete", &path, e)),
            }
        }
        Ok(removed)
    }

    fn is_persistent(&self) -> bool {
        true
    }
}
