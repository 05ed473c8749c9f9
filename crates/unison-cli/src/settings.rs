//! `unison.yaml` settings with environment overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use unison_core::config::{defaults, env_vars};

/// A discovery to register at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoverySetting {
    pub driver: String,
    pub transport: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(defaults::DATA_DIR)
}

fn default_polling() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Override for `<data_dir>/transports`
    #[serde(default)]
    pub transports_dir: Option<PathBuf>,
    #[serde(default)]
    pub drivers_dir: Option<PathBuf>,
    #[serde(default)]
    pub devices_dir: Option<PathBuf>,
    #[serde(default)]
    pub discovery: Vec<DiscoverySetting>,
    /// Start polling right after loading
    #[serde(default = "default_polling")]
    pub polling: bool,
    /// Write discovered devices to the devices directory on shutdown
    #[serde(default)]
    pub persist_discovered: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            transports_dir: None,
            drivers_dir: None,
            devices_dir: None,
            discovery: Vec::new(),
            polling: default_polling(),
            persist_discovered: false,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from `unison.yaml` in the working
    /// directory when present, then apply environment overrides.
    ///
    /// Relative directories are taken relative to the settings file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fallback = PathBuf::from(defaults::SETTINGS_FILE);
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None if fallback.is_file() => Some(fallback),
            None => None,
        };

        let mut settings = match &path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read settings file {}", path.display()))?;
                let mut settings = Self::from_yaml(&text)
                    .with_context(|| format!("Invalid settings file {}", path.display()))?;
                if let Some(base) = path.parent() {
                    settings.rebase(base);
                }
                settings
            }
            None => Self::default(),
        };
        settings.apply_overrides(std::env::var(env_vars::DATA_DIR).ok());
        Ok(settings)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    fn rebase(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.data_dir);
        for dir in [&mut self.transports_dir, &mut self.drivers_dir, &mut self.devices_dir]
            .into_iter()
            .flatten()
        {
            join(dir);
        }
    }

    /// Apply `UNISON_DATA_DIR`.
    pub fn apply_overrides(&mut self, data_dir: Option<String>) {
        if let Some(dir) = data_dir.filter(|d| !d.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn transports_dir(&self) -> PathBuf {
        self.transports_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(defaults::TRANSPORTS_DIR))
    }

    pub fn drivers_dir(&self) -> PathBuf {
        self.drivers_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(defaults::DRIVERS_DIR))
    }

    pub fn devices_dir(&self) -> PathBuf {
        self.devices_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(defaults::DEVICES_DIR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_directories() {
        let settings = Settings::from_yaml("").unwrap();
        assert!(settings.polling);
        assert_eq!(settings.drivers_dir(), PathBuf::from("./data/drivers"));

        let settings = Settings::from_yaml(
            "data_dir: /srv/unison\ndrivers_dir: /etc/unison/drivers\npolling: false\ndiscovery:\n  - driver: sensor\n    transport: broker\n",
        )
        .unwrap();
        assert!(!settings.polling);
        assert_eq!(settings.devices_dir(), PathBuf::from("/srv/unison/devices"));
        assert_eq!(settings.drivers_dir(), PathBuf::from("/etc/unison/drivers"));
        assert_eq!(settings.discovery[0].transport, "broker");

        assert!(Settings::from_yaml("data_dir: x\nverbose: true\n").is_err());
    }

    #[test]
    fn test_file_relative_paths_and_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("unison.yaml");
        std::fs::write(&file, "data_dir: state\ndevices_dir: /abs/devices\n").unwrap();

        let mut settings = Settings::from_yaml(&std::fs::read_to_string(&file).unwrap()).unwrap();
        settings.rebase(dir.path());
        assert_eq!(settings.data_dir, dir.path().join("state"));
        assert_eq!(settings.devices_dir(), PathBuf::from("/abs/devices"));

        settings.apply_overrides(Some("/var/lib/unison".into()));
        assert_eq!(settings.transports_dir(), PathBuf::from("/var/lib/unison/transports"));
        settings.apply_overrides(Some(" ".into()));
        assert_eq!(settings.data_dir, PathBuf::from("/var/lib/unison"));

        assert!(Settings::load(Some(&dir.path().join("missing.yaml"))).is_err());
    }
}
