use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{Config, ConfigError};

/// Holds the live configuration. Readers take a cheap snapshot with `get`;
/// reloads swap in a new value without blocking them.
pub struct ConfigManager<T: Config> {
    config: ArcSwap<T>,
    path: Option<PathBuf>,
}

impl<T: Config> ConfigManager<T> {
    pub fn new(config: T) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: ArcSwap::from_pointee(config),
            path: None,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = Self::read(path)?;
        Ok(Self {
            config: ArcSwap::from_pointee(config),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let value: toml::Value = content.parse()?;
        Self::new(T::from_toml(&value)?)
    }

    fn read(path: &Path) -> Result<T, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let value: toml::Value = content.parse()?;
        let config = T::from_toml(&value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn get(&self) -> arc_swap::Guard<Arc<T>> {
        self.config.load()
    }

    pub fn get_full(&self) -> Arc<T> {
        self.config.load_full()
    }

    /// Replace the whole configuration.
    pub fn update(&self, new_config: T) -> Result<(), ConfigError> {
        new_config.validate()?;
        self.config.store(Arc::new(new_config));
        Ok(())
    }
}

impl<T: Config + Clone> ConfigManager<T> {
    /// Apply only the hot-updatable fields of `new_config`.
    pub fn hot_update(&self, new_config: &T) -> Result<(), ConfigError> {
        new_config.validate()?;
        let mut current = (*self.config.load_full()).clone();
        current.hot_update(new_config);
        current.validate()?;
        self.config.store(Arc::new(current));
        Ok(())
    }

    /// Hot update from a TOML fragment.
    pub fn hot_update_str(&self, content: &str) -> Result<(), ConfigError> {
        let value: toml::Value = content.parse()?;
        let new_config = T::from_toml(&value)?;
        self.hot_update(&new_config)?;
        tracing::info!("config hot updated");
        Ok(())
    }

    /// Re-read the file this manager was loaded from, applying only the
    /// hot-updatable fields. No-op for managers not backed by a file.
    pub fn reload(&self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.path {
            let new_config = Self::read(path)?;
            self.hot_update(&new_config)?;
            tracing::info!(path = %path.display(), "config reloaded");
        }
        Ok(())
    }

    pub fn snapshot(&self) -> T {
        (*self.config.load_full()).clone()
    }
}
