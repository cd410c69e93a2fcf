use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::api::models::ConnectionProfile;
use crate::secret::KeyMaterial;

/// Metadata cache location settings.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Overrides the default metadata cache directory.
    pub metadata_dir: Option<PathBuf>,
}

/// Process configuration: vault key material, cache locations, and any saved
/// profiles.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crypto: KeyMaterial,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub profiles: HashMap<String, ConnectionProfile>,
}

impl Config {
    pub fn get_config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    fn config_dir() -> Result<PathBuf> {
        let config_dir = if cfg!(target_os = "linux") {
            // Use XDG config directory on Linux
            dirs::config_dir()
                .context("Failed to get XDG config directory")?
                .join("dynamics-connection")
        } else {
            // Use home directory with dot prefix on Windows/Mac
            dirs::home_dir()
                .context("Failed to get home directory")?
                .join(".dynamics-connection")
        };

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
            info!("Created config directory: {:?}", config_dir);
        }

        Ok(config_dir)
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        debug!("Loading config from: {:?}", config_path);

        if !config_path.exists() {
            info!("Config file doesn't exist, using defaults");
            return Ok(Self::default());
        }

        let config_content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config: Config = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

        debug!("Loaded config with {} profiles", config.profiles.len());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        debug!("Saving config to: {:?}", config_path);

        let config_content =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, config_content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        info!("Config saved successfully");
        Ok(())
    }

    /// Directory holding the per-profile metadata cache files.
    pub fn metadata_cache_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cache.metadata_dir {
            return Ok(dir.clone());
        }
        Ok(Self::config_dir()?.join("metadata"))
    }

    pub fn get_profile(&self, name: &str) -> Option<&ConnectionProfile> {
        self.profiles.get(name)
    }

    pub fn add_profile(&mut self, name: String, profile: ConnectionProfile) -> Result<()> {
        info!("Adding profile: {}", name);
        self.profiles.insert(name, profile);
        self.save()
    }
}
