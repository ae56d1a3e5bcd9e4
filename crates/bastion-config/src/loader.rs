use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use bastion_core::{BastionError, Result};

use crate::schema::BastionConfig;

/// Loads and holds the Bastion configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<BastionConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > BASTION_CONFIG env > ~/.bastion/bastion.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("BASTION_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bastion")
            .join("bastion.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::read(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            BastionConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Wrap an already-built config (tests, embedding hosts).
    pub fn from_config(config: BastionConfig) -> Result<Self> {
        Self::check(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::new(),
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> BastionConfig {
        self.config.read().clone()
    }

    pub fn shared(&self) -> Arc<RwLock<BastionConfig>> {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Re-read the config file. The current config is kept if the new one
    /// does not parse or validate.
    pub fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(BastionError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::read(&self.config_path)?);
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    fn read(path: &Path) -> Result<BastionConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<BastionConfig>(&raw).map_err(|e| {
            BastionError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    fn check(config: &BastionConfig) -> Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(BastionError::Config(e)),
        }
    }

    /// Apply env var overrides (BASTION_HOST_VERSION, BASTION_CPU_SECONDS, etc.)
    fn apply_env_overrides(mut config: BastionConfig) -> BastionConfig {
        if let Ok(v) = std::env::var("BASTION_HOST_VERSION") {
            config.host.version = Some(v);
        }
        if let Ok(v) = std::env::var("BASTION_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("BASTION_INSTALL_DIR") {
            config.plugins.install_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BASTION_CPU_SECONDS") {
            match v.parse::<f64>() {
                Ok(secs) => config.sandbox.cpu_seconds = secs,
                Err(_) => warn!(value = %v, "ignoring unparseable BASTION_CPU_SECONDS"),
            }
        }
        if let Ok(v) = std::env::var("BASTION_MEMORY_MB") {
            match v.parse::<u64>() {
                Ok(mb) => config.sandbox.memory_mb = mb,
                Err(_) => warn!(value = %v, "ignoring unparseable BASTION_MEMORY_MB"),
            }
        }
        config
    }
}
