//! Host-side implementations behind the capability-gated host functions.
//!
//! The sandbox checks permissions; services only see calls that already
//! passed the gate, and are responsible for scoping what those calls touch.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use bastion_core::PluginId;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request reaches outside what the plugin may touch even with the
    /// permission (e.g. a path escaping its data directory).
    #[error("denied: {0}")]
    Denied(String),

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Failed(String),
}

/// Host services reachable from the sandbox.
pub trait HostServices: Send + Sync {
    fn log(&self, plugin: &PluginId, message: &str);
    fn storage_get(&self, plugin: &PluginId, key: &str) -> Option<Vec<u8>>;
    fn storage_set(&self, plugin: &PluginId, key: &str, value: &[u8]) -> Result<(), ServiceError>;
    fn read_file(&self, plugin: &PluginId, path: &str) -> Result<Vec<u8>, ServiceError>;
    fn write_file(&self, plugin: &PluginId, path: &str, data: &[u8]) -> Result<(), ServiceError>;
    fn fetch(&self, plugin: &PluginId, url: &str) -> Result<Vec<u8>, ServiceError>;
    fn notify(&self, plugin: &PluginId, message: &str) -> Result<(), ServiceError>;
}

/// Default services: files confined to `<data_root>/<plugin id>/`,
/// in-memory key-value storage, notifications recorded and logged.
/// Outbound HTTP is not wired up and always fails.
pub struct ScopedServices {
    data_root: PathBuf,
    storage: DashMap<PluginId, HashMap<String, Vec<u8>>>,
    notifications: Mutex<Vec<(PluginId, String)>>,
}

impl ScopedServices {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            storage: DashMap::new(),
            notifications: Mutex::new(Vec::new()),
        }
    }

    pub fn plugin_root(&self, plugin: &PluginId) -> PathBuf {
        self.data_root.join(plugin.as_str())
    }

    /// Notifications shown so far, oldest first.
    pub fn notifications(&self) -> Vec<(PluginId, String)> {
        self.notifications.lock().clone()
    }

    fn resolve(&self, plugin: &PluginId, path: &str) -> Result<PathBuf, ServiceError> {
        let rel = Path::new(path);
        if path.is_empty() {
            return Err(ServiceError::Denied("empty path".into()));
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(ServiceError::Denied(format!(
                        "path '{path}' leaves the plugin data directory"
                    )));
                }
            }
        }
        let root = self.plugin_root(plugin);
        let full = root.join(rel);
        // A symlink planted inside the data directory must not lead out of it.
        if let Ok(meta) = std::fs::symlink_metadata(&full) {
            if meta.file_type().is_symlink() {
                return Err(ServiceError::Denied(format!("path '{path}' is a symbolic link")));
            }
        }
        Ok(full)
    }
}

impl HostServices for ScopedServices {
    fn log(&self, plugin: &PluginId, message: &str) {
        info!(plugin = %plugin, "{}", message);
    }

    fn storage_get(&self, plugin: &PluginId, key: &str) -> Option<Vec<u8>> {
        self.storage.get(plugin).and_then(|m| m.get(key).cloned())
    }

    fn storage_set(&self, plugin: &PluginId, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        self.storage
            .entry(plugin.clone())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn read_file(&self, plugin: &PluginId, path: &str) -> Result<Vec<u8>, ServiceError> {
        let full = self.resolve(plugin, path)?;
        std::fs::read(&full).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ServiceError::NotFound,
            _ => ServiceError::Failed(e.to_string()),
        })
    }

    fn write_file(&self, plugin: &PluginId, path: &str, data: &[u8]) -> Result<(), ServiceError> {
        let full = self.resolve(plugin, path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ServiceError::Failed(e.to_string()))?;
        }
        std::fs::write(&full, data).map_err(|e| ServiceError::Failed(e.to_string()))
    }

    fn fetch(&self, plugin: &PluginId, url: &str) -> Result<Vec<u8>, ServiceError> {
        warn!(plugin = %plugin, url, "outbound fetch requested but no HTTP client is configured");
        Err(ServiceError::Failed("network fetch is not available on this host".into()))
    }

    fn notify(&self, plugin: &PluginId, message: &str) -> Result<(), ServiceError> {
        info!(plugin = %plugin, message, "plugin notification");
        self.notifications.lock().push((plugin.clone(), message.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> PluginId {
        PluginId::new("com.example.fs").unwrap()
    }

    #[test]
    fn files_stay_under_plugin_root() {
        let dir = tempfile::tempdir().unwrap();
        let svc = ScopedServices::new(dir.path());
        svc.write_file(&id(), "notes/a.txt", b"hi").unwrap();
        assert_eq!(svc.read_file(&id(), "./notes/a.txt").unwrap(), b"hi");
        assert!(dir.path().join("com.example.fs/notes/a.txt").exists());
    }

    #[test]
    fn escaping_paths_denied() {
        let dir = tempfile::tempdir().unwrap();
        let svc = ScopedServices::new(dir.path());
        for bad in ["../x", "/etc/passwd", "a/../../b", ""] {
            assert!(matches!(svc.write_file(&id(), bad, b"x"), Err(ServiceError::Denied(_))), "{bad}");
        }
    }

    #[test]
    fn storage_is_per_plugin() {
        let svc = ScopedServices::new("/nonexistent");
        let other = PluginId::new("com.example.other").unwrap();
        svc.storage_set(&id(), "k", b"v").unwrap();
        assert_eq!(svc.storage_get(&id(), "k"), Some(b"v".to_vec()));
        assert_eq!(svc.storage_get(&other, "k"), None);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let svc = ScopedServices::new(dir.path());
        assert!(matches!(svc.read_file(&id(), "nope.txt"), Err(ServiceError::NotFound)));
    }
}
