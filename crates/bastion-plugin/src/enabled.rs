//! Persisted, ordered set of enabled plugins.
//!
//! Same discipline as the grant table: the new list is written atomically
//! before it becomes visible, and a failed write reloads from disk.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use bastion_core::persist::write_atomic;
use bastion_core::{BastionError, PluginId, Result};

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct EnabledFile {
    schema_version: u32,
    #[serde(default)]
    enabled: Vec<String>,
}

pub struct EnabledSet {
    ids: Mutex<Vec<PluginId>>,
    path: Option<PathBuf>,
}

impl EnabledSet {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let ids = read_list(&path);
        info!(path = %path.display(), count = ids.len(), "enabled-set loaded");
        Self {
            ids: Mutex::new(ids),
            path: Some(path),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            ids: Mutex::new(Vec::new()),
            path: None,
        }
    }

    /// Enabled plugins in the order they were enabled.
    pub fn list(&self) -> Vec<PluginId> {
        self.ids.lock().clone()
    }

    pub fn contains(&self, id: &PluginId) -> bool {
        self.ids.lock().contains(id)
    }

    /// Append `id` if absent.
    pub fn insert(&self, id: &PluginId) -> Result<()> {
        self.update(|ids| {
            if ids.contains(id) {
                return false;
            }
            ids.push(id.clone());
            true
        })
    }

    pub fn remove(&self, id: &PluginId) -> Result<()> {
        self.update(|ids| {
            let before = ids.len();
            ids.retain(|x| x != id);
            ids.len() != before
        })
    }

    fn update(&self, f: impl FnOnce(&mut Vec<PluginId>) -> bool) -> Result<()> {
        let mut ids = self.ids.lock();
        let mut next = ids.clone();
        if !f(&mut next) {
            return Ok(());
        }
        if let Some(path) = &self.path {
            if let Err(e) = persist(path, &next) {
                error!(path = %path.display(), error = %e, "failed to persist enabled-set, reloading from disk");
                *ids = read_list(path);
                return Err(e);
            }
        }
        *ids = next;
        Ok(())
    }
}

fn persist(path: &Path, ids: &[PluginId]) -> Result<()> {
    let file = EnabledFile {
        schema_version: SCHEMA_VERSION,
        enabled: ids.iter().map(|id| id.to_string()).collect(),
    };
    let raw = toml::to_string_pretty(&file)
        .map_err(|e| BastionError::persistence(path, format!("failed to serialize enabled-set: {e}")))?;
    write_atomic(path, raw.as_bytes())
}

fn read_list(path: &Path) -> Vec<PluginId> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            error!(path = %path.display(), error = %e, "enabled-set unreadable, starting with nothing enabled");
            return Vec::new();
        }
    };
    let file: EnabledFile = match toml::from_str(&raw) {
        Ok(f) => f,
        Err(e) => {
            error!(path = %path.display(), error = %e, "enabled-set corrupt, starting with nothing enabled");
            return Vec::new();
        }
    };
    if file.schema_version != SCHEMA_VERSION {
        error!(path = %path.display(), found = file.schema_version, "unsupported enabled-set schema, starting with nothing enabled");
        return Vec::new();
    }

    let mut ids: Vec<PluginId> = Vec::new();
    for raw_id in file.enabled {
        match PluginId::new(raw_id.as_str()) {
            Ok(id) if !ids.contains(&id) => ids.push(id),
            Ok(_) => {}
            Err(_) => warn!(plugin = %raw_id, "dropping invalid plugin id from enabled-set"),
        }
    }
    ids
}
