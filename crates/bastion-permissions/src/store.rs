//! Durable grant table.
//!
//! Readers go through a read lock on an `Arc` snapshot. Writers are
//! serialized by a separate mutex, build the next table off to the side,
//! persist it, and only then swap it in. A failed write never becomes
//! visible: the in-memory table is reloaded from disk instead.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use bastion_core::persist::write_atomic;
use bastion_core::{BastionError, PluginId, Result};

use crate::catalog;

const SCHEMA_VERSION: u32 = 1;

type GrantTable = BTreeMap<String, BTreeSet<String>>;

/// On-disk representation of the grant table.
#[derive(Debug, Default, Serialize, Deserialize)]
struct GrantFile {
    schema_version: u32,
    #[serde(default)]
    grants: GrantTable,
}

pub struct PermissionStore {
    table: RwLock<Arc<GrantTable>>,
    writer: Mutex<()>,
    /// `None` keeps the table in memory only.
    path: Option<PathBuf>,
}

impl PermissionStore {
    /// Load the grant table from `path`. A missing file is an empty table;
    /// an unreadable or corrupt one is logged and also treated as empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let table = read_table(&path);
        info!(path = %path.display(), plugins = table.len(), "permission store loaded");
        Self {
            table: RwLock::new(Arc::new(table)),
            writer: Mutex::new(()),
            path: Some(path),
        }
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            table: RwLock::new(Arc::new(GrantTable::new())),
            writer: Mutex::new(()),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether `plugin` currently holds `permission`.
    pub fn has(&self, plugin: &PluginId, permission: &str) -> bool {
        self.table
            .read()
            .get(plugin.as_str())
            .is_some_and(|set| set.contains(permission))
    }

    /// Sorted permissions currently granted to `plugin`.
    pub fn granted(&self, plugin: &PluginId) -> Vec<String> {
        self.table
            .read()
            .get(plugin.as_str())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every plugin with at least one grant.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.table
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
            .collect()
    }

    /// Grant `permission` to `plugin`. Returns `false` if it was already held.
    pub fn grant(&self, plugin: &PluginId, permission: &str) -> Result<bool> {
        if !catalog::is_known(permission) {
            return Err(BastionError::UnknownPermission(permission.to_string()));
        }
        let changed = self.mutate(|table| {
            table
                .entry(plugin.to_string())
                .or_default()
                .insert(permission.to_string())
        })?;
        if changed {
            info!(plugin = %plugin, permission, "permission granted");
        }
        Ok(changed)
    }

    /// Revoke `permission` from `plugin`. Returns `false` if it was not held.
    pub fn revoke(&self, plugin: &PluginId, permission: &str) -> Result<bool> {
        let changed = self.mutate(|table| {
            let Some(set) = table.get_mut(plugin.as_str()) else {
                return false;
            };
            let removed = set.remove(permission);
            if set.is_empty() {
                table.remove(plugin.as_str());
            }
            removed
        })?;
        if changed {
            info!(plugin = %plugin, permission, "permission revoked");
        }
        Ok(changed)
    }

    /// Drop every grant held by `plugin`, returning what was removed.
    pub fn revoke_all(&self, plugin: &PluginId) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        self.mutate(|table| match table.remove(plugin.as_str()) {
            Some(set) => {
                removed = set.into_iter().collect();
                true
            }
            None => false,
        })?;
        if !removed.is_empty() {
            info!(plugin = %plugin, count = removed.len(), "all permissions revoked");
        }
        Ok(removed)
    }

    /// Replace the in-memory table with what is on disk.
    pub fn reload(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let _w = self.writer.lock();
        *self.table.write() = Arc::new(read_table(path));
        debug!(path = %path.display(), "permission store reloaded");
    }

    /// Apply `f` to a copy of the table; persist and publish if it reports a change.
    fn mutate(&self, f: impl FnOnce(&mut GrantTable) -> bool) -> Result<bool> {
        let _w = self.writer.lock();
        let current = Arc::clone(&self.table.read());
        let mut next = (*current).clone();
        if !f(&mut next) {
            return Ok(false);
        }

        if let Some(path) = &self.path {
            if let Err(e) = persist(path, &next) {
                error!(path = %path.display(), error = %e, "failed to persist grant table, reloading from disk");
                *self.table.write() = Arc::new(read_table(path));
                return Err(e);
            }
        }

        *self.table.write() = Arc::new(next);
        Ok(true)
    }
}

fn persist(path: &Path, table: &GrantTable) -> Result<()> {
    let file = GrantFile {
        schema_version: SCHEMA_VERSION,
        grants: table.clone(),
    };
    let raw = toml::to_string_pretty(&file)
        .map_err(|e| BastionError::persistence(path, format!("failed to serialize grants: {e}")))?;
    write_atomic(path, raw.as_bytes())
}

/// Read the grant file, degrading to an empty table on any problem.
fn read_table(path: &Path) -> GrantTable {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return GrantTable::new(),
        Err(e) => {
            error!(path = %path.display(), error = %e, "grant file unreadable, starting with no grants");
            return GrantTable::new();
        }
    };

    let file: GrantFile = match toml::from_str(&raw) {
        Ok(f) => f,
        Err(e) => {
            error!(path = %path.display(), error = %e, "grant file corrupt, starting with no grants");
            return GrantTable::new();
        }
    };

    if file.schema_version != SCHEMA_VERSION {
        error!(
            path = %path.display(),
            found = file.schema_version,
            expected = SCHEMA_VERSION,
            "unsupported grant file schema, starting with no grants"
        );
        return GrantTable::new();
    }

    let mut table = GrantTable::new();
    for (plugin, perms) in file.grants {
        if !PluginId::is_valid(&plugin) {
            warn!(plugin = %plugin, "dropping grants for invalid plugin id");
            continue;
        }
        let known: BTreeSet<String> = perms
            .into_iter()
            .filter(|p| {
                let ok = catalog::is_known(p);
                if !ok {
                    warn!(plugin = %plugin, permission = %p, "dropping grant for unknown permission");
                }
                ok
            })
            .collect();
        if !known.is_empty() {
            table.insert(plugin, known);
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PluginId {
        PluginId::new(s).unwrap()
    }

    #[test]
    fn grant_then_has() {
        let store = PermissionStore::in_memory();
        let p = id("com.example.a");
        assert!(!store.has(&p, "log.write"));
        assert!(store.grant(&p, "log.write").unwrap());
        assert!(store.has(&p, "log.write"));
        assert!(!store.has(&id("com.example.b"), "log.write"));
    }

    #[test]
    fn revoke_removes_empty_entries() {
        let store = PermissionStore::in_memory();
        let p = id("com.example.a");
        store.grant(&p, "log.write").unwrap();
        assert!(store.revoke(&p, "log.write").unwrap());
        assert!(store.snapshot().is_empty());
        assert!(!store.revoke(&p, "log.write").unwrap());
    }

    #[test]
    fn unknown_permission_rejected() {
        let store = PermissionStore::in_memory();
        let err = store.grant(&id("com.example.a"), "fs.delete").unwrap_err();
        assert!(matches!(err, BastionError::UnknownPermission(ref p) if p == "fs.delete"));
    }

    #[test]
    fn schema_mismatch_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grants.toml");
        std::fs::write(&path, "schema_version = 99\n[grants]\n\"com.example.a\" = [\"log.write\"]\n").unwrap();
        let store = PermissionStore::load(&path);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn unknown_entries_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grants.toml");
        std::fs::write(
            &path,
            "schema_version = 1\n[grants]\n\"com.example.a\" = [\"log.write\", \"bogus.perm\"]\n\"../evil\" = [\"fs.write\"]\n",
        )
        .unwrap();
        let store = PermissionStore::load(&path);
        let snap = store.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap["com.example.a"], vec!["log.write".to_string()]);
    }
}
