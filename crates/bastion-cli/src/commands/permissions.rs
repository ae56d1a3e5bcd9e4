use serde_json::json;

use bastion_config::BastionConfig;
use bastion_core::{BastionError, PluginId};
use bastion_permissions::{PermissionStore, catalog};
use bastion_plugin::{DirectoryRegistry, LifecycleManager};

fn store(config: &BastionConfig) -> PermissionStore {
    PermissionStore::load(config.grants_file())
}

pub(super) fn cmd_grant(config: &BastionConfig, id: &str, permission: &str) -> bastion_core::Result<()> {
    let id = PluginId::new(id)?;
    let entry = catalog::lookup(permission).ok_or_else(|| BastionError::UnknownPermission(permission.to_string()))?;
    if config.permissions.never_grant.iter().any(|n| n == permission) {
        return Err(BastionError::Config(format!(
            "{permission} is listed in permissions.never_grant"
        )));
    }

    let manager = LifecycleManager::from_config(config)?;
    manager.restore(&DirectoryRegistry::new(config.install_dir()))?;
    let record = manager.record(&id)?;
    if !record.manifest.permissions.iter().any(|p| p == permission) {
        println!("⚠️  {id} does not request {permission}; granting anyway");
    }

    if manager.permissions().grant(&id, permission)? {
        println!("✅ Granted {permission} [{}] to {id}", entry.risk);
    } else {
        println!("{id} already holds {permission}");
    }
    Ok(())
}

/// Revocation works for plugins that are no longer installed too, so stale
/// grants can be cleaned up by hand.
pub(super) fn cmd_revoke(config: &BastionConfig, id: &str, permission: &str) -> bastion_core::Result<()> {
    let id = PluginId::new(id)?;
    if store(config).revoke(&id, permission)? {
        println!("✅ Revoked {permission} from {id}");
    } else {
        println!("{id} does not hold {permission}");
    }
    Ok(())
}

pub(super) fn cmd_permissions(config: &BastionConfig, json: bool) -> bastion_core::Result<()> {
    let grants = store(config).snapshot();
    if json {
        let out = json!({
            "catalog": catalog::all(),
            "grants": grants,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("\x1b[1mCatalog:\x1b[0m");
    for p in catalog::all() {
        let blocked = if config.permissions.never_grant.iter().any(|n| n == p.id) {
            " (never granted)"
        } else {
            ""
        };
        println!("  {:<20} {:<10} {}{blocked}", p.id, p.risk.to_string(), p.description);
    }

    println!("\n\x1b[1mGrants:\x1b[0m");
    if grants.is_empty() {
        println!("  (none)");
    }
    for (plugin, permissions) in &grants {
        println!("  {plugin}: {}", permissions.join(", "));
    }
    Ok(())
}
