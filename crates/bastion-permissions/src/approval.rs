use serde::Serialize;
use tracing::{info, warn};

use bastion_config::PermissionsConfig;
use bastion_core::{BastionError, PluginId, Result};

use crate::catalog::{self, Permission};
use crate::store::PermissionStore;

/// Decides whether a Sensitive or Critical permission may be granted.
///
/// Implemented for any `Fn(&PluginId, &Permission) -> bool`, so tests and
/// embedders can pass a closure; the CLI supplies an interactive prompt.
pub trait ApprovalPolicy: Send + Sync {
    fn approve(&self, plugin: &PluginId, permission: &Permission) -> bool;
}

impl<F> ApprovalPolicy for F
where
    F: Fn(&PluginId, &Permission) -> bool + Send + Sync,
{
    fn approve(&self, plugin: &PluginId, permission: &Permission) -> bool {
        self(plugin, permission)
    }
}

/// Approves everything.
pub struct AllowAll;

impl ApprovalPolicy for AllowAll {
    fn approve(&self, _: &PluginId, _: &Permission) -> bool {
        true
    }
}

/// Approves nothing.
pub struct DenyAll;

impl ApprovalPolicy for DenyAll {
    fn approve(&self, _: &PluginId, _: &Permission) -> bool {
        false
    }
}

/// What happened to each requested permission at install time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallGrantOutcome {
    /// Normal-risk permissions granted without asking.
    pub auto_granted: Vec<String>,
    /// Permissions granted after approval.
    pub granted: Vec<String>,
    /// Permissions the approver or `never_grant` turned down.
    pub declined: Vec<String>,
}

impl InstallGrantOutcome {
    pub fn all_granted(&self) -> impl Iterator<Item = &String> {
        self.auto_granted.iter().chain(self.granted.iter())
    }
}

/// Grant the permissions a newly installed plugin requests.
///
/// Declined permissions are not an error: the plugin installs, and any gated
/// call needing them is denied at run time. If persisting a grant fails,
/// grants made by this call are revoked before the error is returned.
pub fn apply_install_policy(
    store: &PermissionStore,
    plugin: &PluginId,
    requested: &[String],
    approver: &dyn ApprovalPolicy,
    config: &PermissionsConfig,
) -> Result<InstallGrantOutcome> {
    let mut outcome = InstallGrantOutcome::default();
    let mut newly_granted: Vec<&str> = Vec::new();

    for id in requested {
        let permission =
            catalog::lookup(id).ok_or_else(|| BastionError::UnknownPermission(id.clone()))?;

        if config.never_grant.iter().any(|n| n == id) {
            warn!(plugin = %plugin, permission = %id, "permission blocked by never_grant policy");
            outcome.declined.push(id.clone());
            continue;
        }

        let auto = !permission.risk.requires_approval() && config.auto_grant_normal;
        if !auto && !approver.approve(plugin, permission) {
            info!(plugin = %plugin, permission = %id, risk = %permission.risk, "permission declined");
            outcome.declined.push(id.clone());
            continue;
        }

        match store.grant(plugin, id) {
            Ok(changed) => {
                if changed {
                    newly_granted.push(id.as_str());
                }
                if auto {
                    outcome.auto_granted.push(id.clone());
                } else {
                    outcome.granted.push(id.clone());
                }
            }
            Err(e) => {
                for g in &newly_granted {
                    if let Err(re) = store.revoke(plugin, g) {
                        warn!(plugin = %plugin, permission = %g, error = %re, "rollback revoke failed");
                    }
                }
                return Err(e);
            }
        }
    }

    info!(
        plugin = %plugin,
        auto = outcome.auto_granted.len(),
        approved = outcome.granted.len(),
        declined = outcome.declined.len(),
        "install grant policy applied"
    );
    Ok(outcome)
}
