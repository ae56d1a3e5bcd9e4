use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use dialoguer::Confirm;
use dialoguer::theme::ColorfulTheme;

use bastion_config::BastionConfig;
use bastion_core::{BastionError, Issue, IssueCode, PluginId};
use bastion_permissions::{AllowAll, ApprovalPolicy, InstallGrantOutcome, Permission};
use bastion_plugin::{
    CodeUnit, DirectoryRegistry, InstallReport, LifecycleManager, MirrorRepository, PackageRepository,
    ResourceCeiling, cpu_time_from_secs,
};

/// Asks on the terminal before granting a Sensitive or Critical permission.
struct PromptApprover;

impl ApprovalPolicy for PromptApprover {
    fn approve(&self, plugin: &PluginId, permission: &Permission) -> bool {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "{plugin} requests {} [{}]: {}. Grant?",
                permission.id, permission.risk, permission.description
            ))
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

/// Lifecycle manager with every installed package registered and the
/// persisted enabled-set restored.
fn manager(config: &BastionConfig) -> bastion_core::Result<LifecycleManager> {
    let manager = LifecycleManager::from_config(config)?;
    let report = manager.restore(&DirectoryRegistry::new(config.install_dir()))?;
    for (candidate, reasons) in &report.skipped {
        eprintln!("⚠️  skipped {candidate}: {}", reasons.join("; "));
    }
    Ok(manager)
}

fn plugin_id(id: &str) -> bastion_core::Result<PluginId> {
    PluginId::new(id)
}

fn print_issues(issues: &[Issue]) {
    for issue in issues {
        println!("    - {issue}");
    }
}

pub(super) fn cmd_validate(dir: &Path, json: bool) -> bastion_core::Result<()> {
    let outcome = bastion_plugin::validate(dir);
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if outcome.ok {
        if let Some(m) = &outcome.manifest {
            println!("✅ {} v{} is valid", m.id, m.version);
        }
    } else {
        println!("❌ {} failed validation:", dir.display());
        print_issues(&outcome.issues);
    }
    outcome.into_result(dir).map(|_| ())
}

fn approver(yes: bool) -> Box<dyn ApprovalPolicy> {
    if yes { Box::new(AllowAll) } else { Box::new(PromptApprover) }
}

fn print_install(report: &InstallReport) {
    println!("✅ Installed {} at {}", report.plugin, report.install_path.display());
    print_grants(&report.grants);
}

fn print_grants(grants: &InstallGrantOutcome) {
    if !grants.auto_granted.is_empty() {
        println!("  Auto-granted: {}", grants.auto_granted.join(", "));
    }
    if !grants.granted.is_empty() {
        println!("  Granted: {}", grants.granted.join(", "));
    }
    if !grants.declined.is_empty() {
        println!("  Declined: {}", grants.declined.join(", "));
        println!("  Calls needing a declined permission will fail with permission denied.");
    }
}

pub(super) fn cmd_install(config: &BastionConfig, dir: &Path, yes: bool) -> bastion_core::Result<()> {
    let manager = manager(config)?;
    let report = manager.install(dir, &*approver(yes))?;
    print_install(&report);
    Ok(())
}

pub(super) fn cmd_fetch(
    config: &BastionConfig,
    id: &str,
    version: Option<&str>,
    mirror: &Path,
    yes: bool,
) -> bastion_core::Result<()> {
    let id = plugin_id(id)?;
    let version = version
        .map(|v| {
            semver::Version::parse(v).map_err(|e| BastionError::Validation {
                plugin: id.to_string(),
                issues: vec![Issue::with_subject(
                    IssueCode::InvalidVersion,
                    "version",
                    format!("'{v}' is not a semantic version: {e}"),
                )],
            })
        })
        .transpose()?;

    let staging = tempfile::tempdir()?;
    let repo = MirrorRepository::new(mirror);
    let package = repo.fetch(&id, version.as_ref(), staging.path())?;

    let manager = manager(config)?;
    // Staged packages are copied into the install directory; the temp dir
    // is removed when `staging` drops.
    let report = manager.install(&package, &*approver(yes))?;
    print_install(&report);
    Ok(())
}

pub(super) fn cmd_enable(config: &BastionConfig, id: &str) -> bastion_core::Result<()> {
    let id = plugin_id(id)?;
    manager(config)?.enable(&id)?;
    println!("✅ Enabled {id}");
    Ok(())
}

pub(super) fn cmd_disable(config: &BastionConfig, id: &str) -> bastion_core::Result<()> {
    let id = plugin_id(id)?;
    manager(config)?.disable(&id)?;
    println!("✅ Disabled {id}");
    Ok(())
}

pub(super) fn cmd_uninstall(config: &BastionConfig, id: &str) -> bastion_core::Result<()> {
    let id = plugin_id(id)?;
    manager(config)?.uninstall(&id)?;
    println!("✅ Uninstalled {id}");
    Ok(())
}

pub(super) fn cmd_list(config: &BastionConfig, json: bool) -> bastion_core::Result<()> {
    let records = manager(config)?.list();
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No plugins installed.");
        return Ok(());
    }
    println!("{:<32} {:<10} {:<22} NAME", "ID", "VERSION", "STATE");
    for r in &records {
        println!(
            "{:<32} {:<10} {:<22} {}",
            r.manifest.id.as_str(),
            r.manifest.version.to_string(),
            r.state.to_string(),
            r.manifest.name
        );
    }
    Ok(())
}

pub(super) fn cmd_state(config: &BastionConfig, id: &str) -> bastion_core::Result<()> {
    let id = plugin_id(id)?;
    let manager = manager(config)?;
    let record = manager.record(&id)?;
    let m = &record.manifest;

    println!("\x1b[1m{}\x1b[0m v{} ({})", m.name, m.version, m.id);
    println!("  State: {}", record.state);
    if let Some(description) = &m.description {
        println!("  {description}");
    }
    if !m.authors.is_empty() {
        println!("  Authors: {}", m.authors.join(", "));
    }
    println!("  Requires host: >= {}", m.min_host_version);
    println!("  Installed: {} at {}", record.installed_at.to_rfc3339(), record.install_path.display());
    if !m.dependencies.is_empty() {
        let deps: Vec<String> = m
            .dependencies
            .iter()
            .map(|d| format!("{d} ({})", manager.state_of(d)))
            .collect();
        println!("  Dependencies: {}", deps.join(", "));
    }

    let granted = manager.permissions().granted(&id);
    println!("\n  \x1b[1mPermissions:\x1b[0m");
    for requested in &m.permissions {
        let mark = if granted.contains(requested) { "granted" } else { "not granted" };
        println!("    {requested}: {mark}");
    }
    for extra in granted.iter().filter(|g| !m.permissions.contains(g)) {
        println!("    {extra}: granted (not requested)");
    }

    if !record.last_validation.is_empty() {
        println!("\n  \x1b[1mLast validation:\x1b[0m");
        print_issues(&record.last_validation);
    }
    Ok(())
}

pub(super) struct RunArgs {
    pub entry: String,
    pub vars: Vec<(String, String)>,
    pub cpu_seconds: Option<f64>,
    pub memory_mb: Option<u64>,
    pub json: bool,
}

impl RunArgs {
    fn ceiling(&self, config: &BastionConfig) -> bastion_core::Result<ResourceCeiling> {
        let mut ceiling = ResourceCeiling::from_config(&config.sandbox)?;
        if let Some(secs) = self.cpu_seconds {
            ceiling.cpu_time = cpu_time_from_secs(secs)?;
        }
        if let Some(mb) = self.memory_mb {
            ceiling.memory_bytes = (mb as usize).saturating_mul(1024 * 1024);
        }
        Ok(ceiling)
    }

    /// Values that parse as JSON keep their type; anything else is a string.
    fn context(&self) -> BTreeMap<String, serde_json::Value> {
        self.vars
            .iter()
            .map(|(k, v)| {
                let value = serde_json::from_str(v).unwrap_or_else(|_| serde_json::Value::String(v.clone()));
                (k.clone(), value)
            })
            .collect()
    }
}

pub(super) async fn cmd_run(config: &BastionConfig, id: &str, args: RunArgs) -> bastion_core::Result<()> {
    let id = plugin_id(id)?;
    let manager = Arc::new(manager(config)?);
    let ceiling = args.ceiling(config)?;
    manager.load(&id)?;

    let result = manager
        .execute_async(id.clone(), CodeUnit::Entry(args.entry.clone()), args.context(), Some(ceiling))
        .await;

    // Auto-disable may already have unloaded the plugin.
    if let Err(e) = manager.unload(&id) {
        tracing::debug!(plugin = %id, error = %e, "unload after run skipped");
    }
    let result = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", result.output);
        if result.output_truncated {
            println!("\n[output truncated]");
        }
        for (name, value) in &result.bindings {
            println!("{name} = {value}");
        }
        tracing::info!(plugin = %id, elapsed_ms = result.elapsed.as_millis() as u64, "run finished");
    }

    match result.outcome {
        Ok(()) => Ok(()),
        Err(failure) => Err(BastionError::Sandbox {
            plugin: id.to_string(),
            reason: failure.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn args(vars: &[(&str, &str)]) -> RunArgs {
        RunArgs {
            entry: "run".into(),
            vars: vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            cpu_seconds: Some(0.25),
            memory_mb: None,
            json: false,
        }
    }

    #[test]
    fn run_vars_keep_json_types() {
        let ctx = args(&[("n", "3"), ("flag", "true"), ("name", "world"), ("list", "[1,2]")]).context();
        assert_eq!(ctx["n"], serde_json::json!(3));
        assert_eq!(ctx["flag"], serde_json::json!(true));
        assert_eq!(ctx["name"], serde_json::json!("world"));
        assert_eq!(ctx["list"], serde_json::json!([1, 2]));
    }

    #[test]
    fn run_ceiling_overrides_config() {
        let config = BastionConfig::default();
        let ceiling = args(&[]).ceiling(&config).unwrap();
        assert_eq!(ceiling.cpu_time, Duration::from_millis(250));
        assert_eq!(
            ceiling.memory_bytes,
            ResourceCeiling::from_config(&config.sandbox).unwrap().memory_bytes
        );
    }

    #[test]
    fn run_rejects_unreasonable_cpu_override() {
        let config = BastionConfig::default();
        let mut run = args(&[]);
        run.cpu_seconds = Some(1e20);
        assert!(matches!(run.ceiling(&config), Err(BastionError::Config(_))));
    }
}
