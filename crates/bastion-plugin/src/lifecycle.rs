//! Plugin lifecycle state machine.
//!
//! ```text
//! NotInstalled ─install─▶ Disabled ─enable─▶ Enabled ─load─▶ Loaded
//!       ▲                  │  ▲               │  ▲            │
//!       └────uninstall─────┘  └────disable────┘  └───unload───┘
//! ```
//!
//! Every transition re-checks its guard against current record state and
//! either completes or leaves the record untouched. Transitions on one
//! plugin are serialized by a per-plugin mutex; different plugins proceed
//! concurrently.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use semver::Version;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use bastion_config::{BastionConfig, PermissionsConfig, SandboxConfig};
use bastion_core::{BastionError, Issue, IssueCode, LifecycleState, PluginId, Result, host_version_satisfies};
use bastion_permissions::{ApprovalPolicy, InstallGrantOutcome, PermissionStore, apply_install_policy};

use crate::deps::{self, DependencyGraph};
use crate::enabled::EnabledSet;
use crate::manifest::PluginManifest;
use crate::registry::{PluginRegistry, copy_package};
use crate::sandbox::services::HostServices;
use crate::sandbox::{
    CodeUnit, ExecutionRequest, ExecutionResult, ResourceCeiling, SandboxExecutor, SandboxFailure, SandboxOptions,
    ScopedServices,
};
use crate::validator;

/// Version of this host build, used unless `host.version` overrides it.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long a graceful unload waits for cancelled executions to stop.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Host-side record of one installed plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginRecord {
    pub manifest: PluginManifest,
    pub install_path: PathBuf,
    pub state: LifecycleState,
    /// Issues from the most recent validation; empty when it passed.
    pub last_validation: Vec<Issue>,
    pub installed_at: DateTime<Utc>,
    /// The package lives in the managed install directory and is removed
    /// on uninstall.
    pub managed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub plugin: PluginId,
    pub install_path: PathBuf,
    pub grants: InstallGrantOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub registered: Vec<PluginId>,
    pub enabled: Vec<PluginId>,
    /// Candidate package (or enabled-set entry) → reasons it was skipped.
    pub skipped: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub host_version: Version,
    /// Managed directory packages are copied into on install. `None`
    /// registers packages where they are.
    pub install_dir: Option<PathBuf>,
    pub permissions: PermissionsConfig,
    /// Ceiling applied when `execute` is not given one.
    pub default_ceiling: ResourceCeiling,
    /// ResourceExceeded results before auto-disable; 0 never disables.
    pub max_violations: u32,
}

impl LifecycleOptions {
    pub fn from_config(config: &BastionConfig) -> Result<Self> {
        let raw = config.host.version.as_deref().unwrap_or(HOST_VERSION);
        let host_version = Version::parse(raw)
            .map_err(|e| BastionError::Config(format!("host.version '{raw}' is not a semantic version: {e}")))?;
        Ok(Self {
            host_version,
            install_dir: Some(config.install_dir()),
            permissions: config.permissions.clone(),
            default_ceiling: ResourceCeiling::from_config(&config.sandbox)?,
            max_violations: config.sandbox.max_violations,
        })
    }
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            host_version: Version::parse(HOST_VERSION).unwrap_or_else(|_| Version::new(0, 1, 0)),
            install_dir: None,
            permissions: PermissionsConfig::default(),
            default_ceiling: ResourceCeiling::default(),
            max_violations: SandboxConfig::default().max_violations,
        }
    }
}

pub struct LifecycleManager {
    records: RwLock<BTreeMap<PluginId, PluginRecord>>,
    locks: DashMap<PluginId, Arc<Mutex<()>>>,
    permissions: Arc<PermissionStore>,
    sandbox: Arc<SandboxExecutor>,
    enabled: EnabledSet,
    options: LifecycleOptions,
}

impl LifecycleManager {
    pub fn new(
        permissions: Arc<PermissionStore>,
        sandbox: Arc<SandboxExecutor>,
        enabled: EnabledSet,
        options: LifecycleOptions,
    ) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            locks: DashMap::new(),
            permissions,
            sandbox,
            enabled,
            options,
        }
    }

    /// Wire a manager from config: grant table, enabled-set and sandbox
    /// with filesystem-scoped host services.
    pub fn from_config(config: &BastionConfig) -> Result<Self> {
        let options = LifecycleOptions::from_config(config)?;
        let permissions = Arc::new(PermissionStore::load(config.grants_file()));
        let services: Arc<dyn HostServices> = Arc::new(ScopedServices::new(config.plugin_data_dir()));
        let sandbox = Arc::new(SandboxExecutor::new(
            Arc::clone(&permissions),
            services,
            SandboxOptions::from_config(&config.sandbox),
        )?);
        let enabled = EnabledSet::load(config.enabled_file());
        Ok(Self::new(permissions, sandbox, enabled, options))
    }

    pub fn permissions(&self) -> &Arc<PermissionStore> {
        &self.permissions
    }

    pub fn sandbox(&self) -> &Arc<SandboxExecutor> {
        &self.sandbox
    }

    pub fn host_version(&self) -> &Version {
        &self.options.host_version
    }

    // ── Queries ────────────────────────────────────────────────

    pub fn state_of(&self, id: &PluginId) -> LifecycleState {
        self.records
            .read()
            .get(id)
            .map_or(LifecycleState::NotInstalled, |r| r.state)
    }

    pub fn record(&self, id: &PluginId) -> Result<PluginRecord> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BastionError::NotInstalled(id.to_string()))
    }

    pub fn list(&self) -> Vec<PluginRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Persisted enabled-set, in enable order.
    pub fn enabled_order(&self) -> Vec<PluginId> {
        self.enabled.list()
    }

    // ── Install / uninstall ────────────────────────────────────

    /// Validate and register a package as Installed(Disabled), granting
    /// its requested permissions through the install policy.
    pub fn install(&self, package_dir: &Path, approver: &dyn ApprovalPolicy) -> Result<InstallReport> {
        let manifest = validator::validate(package_dir).into_result(package_dir)?;
        let id = manifest.id.clone();
        let lock = self.lock_for(&id);
        let _serial = lock.lock();

        let issues = self.install_issues(&self.records.read(), &manifest);
        if !issues.is_empty() {
            return Err(rejected(&id, "install", issues));
        }

        let (install_path, managed, copied) = self.place(&id, package_dir)?;
        let discard_copy = || {
            if copied {
                remove_quietly(&install_path);
            }
        };

        let grants = match apply_install_policy(
            &self.permissions,
            &id,
            &manifest.permissions,
            approver,
            &self.options.permissions,
        ) {
            Ok(g) => g,
            Err(e) => {
                discard_copy();
                return Err(e);
            }
        };

        {
            let mut records = self.records.write();
            // Another plugin may have been installed since the first check.
            let issues = self.install_issues(&records, &manifest);
            if !issues.is_empty() {
                drop(records);
                if let Err(e) = self.permissions.revoke_all(&id) {
                    error!(plugin = %id, error = %e, "failed to roll back grants of rejected install");
                }
                discard_copy();
                return Err(rejected(&id, "install", issues));
            }
            records.insert(
                id.clone(),
                PluginRecord {
                    manifest: manifest.clone(),
                    install_path: install_path.clone(),
                    state: LifecycleState::Disabled,
                    last_validation: Vec::new(),
                    installed_at: Utc::now(),
                    managed,
                },
            );
        }

        info!(
            plugin = %id,
            version = %manifest.version,
            path = %install_path.display(),
            granted = grants.all_granted().count(),
            declined = grants.declined.len(),
            "plugin installed"
        );
        Ok(InstallReport {
            plugin: id,
            install_path,
            grants,
        })
    }

    /// Remove a Disabled plugin: its grants, its managed copy and its record.
    pub fn uninstall(&self, id: &PluginId) -> Result<()> {
        let lock = self.lock_for(id);
        let _serial = lock.lock();
        let record = self.require(id, "uninstall", &[LifecycleState::Disabled])?;

        let dependents = deps::dependents(&graph_of(&self.records.read()), id);
        if !dependents.is_empty() {
            warn!(
                plugin = %id,
                dependents = %dependents.iter().map(PluginId::as_str).collect::<Vec<_>>().join(", "),
                "uninstalling a plugin other installed plugins depend on"
            );
        }

        self.permissions.revoke_all(id)?;
        if record.managed {
            remove_quietly(&record.install_path);
        }
        self.records.write().remove(id);
        self.sandbox.reset_violations(id);
        info!(plugin = %id, "plugin uninstalled");
        Ok(())
    }

    // ── Enable / disable ───────────────────────────────────────

    pub fn enable(&self, id: &PluginId) -> Result<()> {
        let lock = self.lock_for(id);
        let _serial = lock.lock();
        let record = self.require(id, "enable", &[LifecycleState::Disabled])?;
        let manifest = self.revalidate(&record, "enable")?;

        let mut issues = self.version_issues(&manifest);
        {
            let records = self.records.read();
            for dep in &manifest.dependencies {
                if !records.contains_key(dep) {
                    issues.push(Issue::with_subject(
                        IssueCode::DependencyMissing,
                        dep.as_str(),
                        format!("dependency {dep} is not installed"),
                    ));
                }
            }
        }
        if !issues.is_empty() {
            return Err(rejected(id, "enable", issues));
        }

        self.enabled.insert(id)?;
        self.update(id, |r| {
            r.state = LifecycleState::Enabled;
            r.manifest = manifest;
        });
        info!(plugin = %id, "plugin enabled");
        Ok(())
    }

    /// Return an Enabled or Loaded plugin to Installed(Disabled). A Loaded
    /// plugin is unloaded first and the whole call fails if that does.
    pub fn disable(&self, id: &PluginId) -> Result<()> {
        let lock = self.lock_for(id);
        let _serial = lock.lock();
        let record = self.require(id, "disable", &[LifecycleState::Enabled, LifecycleState::Loaded])?;

        if record.state == LifecycleState::Loaded {
            self.sandbox.unload(id)?;
            self.update(id, |r| r.state = LifecycleState::Enabled);
        }
        // On failure the record stays Enabled, matching the enabled-set on disk.
        self.enabled.remove(id)?;
        self.update(id, |r| r.state = LifecycleState::Disabled);
        info!(plugin = %id, "plugin disabled");
        Ok(())
    }

    // ── Load / unload ──────────────────────────────────────────

    pub fn load(&self, id: &PluginId) -> Result<()> {
        let lock = self.lock_for(id);
        let _serial = lock.lock();
        let record = self.require(id, "load", &[LifecycleState::Enabled])?;
        let manifest = self.revalidate(&record, "load")?;

        let mut issues = self.version_issues(&manifest);
        {
            let records = self.records.read();
            for dep in &manifest.dependencies {
                match records.get(dep).map(|r| r.state) {
                    None => issues.push(Issue::with_subject(
                        IssueCode::DependencyMissing,
                        dep.as_str(),
                        format!("dependency {dep} is not installed"),
                    )),
                    Some(state) if !state.is_active() => issues.push(Issue::with_subject(
                        IssueCode::DependencyNotEnabled,
                        dep.as_str(),
                        format!("dependency {dep} is {state}, needs to be enabled or loaded"),
                    )),
                    Some(_) => {}
                }
            }
        }
        if !issues.is_empty() {
            return Err(rejected(id, "load", issues));
        }

        let code = std::fs::read(manifest.entry_path(&record.install_path))?;
        // The entry could have changed between validation and this read.
        if !manifest.verify_checksum(&code) {
            return Err(rejected(
                id,
                "load",
                vec![Issue::with_subject(
                    IssueCode::ChecksumMismatch,
                    manifest.entry.clone(),
                    "entry code unit changed after validation",
                )],
            ));
        }
        self.sandbox.load(id, &code)?;
        self.sandbox.reset_violations(id);
        self.update(id, |r| {
            r.state = LifecycleState::Loaded;
            r.manifest = manifest;
        });
        info!(plugin = %id, "plugin loaded");
        Ok(())
    }

    /// Unload immediately; fails with `Busy` while executions are in flight.
    pub fn unload(&self, id: &PluginId) -> Result<()> {
        let lock = self.lock_for(id);
        let _serial = lock.lock();
        self.require(id, "unload", &[LifecycleState::Loaded])?;
        self.sandbox.unload(id)?;
        self.update(id, |r| r.state = LifecycleState::Enabled);
        info!(plugin = %id, "plugin unloaded");
        Ok(())
    }

    /// Wait up to `grace` for in-flight executions, cancel whatever is still
    /// running, then unload.
    pub fn unload_graceful(&self, id: &PluginId, grace: Duration) -> Result<()> {
        let lock = self.lock_for(id);
        let _serial = lock.lock();
        self.require(id, "unload", &[LifecycleState::Loaded])?;

        if !self.sandbox.wait_idle(id, grace) {
            let cancelled = self.sandbox.cancel(id);
            warn!(plugin = %id, cancelled, grace_ms = grace.as_millis() as u64, "grace period elapsed, cancelling executions");
            if !self.sandbox.wait_idle(id, CANCEL_GRACE) {
                return Err(BastionError::Busy {
                    plugin: id.to_string(),
                    in_flight: self.sandbox.in_flight(id),
                });
            }
        }
        self.sandbox.unload(id)?;
        self.update(id, |r| r.state = LifecycleState::Enabled);
        info!(plugin = %id, "plugin unloaded");
        Ok(())
    }

    // ── Execution ──────────────────────────────────────────────

    /// Run a code unit of a Loaded plugin. Sandbox failures are reported in
    /// the result; only a non-Loaded plugin is an error.
    pub fn execute(
        &self,
        id: &PluginId,
        code: CodeUnit,
        context: BTreeMap<String, serde_json::Value>,
        ceiling: Option<ResourceCeiling>,
    ) -> Result<ExecutionResult> {
        let state = self.state_of(id);
        if state != LifecycleState::Loaded {
            return Err(BastionError::StateGuard {
                plugin: id.to_string(),
                action: "execute".into(),
                state: state.to_string(),
            });
        }

        let mut request = ExecutionRequest::new(id.clone(), code, ceiling.unwrap_or(self.options.default_ceiling));
        request.context = context;
        let result = self.sandbox.execute(request);

        if matches!(result.outcome, Err(SandboxFailure::ResourceExceeded { .. })) {
            self.enforce_violation_limit(id);
        }
        Ok(result)
    }

    /// [`execute`](Self::execute) on the tokio blocking pool.
    pub async fn execute_async(
        self: &Arc<Self>,
        id: PluginId,
        code: CodeUnit,
        context: BTreeMap<String, serde_json::Value>,
        ceiling: Option<ResourceCeiling>,
    ) -> Result<ExecutionResult> {
        let this = Arc::clone(self);
        let plugin = id.to_string();
        tokio::task::spawn_blocking(move || this.execute(&id, code, context, ceiling))
            .await
            .map_err(|e| BastionError::Sandbox {
                plugin,
                reason: format!("execution task failed: {e}"),
            })?
    }

    fn enforce_violation_limit(&self, id: &PluginId) {
        let max = self.options.max_violations;
        let count = self.sandbox.violations(id);
        if max == 0 || count < max {
            return;
        }
        warn!(plugin = %id, violations = count, max, "violation limit reached, disabling plugin");
        if let Err(e) = self.disable(id) {
            error!(plugin = %id, error = %e, "failed to auto-disable plugin");
        }
    }

    // ── Startup ────────────────────────────────────────────────

    /// Register every valid package the registry yields as Disabled, then
    /// re-enable the persisted enabled-set in order. Entries that no longer
    /// pass their guards are dropped from the set.
    pub fn restore(&self, registry: &dyn PluginRegistry) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();

        for path in registry.candidates()? {
            let label = path.display().to_string();
            let manifest = match validator::validate(&path).into_result(&path) {
                Ok(m) => m,
                Err(e) => {
                    warn!(package = %label, error = %e, "skipping invalid package during restore");
                    report.skipped.push((label, e.reasons()));
                    continue;
                }
            };
            let id = manifest.id.clone();
            let lock = self.lock_for(&id);
            let _serial = lock.lock();

            let mut records = self.records.write();
            let issues = self.install_issues(&records, &manifest);
            if !issues.is_empty() {
                debug!(plugin = %id, package = %label, "package not registered during restore");
                report.skipped.push((label, issues.iter().map(|i| i.to_string()).collect()));
                continue;
            }
            let managed = self
                .options
                .install_dir
                .as_ref()
                .is_some_and(|dir| path.starts_with(dir));
            records.insert(
                id.clone(),
                PluginRecord {
                    manifest,
                    install_path: path,
                    state: LifecycleState::Disabled,
                    last_validation: Vec::new(),
                    installed_at: Utc::now(),
                    managed,
                },
            );
            report.registered.push(id);
        }

        for id in self.enabled.list() {
            match self.enable(&id) {
                Ok(()) => report.enabled.push(id),
                Err(e) => {
                    warn!(plugin = %id, error = %e, "dropping plugin from enabled-set during restore");
                    report.skipped.push((id.to_string(), e.reasons()));
                    if let Err(e) = self.enabled.remove(&id) {
                        error!(plugin = %id, error = %e, "failed to drop plugin from enabled-set");
                    }
                }
            }
        }

        info!(
            registered = report.registered.len(),
            enabled = report.enabled.len(),
            skipped = report.skipped.len(),
            "lifecycle state restored"
        );
        Ok(report)
    }

    // ── Helpers ────────────────────────────────────────────────

    fn lock_for(&self, id: &PluginId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id.clone()).or_default().value())
    }

    fn require(&self, id: &PluginId, action: &str, allowed: &[LifecycleState]) -> Result<PluginRecord> {
        let records = self.records.read();
        match records.get(id) {
            Some(r) if allowed.contains(&r.state) => Ok(r.clone()),
            other => Err(BastionError::StateGuard {
                plugin: id.to_string(),
                action: action.into(),
                state: other
                    .map_or(LifecycleState::NotInstalled, |r| r.state)
                    .to_string(),
            }),
        }
    }

    fn update(&self, id: &PluginId, f: impl FnOnce(&mut PluginRecord)) {
        if let Some(record) = self.records.write().get_mut(id) {
            f(record);
        }
    }

    /// Re-run validation on the installed package and check that it is
    /// still the package that was installed.
    fn revalidate(&self, record: &PluginRecord, action: &str) -> Result<PluginManifest> {
        let id = &record.manifest.id;
        let outcome = validator::validate_with_grants(&record.install_path, &self.permissions.granted(id));
        let issues = outcome.issues.clone();
        self.update(id, |r| r.last_validation = issues);
        let manifest = outcome.into_result(&record.install_path)?;

        if manifest.identity() != record.manifest.identity() {
            return Err(rejected(
                id,
                action,
                vec![Issue::with_subject(
                    IssueCode::IdentityChanged,
                    "plugin",
                    format!(
                        "package now declares {} {}, installed as {} {}",
                        manifest.id, manifest.version, record.manifest.id, record.manifest.version
                    ),
                )],
            ));
        }
        Ok(manifest)
    }

    fn version_issues(&self, manifest: &PluginManifest) -> Vec<Issue> {
        if host_version_satisfies(&self.options.host_version, &manifest.min_host_version) {
            return Vec::new();
        }
        vec![Issue::with_subject(
            IssueCode::IncompatibleHost,
            "plugin.min_host_version",
            format!(
                "requires host {} or newer, running {}",
                manifest.min_host_version, self.options.host_version
            ),
        )]
    }

    fn install_issues(&self, records: &BTreeMap<PluginId, PluginRecord>, manifest: &PluginManifest) -> Vec<Issue> {
        let id = &manifest.id;
        let mut issues = Vec::new();
        if let Some(existing) = records.get(id) {
            issues.push(Issue::with_subject(
                IssueCode::AlreadyInstalled,
                id.as_str(),
                format!("{id} {} is already installed ({})", existing.manifest.version, existing.state),
            ));
        }
        if let Some(cycle) = deps::find_cycle(&graph_of(records), id, &manifest.dependencies) {
            issues.push(Issue::with_subject(
                IssueCode::DependencyCycle,
                "dependencies",
                format!("dependency cycle: {}", deps::format_path(&cycle)),
            ));
        }
        issues
    }

    /// Copy the package into the managed install directory through a
    /// staging directory and a rename. Returns (location, managed, copied).
    fn place(&self, id: &PluginId, package_dir: &Path) -> Result<(PathBuf, bool, bool)> {
        let Some(install_dir) = &self.options.install_dir else {
            return Ok((package_dir.to_path_buf(), false, false));
        };
        let target = install_dir.join(id.as_str());
        let source = std::fs::canonicalize(package_dir)?;
        if std::fs::canonicalize(&target).is_ok_and(|t| t == source) {
            return Ok((target, true, false));
        }

        std::fs::create_dir_all(install_dir)?;
        let staging = install_dir.join(format!(".staging-{id}-{}", uuid::Uuid::new_v4().simple()));
        if let Err(e) = copy_package(&source, &staging) {
            remove_quietly(&staging);
            return Err(e.into());
        }
        if target.exists() {
            warn!(plugin = %id, path = %target.display(), "replacing leftover package directory");
            if let Err(e) = std::fs::remove_dir_all(&target) {
                remove_quietly(&staging);
                return Err(e.into());
            }
        }
        if let Err(e) = std::fs::rename(&staging, &target) {
            remove_quietly(&staging);
            return Err(e.into());
        }
        debug!(plugin = %id, path = %target.display(), "package copied into install directory");
        Ok((target, true, true))
    }
}

fn graph_of(records: &BTreeMap<PluginId, PluginRecord>) -> DependencyGraph {
    records
        .iter()
        .map(|(id, r)| (id.clone(), r.manifest.dependencies.clone()))
        .collect()
}

fn rejected(id: &PluginId, action: &str, issues: Vec<Issue>) -> BastionError {
    BastionError::Rejected {
        plugin: id.to_string(),
        action: action.into(),
        issues,
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove package directory");
        }
    }
}
