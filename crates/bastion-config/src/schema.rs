use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration, maps to `bastion.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BastionConfig {
    pub host: HostConfig,
    pub plugins: PluginsConfig,
    pub sandbox: SandboxConfig,
    pub permissions: PermissionsConfig,
    pub logging: LoggingConfig,
}

// ── Host ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Overrides the host version reported to plugins (`min_host_version`
    /// checks). Defaults to the version of the running binary.
    pub version: Option<String>,
    /// Root for all durable host state. Relative paths in `[plugins]` are
    /// resolved against it.
    pub data_dir: PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            version: None,
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bastion")
}

// ── Plugins ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Managed directory installed packages are copied into.
    pub install_dir: PathBuf,
    /// Persisted grant table.
    pub grants_file: PathBuf,
    /// Persisted ordered enabled-set.
    pub enabled_file: PathBuf,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("plugins"),
            grants_file: PathBuf::from("grants.toml"),
            enabled_file: PathBuf::from("enabled.toml"),
        }
    }
}

// ── Sandbox ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Default CPU-time ceiling per execution, in seconds.
    pub cpu_seconds: f64,
    /// Default memory ceiling per execution, in MiB.
    pub memory_mb: u64,
    /// Captured output beyond this many bytes is truncated.
    pub max_output_bytes: usize,
    /// Epoch tick interval. Lower values make ceilings and cancellation
    /// more precise at a small CPU cost.
    pub tick_ms: u64,
    /// ResourceExceeded results before a plugin is disabled. 0 = never.
    pub max_violations: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            cpu_seconds: 5.0,
            memory_mb: 64,
            max_output_bytes: 64 * 1024,
            tick_ms: 10,
            max_violations: 3,
        }
    }
}

/// Longest CPU-time ceiling accepted for one execution, in seconds.
pub const MAX_CPU_SECONDS: f64 = 86_400.0;

// ── Permissions ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Grant Normal-risk permissions at install time without asking.
    pub auto_grant_normal: bool,
    /// Permissions that are never granted, whatever the approver says.
    pub never_grant: Vec<String>,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            auto_grant_normal: true,
            never_grant: vec![],
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty", "json" or "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Path resolution ────────────────────────────────────────────

impl BastionConfig {
    fn resolve(&self, p: &std::path::Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.host.data_dir.join(p)
        }
    }

    pub fn install_dir(&self) -> PathBuf {
        self.resolve(&self.plugins.install_dir)
    }

    pub fn grants_file(&self) -> PathBuf {
        self.resolve(&self.plugins.grants_file)
    }

    pub fn enabled_file(&self) -> PathBuf {
        self.resolve(&self.plugins.enabled_file)
    }

    /// Per-plugin data root handed to sandboxed filesystem and storage calls.
    pub fn plugin_data_dir(&self) -> PathBuf {
        self.host.data_dir.join("data")
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "{}: {}: {}", tag, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, " ({})", h)?;
        }
        Ok(())
    }
}

impl BastionConfig {
    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Host version ───
        if let Some(ref v) = self.host.version {
            if semver::Version::parse(v).is_err() {
                warnings.push(ConfigWarning {
                    field: "host.version".into(),
                    message: format!("'{}' is not a semantic version", v),
                    severity: WarningSeverity::Error,
                    hint: Some("Use MAJOR.MINOR.PATCH, e.g. '1.2.0'".into()),
                });
            }
        }

        // ── Sandbox ceilings ───
        if !(self.sandbox.cpu_seconds.is_finite() && self.sandbox.cpu_seconds > 0.0) {
            warnings.push(ConfigWarning {
                field: "sandbox.cpu_seconds".into(),
                message: format!("{} is not a positive duration", self.sandbox.cpu_seconds),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 5.0".into()),
            });
        } else if self.sandbox.cpu_seconds > MAX_CPU_SECONDS {
            warnings.push(ConfigWarning {
                field: "sandbox.cpu_seconds".into(),
                message: format!("{}s exceeds the {MAX_CPU_SECONDS}s limit", self.sandbox.cpu_seconds),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 5.0".into()),
            });
        } else if self.sandbox.cpu_seconds > 300.0 {
            warnings.push(ConfigWarning {
                field: "sandbox.cpu_seconds".into(),
                message: format!("{}s lets a runaway plugin hold a worker for a long time", self.sandbox.cpu_seconds),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        if self.sandbox.memory_mb == 0 {
            warnings.push(ConfigWarning {
                field: "sandbox.memory_mb".into(),
                message: "memory ceiling is 0, no plugin could instantiate".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 64".into()),
            });
        }

        if self.sandbox.tick_ms == 0 {
            warnings.push(ConfigWarning {
                field: "sandbox.tick_ms".into(),
                message: "epoch tick interval must be at least 1ms".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        } else if self.sandbox.tick_ms > 1000 {
            warnings.push(ConfigWarning {
                field: "sandbox.tick_ms".into(),
                message: format!("{}ms ticks make CPU ceilings coarse", self.sandbox.tick_ms),
                severity: WarningSeverity::Warning,
                hint: Some("Values between 5 and 50 work well".into()),
            });
        }

        if self.sandbox.max_violations == 0 {
            warnings.push(ConfigWarning {
                field: "sandbox.max_violations".into(),
                message: "plugins exceeding ceilings are never disabled".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Permissions ───
        if !self.permissions.auto_grant_normal {
            warnings.push(ConfigWarning {
                field: "permissions.auto_grant_normal".into(),
                message: "every permission will require explicit approval".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  - {}", errors.join("\n  - ")));
        }

        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths_resolve_under_data_dir() {
        let mut config = BastionConfig::default();
        config.host.data_dir = PathBuf::from("/srv/bastion");
        assert_eq!(config.install_dir(), PathBuf::from("/srv/bastion/plugins"));
        assert_eq!(config.grants_file(), PathBuf::from("/srv/bastion/grants.toml"));

        config.plugins.enabled_file = PathBuf::from("/etc/bastion/enabled.toml");
        assert_eq!(config.enabled_file(), PathBuf::from("/etc/bastion/enabled.toml"));
    }

    #[test]
    fn test_default_config_is_valid() {
        let warnings = BastionConfig::default().validate().unwrap();
        assert!(warnings.iter().all(|w| w.severity != WarningSeverity::Error));
    }
}
