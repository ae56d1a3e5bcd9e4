use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BastionError, Result};

/// Maximum length of a plugin identifier.
pub const MAX_PLUGIN_ID_LEN: usize = 128;

/// Unique, stable plugin identifier, e.g. `"com.example.hello"`.
///
/// Identifiers are used as directory names and as keys in persisted files,
/// so they are restricted to lowercase ASCII letters, digits, `.`, `-` and
/// `_`, must start and end with a letter or digit, and may not contain `..`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PluginId(String);

/// Deserialize with validation so crafted state files cannot smuggle in
/// path-traversal identifiers.
impl<'de> Deserialize<'de> for PluginId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl PluginId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(id: &str) -> bool {
        Self::validate(id).is_ok()
    }

    fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(BastionError::InvalidPluginId("plugin id must not be empty".into()));
        }
        if id.len() > MAX_PLUGIN_ID_LEN {
            return Err(BastionError::InvalidPluginId(format!(
                "plugin id exceeds {MAX_PLUGIN_ID_LEN} characters"
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'))
        {
            return Err(BastionError::InvalidPluginId(format!(
                "plugin id may contain only lowercase letters, digits, '.', '-' and '_', got: {id}"
            )));
        }
        let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
        if !edge_ok(id.chars().next()) || !edge_ok(id.chars().last()) {
            return Err(BastionError::InvalidPluginId(format!(
                "plugin id must start and end with a letter or digit, got: {id}"
            )));
        }
        if id.contains("..") {
            return Err(BastionError::InvalidPluginId(format!(
                "plugin id must not contain '..', got: {id}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for PluginId {
    type Err = BastionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Lifecycle state of a plugin as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotInstalled,
    /// Installed but not enabled.
    Disabled,
    Enabled,
    Loaded,
}

impl LifecycleState {
    pub fn is_installed(&self) -> bool {
        !matches!(self, Self::NotInstalled)
    }

    /// Enabled or Loaded.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Enabled | Self::Loaded)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInstalled => write!(f, "not installed"),
            Self::Disabled => write!(f, "installed (disabled)"),
            Self::Enabled => write!(f, "enabled"),
            Self::Loaded => write!(f, "loaded"),
        }
    }
}

/// Version of the running host, compared against a manifest's
/// `min_host_version` with semantic-version ordering.
pub fn host_version_satisfies(host: &semver::Version, minimum: &semver::Version) -> bool {
    host >= minimum
}
