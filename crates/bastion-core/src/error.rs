use std::path::PathBuf;

use thiserror::Error;

use crate::issue::Issue;

/// Unified error type for the Bastion plugin host.
///
/// Lifecycle and validation failures are returned as values of this type;
/// nothing in the trust boundary uses panics for control flow.
#[derive(Error, Debug)]
pub enum BastionError {
    // ── Validation ─────────────────────────────────────────────
    #[error("validation failed: {plugin}: {} issue(s)", .issues.len())]
    Validation { plugin: String, issues: Vec<Issue> },

    // ── Lifecycle ──────────────────────────────────────────────
    #[error("illegal transition: cannot {action} plugin {plugin} while {state}")]
    StateGuard {
        plugin: String,
        action: String,
        state: String,
    },

    #[error("{action} rejected: {plugin}: {} issue(s)", .issues.len())]
    Rejected {
        plugin: String,
        action: String,
        issues: Vec<Issue>,
    },

    #[error("plugin busy: {plugin} has {in_flight} execution(s) in flight")]
    Busy { plugin: String, in_flight: usize },

    #[error("plugin not installed: {0}")]
    NotInstalled(String),

    // ── Permissions ────────────────────────────────────────────
    #[error("unknown permission: {0}")]
    UnknownPermission(String),

    #[error("invalid plugin id: {0}")]
    InvalidPluginId(String),

    // ── Persistence ────────────────────────────────────────────
    #[error("persistence failure: {}: {reason}", .path.display())]
    Persistence { path: PathBuf, reason: String },

    // ── Sandbox ────────────────────────────────────────────────
    #[error("sandbox error: {plugin}: {reason}")]
    Sandbox { plugin: String, reason: String },

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl BastionError {
    /// Human-readable reason list for UI/CLI surfaces.
    ///
    /// Errors that carry issues expand to one line per issue; every other
    /// variant yields its display string.
    pub fn reasons(&self) -> Vec<String> {
        match self {
            Self::Validation { issues, .. } | Self::Rejected { issues, .. } => {
                issues.iter().map(|i| i.to_string()).collect()
            }
            other => vec![other.to_string()],
        }
    }

    /// Issues attached to this error, if any.
    pub fn issues(&self) -> &[Issue] {
        match self {
            Self::Validation { issues, .. } | Self::Rejected { issues, .. } => issues,
            _ => &[],
        }
    }

    pub fn persistence(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Persistence {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BastionError>;
