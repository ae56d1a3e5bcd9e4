use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable category of a validation or guard issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    // ── Package ────────────────────────────────────────────────
    ManifestMissing,
    ManifestUnparseable,
    UnsupportedManifestVersion,
    MissingField,
    InvalidId,
    InvalidVersion,
    UnknownPermission,
    SelfDependency,
    EntryMissing,
    ChecksumMismatch,
    Symlink,
    Unreadable,

    // ── Static inspection ──────────────────────────────────────
    DeniedConstruct,
    DeniedImport,
    UndeclaredPermission,
    InvalidCode,

    // ── Lifecycle guards ───────────────────────────────────────
    AlreadyInstalled,
    IdentityChanged,
    IncompatibleHost,
    DependencyMissing,
    DependencyNotEnabled,
    DependencyCycle,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManifestMissing => "manifest_missing",
            Self::ManifestUnparseable => "manifest_unparseable",
            Self::UnsupportedManifestVersion => "unsupported_manifest_version",
            Self::MissingField => "missing_field",
            Self::InvalidId => "invalid_id",
            Self::InvalidVersion => "invalid_version",
            Self::UnknownPermission => "unknown_permission",
            Self::SelfDependency => "self_dependency",
            Self::EntryMissing => "entry_missing",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::Symlink => "symlink",
            Self::Unreadable => "unreadable",
            Self::DeniedConstruct => "denied_construct",
            Self::DeniedImport => "denied_import",
            Self::UndeclaredPermission => "undeclared_permission",
            Self::InvalidCode => "invalid_code",
            Self::AlreadyInstalled => "already_installed",
            Self::IdentityChanged => "identity_changed",
            Self::IncompatibleHost => "incompatible_host",
            Self::DependencyMissing => "dependency_missing",
            Self::DependencyNotEnabled => "dependency_not_enabled",
            Self::DependencyCycle => "dependency_cycle",
        }
    }

    /// Fatal issues stop validation early (nothing else can be checked).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ManifestMissing | Self::ManifestUnparseable)
    }
}

/// A single problem found while validating a package or guarding a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub code: IssueCode,
    /// Manifest field, file, or dependency the issue refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub message: String,
}

impl Issue {
    pub fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            subject: None,
            message: message.into(),
        }
    }

    pub fn with_subject(code: IssueCode, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            subject: Some(subject.into()),
            message: message.into(),
        }
    }

    pub fn missing_field(field: &str) -> Self {
        Self::with_subject(
            IssueCode::MissingField,
            field,
            format!("required field '{field}' is missing"),
        )
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subject {
            Some(subject) => write!(f, "[{}] {}: {}", self.code.as_str(), subject, self.message),
            None => write!(f, "[{}] {}", self.code.as_str(), self.message),
        }
    }
}
