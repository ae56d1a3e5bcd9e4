//! Static permission catalog shipped with the host.
//!
//! Identifiers are `area.verb` strings. They are persisted in grant files and
//! written by plugin authors in manifests, so an entry must never be renamed.

use serde::Serialize;
use std::fmt;

/// How much damage a permission can do in the wrong hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Safe to grant at install time without asking.
    Normal,
    /// Requires explicit approval.
    Sensitive,
    /// Requires explicit approval; grants broad host access.
    Critical,
}

impl RiskLevel {
    pub fn requires_approval(&self) -> bool {
        !matches!(self, Self::Normal)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Sensitive => write!(f, "sensitive"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Kind of host capability a permission unlocks. Static inspection uses it
/// to decide whether a raw construct in shipped sources is covered by a
/// requested permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityClass {
    Logging,
    Clock,
    Storage,
    Notifications,
    Settings,
    Clipboard,
    Filesystem,
    Network,
    Socket,
    Process,
}

/// A catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Permission {
    pub id: &'static str,
    pub risk: RiskLevel,
    pub class: CapabilityClass,
    pub description: &'static str,
}

const fn perm(
    id: &'static str,
    risk: RiskLevel,
    class: CapabilityClass,
    description: &'static str,
) -> Permission {
    Permission {
        id,
        risk,
        class,
        description,
    }
}

static CATALOG: &[Permission] = &[
    perm("log.write", RiskLevel::Normal, CapabilityClass::Logging, "Write to the host log"),
    perm("clock.read", RiskLevel::Normal, CapabilityClass::Clock, "Read the current time"),
    perm("storage.read", RiskLevel::Normal, CapabilityClass::Storage, "Read the plugin's private key-value storage"),
    perm("storage.write", RiskLevel::Normal, CapabilityClass::Storage, "Write the plugin's private key-value storage"),
    perm("notifications.show", RiskLevel::Normal, CapabilityClass::Notifications, "Show notifications to the user"),
    perm("settings.read", RiskLevel::Sensitive, CapabilityClass::Settings, "Read host application settings"),
    perm("clipboard.read", RiskLevel::Sensitive, CapabilityClass::Clipboard, "Read the clipboard"),
    perm("fs.read", RiskLevel::Sensitive, CapabilityClass::Filesystem, "Read files in the plugin's data directory"),
    perm("fs.write", RiskLevel::Critical, CapabilityClass::Filesystem, "Create and modify files in the plugin's data directory"),
    perm("network.fetch", RiskLevel::Sensitive, CapabilityClass::Network, "Make outbound HTTP requests"),
    perm("network.socket", RiskLevel::Critical, CapabilityClass::Socket, "Open raw network sockets"),
    perm("process.spawn", RiskLevel::Critical, CapabilityClass::Process, "Start host processes"),
];

/// Every permission the host knows about.
pub fn all() -> &'static [Permission] {
    CATALOG
}

pub fn lookup(id: &str) -> Option<&'static Permission> {
    CATALOG.iter().find(|p| p.id == id)
}

pub fn is_known(id: &str) -> bool {
    lookup(id).is_some()
}

/// True if any of `requested` unlocks the given capability class.
pub fn requests_class<S: AsRef<str>>(requested: &[S], class: CapabilityClass) -> bool {
    requested
        .iter()
        .filter_map(|id| lookup(id.as_ref()))
        .any(|p| p.class == class)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identifiers_are_unique() {
        let mut seen = HashSet::new();
        for p in all() {
            assert!(seen.insert(p.id), "duplicate permission id {}", p.id);
        }
    }

    #[test]
    fn identifiers_are_area_dot_verb() {
        for p in all() {
            let parts: Vec<&str> = p.id.split('.').collect();
            assert_eq!(parts.len(), 2, "{}", p.id);
            assert!(p.id.chars().all(|c| c.is_ascii_lowercase() || c == '.'), "{}", p.id);
            assert!(!p.description.is_empty());
        }
    }

    #[test]
    fn lookup_known_and_unknown() {
        assert_eq!(lookup("fs.write").unwrap().risk, RiskLevel::Critical);
        assert_eq!(lookup("log.write").unwrap().risk, RiskLevel::Normal);
        assert!(lookup("fs.delete").is_none());
        assert!(!is_known(""));
    }

    #[test]
    fn class_membership() {
        assert!(requests_class(&["log.write", "process.spawn"], CapabilityClass::Process));
        assert!(!requests_class(&["network.fetch"], CapabilityClass::Socket));
        assert!(!requests_class(&["bogus.perm"], CapabilityClass::Process));
    }

    #[test]
    fn only_normal_skips_approval() {
        assert!(!RiskLevel::Normal.requires_approval());
        assert!(RiskLevel::Sensitive.requires_approval());
        assert!(RiskLevel::Critical.requires_approval());
    }
}
