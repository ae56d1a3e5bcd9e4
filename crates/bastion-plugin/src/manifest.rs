use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::Path;

use bastion_core::{Issue, IssueCode, PluginId};

/// File name of the manifest inside a plugin package.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Highest `manifest_version` this host understands.
pub const MANIFEST_VERSION: u32 = 1;

/// Entry code unit used when the manifest does not name one.
pub const DEFAULT_ENTRY: &str = "plugin.wasm";

/// Plugin manifest, loaded from `plugin.toml` and checked field by field.
///
/// ```toml
/// manifest_version = 1
/// dependencies = ["com.example.base"]
/// permissions = ["log.write", "storage.read"]
///
/// [plugin]
/// id = "com.example.hello"
/// name = "Hello"
/// version = "1.0.0"
/// min_host_version = "0.1.0"
/// entry = "plugin.wat"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginManifest {
    pub manifest_version: u32,
    pub id: PluginId,
    pub name: String,
    pub version: Version,
    pub min_host_version: Version,
    pub description: Option<String>,
    pub authors: Vec<String>,
    /// Path of the entry code unit, relative to the package root.
    pub entry: String,
    /// BLAKE3 hex digest of the entry code unit.
    pub checksum: Option<String>,
    /// Plugins that must be present for this one to enable/load, in order.
    pub dependencies: Vec<PluginId>,
    /// Requested permission identifiers.
    pub permissions: Vec<String>,
}

impl PluginManifest {
    /// Verify the entry code unit against the declared checksum.
    /// A manifest without a checksum always passes.
    pub fn verify_checksum(&self, bytes: &[u8]) -> bool {
        match &self.checksum {
            Some(expected) => {
                let actual = blake3::hash(bytes).to_hex().to_string();
                actual.eq_ignore_ascii_case(expected.trim())
            }
            None => true,
        }
    }

    pub fn entry_path(&self, package_dir: &Path) -> std::path::PathBuf {
        package_dir.join(&self.entry)
    }

    /// Fields that identify a package. Re-validation before enable/load
    /// compares these against the installed record.
    pub fn identity(&self) -> (&PluginId, &Version) {
        (&self.id, &self.version)
    }
}

/// Manifest as written on disk, every field optional so that all problems
/// can be reported at once instead of stopping at the first one.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawManifest {
    pub manifest_version: Option<u32>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub plugin: Option<RawPluginMeta>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawPluginMeta {
    pub id: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub min_host_version: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    pub entry: Option<String>,
    pub checksum: Option<String>,
}

impl RawManifest {
    pub(crate) fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Check every field, returning the typed manifest if all required
    /// fields are usable, plus every issue found along the way.
    pub(crate) fn check(self) -> (Option<PluginManifest>, Vec<Issue>) {
        let mut issues = Vec::new();

        let manifest_version = self.manifest_version.unwrap_or(MANIFEST_VERSION);
        if manifest_version == 0 || manifest_version > MANIFEST_VERSION {
            issues.push(Issue::with_subject(
                IssueCode::UnsupportedManifestVersion,
                "manifest_version",
                format!("manifest_version {manifest_version} is not supported (max {MANIFEST_VERSION})"),
            ));
        }

        let meta = self.plugin.unwrap_or_default();

        let id = match meta.id.as_deref().map(str::trim) {
            None | Some("") => {
                issues.push(Issue::missing_field("plugin.id"));
                None
            }
            Some(raw) => match PluginId::new(raw) {
                Ok(id) => Some(id),
                Err(e) => {
                    issues.push(Issue::with_subject(IssueCode::InvalidId, "plugin.id", e.to_string()));
                    None
                }
            },
        };

        let name = match meta.name.as_deref().map(str::trim) {
            None | Some("") => {
                issues.push(Issue::missing_field("plugin.name"));
                None
            }
            Some(n) => Some(n.to_string()),
        };

        let version = parse_version(meta.version.as_deref(), "plugin.version", &mut issues);
        let min_host_version =
            parse_version(meta.min_host_version.as_deref(), "plugin.min_host_version", &mut issues);

        let mut permissions: Vec<String> = Vec::new();
        for p in self.permissions {
            if !bastion_permissions::catalog::is_known(&p) {
                issues.push(Issue::with_subject(
                    IssueCode::UnknownPermission,
                    "permissions",
                    format!("permission '{p}' is not in the catalog"),
                ));
            } else if !permissions.contains(&p) {
                permissions.push(p);
            }
        }

        let mut dependencies: Vec<PluginId> = Vec::new();
        for d in self.dependencies {
            match PluginId::new(d.as_str()) {
                Ok(dep) => {
                    if id.as_ref() == Some(&dep) {
                        issues.push(Issue::with_subject(
                            IssueCode::SelfDependency,
                            "dependencies",
                            format!("plugin lists itself ('{dep}') as a dependency"),
                        ));
                    } else if !dependencies.contains(&dep) {
                        dependencies.push(dep);
                    }
                }
                Err(e) => issues.push(Issue::with_subject(
                    IssueCode::InvalidId,
                    "dependencies",
                    e.to_string(),
                )),
            }
        }

        let entry = meta
            .entry
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_ENTRY.to_string());

        let manifest = match (id, name, version, min_host_version) {
            (Some(id), Some(name), Some(version), Some(min_host_version)) => Some(PluginManifest {
                manifest_version,
                id,
                name,
                version,
                min_host_version,
                description: meta.description,
                authors: meta.authors,
                entry,
                checksum: meta.checksum,
                dependencies,
                permissions,
            }),
            _ => None,
        };

        (manifest, issues)
    }
}

fn parse_version(raw: Option<&str>, field: &str, issues: &mut Vec<Issue>) -> Option<Version> {
    match raw.map(str::trim) {
        None | Some("") => {
            issues.push(Issue::missing_field(field));
            None
        }
        Some(v) => match Version::parse(v) {
            Ok(v) => Some(v),
            Err(e) => {
                issues.push(Issue::with_subject(
                    IssueCode::InvalidVersion,
                    field,
                    format!("'{v}' is not a semantic version: {e}"),
                ));
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(text: &str) -> (Option<PluginManifest>, Vec<Issue>) {
        RawManifest::parse(text).unwrap().check()
    }

    #[test]
    fn complete_manifest_parses() {
        let (m, issues) = check(
            r#"
manifest_version = 1
dependencies = ["com.example.base"]
permissions = ["log.write", "storage.read", "log.write"]

[plugin]
id = "com.example.hello"
name = "Hello"
version = "1.2.3"
min_host_version = "0.1.0"
authors = ["A"]
"#,
        );
        assert!(issues.is_empty(), "{issues:?}");
        let m = m.unwrap();
        assert_eq!(m.id.as_str(), "com.example.hello");
        assert_eq!(m.version, Version::new(1, 2, 3));
        assert_eq!(m.entry, DEFAULT_ENTRY);
        assert_eq!(m.permissions, vec!["log.write", "storage.read"]);
        assert_eq!(m.dependencies[0].as_str(), "com.example.base");
    }

    #[test]
    fn every_missing_field_reported() {
        let (m, issues) = check("[plugin]\nname = \"\"\n");
        assert!(m.is_none());
        let subjects: Vec<_> = issues.iter().filter_map(|i| i.subject.as_deref()).collect();
        assert_eq!(
            subjects,
            vec!["plugin.id", "plugin.name", "plugin.version", "plugin.min_host_version"]
        );
    }

    #[test]
    fn bad_versions_and_ids() {
        let (_, issues) = check(
            r#"
[plugin]
id = "Bad/Id"
name = "x"
version = "1.0"
min_host_version = "latest"
"#,
        );
        let codes: Vec<_> = issues.iter().map(|i| i.code).collect();
        assert_eq!(
            codes,
            vec![IssueCode::InvalidId, IssueCode::InvalidVersion, IssueCode::InvalidVersion]
        );
    }

    #[test]
    fn future_manifest_version_rejected() {
        let (_, issues) = check(
            "manifest_version = 7\n[plugin]\nid = \"a.b\"\nname = \"x\"\nversion = \"1.0.0\"\nmin_host_version = \"0.1.0\"\n",
        );
        assert_eq!(issues[0].code, IssueCode::UnsupportedManifestVersion);
    }

    #[test]
    fn checksum_verification() {
        let (m, _) = check(
            "[plugin]\nid = \"a.b\"\nname = \"x\"\nversion = \"1.0.0\"\nmin_host_version = \"0.1.0\"\nchecksum = \"0000\"\n",
        );
        let mut m = m.unwrap();
        assert!(!m.verify_checksum(b"hello world"));
        m.checksum = Some(blake3::hash(b"hello world").to_hex().to_uppercase());
        assert!(m.verify_checksum(b"hello world"));
        m.checksum = None;
        assert!(m.verify_checksum(b"anything"));
    }
}
