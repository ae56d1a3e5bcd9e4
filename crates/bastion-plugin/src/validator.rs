//! Package validation. Pure: reads the package directory, never writes,
//! never touches installed state.

use serde::Serialize;
use std::path::{Component, Path};
use tracing::debug;

use bastion_core::{BastionError, Issue, IssueCode, Result};

use crate::inspect;
use crate::manifest::{MANIFEST_FILE, PluginManifest, RawManifest};

/// Directories deeper than this inside a package are not scanned.
const MAX_SCAN_DEPTH: usize = 16;

/// Result of validating one package directory.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub ok: bool,
    pub issues: Vec<Issue>,
    /// Present whenever the required manifest fields were usable, even if
    /// other issues were found.
    pub manifest: Option<PluginManifest>,
}

impl ValidationOutcome {
    fn fatal(issue: Issue) -> Self {
        Self {
            ok: false,
            issues: vec![issue],
            manifest: None,
        }
    }

    /// Convert into the manifest, or a `Validation` error carrying every issue.
    pub fn into_result(self, package: &Path) -> Result<PluginManifest> {
        match (self.ok, self.manifest) {
            (true, Some(m)) => Ok(m),
            (_, manifest) => Err(BastionError::Validation {
                plugin: manifest
                    .map(|m| m.id.to_string())
                    .unwrap_or_else(|| package.display().to_string()),
                issues: self.issues,
            }),
        }
    }
}

/// Validate the plugin package rooted at `package_dir`.
///
/// Process and socket constructs in shipped sources pass when the manifest
/// requests a permission of that class. Use [`validate_with_grants`] once
/// the plugin holds grants.
pub fn validate(package_dir: &Path) -> ValidationOutcome {
    validate_package(package_dir, None)
}

/// Like [`validate`], but a source construct only passes when its
/// permission is both requested and in `granted`.
pub fn validate_with_grants(package_dir: &Path, granted: &[String]) -> ValidationOutcome {
    validate_package(package_dir, Some(granted))
}

fn validate_package(package_dir: &Path, granted: Option<&[String]>) -> ValidationOutcome {
    let manifest_path = package_dir.join(MANIFEST_FILE);

    let text = match std::fs::read_to_string(&manifest_path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return ValidationOutcome::fatal(Issue::with_subject(
                IssueCode::ManifestMissing,
                MANIFEST_FILE,
                format!("no {MANIFEST_FILE} in {}", package_dir.display()),
            ));
        }
        Err(e) => {
            return ValidationOutcome::fatal(Issue::with_subject(
                IssueCode::ManifestUnparseable,
                MANIFEST_FILE,
                format!("cannot read manifest: {e}"),
            ));
        }
    };

    let raw = match RawManifest::parse(&text) {
        Ok(raw) => raw,
        Err(e) => {
            return ValidationOutcome::fatal(Issue::with_subject(
                IssueCode::ManifestUnparseable,
                MANIFEST_FILE,
                format!("manifest is not valid TOML: {e}"),
            ));
        }
    };
    let exempt: Vec<String> = match granted {
        Some(granted) => raw.permissions.iter().filter(|p| granted.contains(p)).cloned().collect(),
        None => raw.permissions.clone(),
    };

    let (manifest, mut issues) = raw.check();

    // Package contents: symlinks and shipped sources.
    let mut sources = Vec::new();
    walk(package_dir, package_dir, 0, &mut issues, &mut sources);
    for (label, path) in &sources {
        match std::fs::read_to_string(path) {
            Ok(text) => issues.extend(inspect::scan_source(label, &text, &exempt)),
            Err(e) => issues.push(Issue::with_subject(
                IssueCode::Unreadable,
                label.clone(),
                format!("cannot read source file: {e}"),
            )),
        }
    }

    if let Some(m) = &manifest {
        check_entry(package_dir, m, &mut issues);
    }

    debug!(
        package = %package_dir.display(),
        issues = issues.len(),
        "package validated"
    );

    ValidationOutcome {
        ok: issues.is_empty(),
        issues,
        manifest,
    }
}

fn check_entry(package_dir: &Path, manifest: &PluginManifest, issues: &mut Vec<Issue>) {
    let entry = Path::new(&manifest.entry);
    if !entry.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
        issues.push(Issue::with_subject(
            IssueCode::EntryMissing,
            "plugin.entry",
            format!("entry '{}' must be a relative path inside the package", manifest.entry),
        ));
        return;
    }

    let path = manifest.entry_path(package_dir);
    let bytes = match std::fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_file() => match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                issues.push(Issue::with_subject(
                    IssueCode::Unreadable,
                    manifest.entry.clone(),
                    format!("cannot read entry: {e}"),
                ));
                return;
            }
        },
        // Symlinked entries are already reported by the walk.
        Ok(meta) if meta.file_type().is_symlink() => return,
        _ => {
            issues.push(Issue::with_subject(
                IssueCode::EntryMissing,
                "plugin.entry",
                format!("entry code unit '{}' not found", manifest.entry),
            ));
            return;
        }
    };

    if !manifest.verify_checksum(&bytes) {
        issues.push(Issue::with_subject(
            IssueCode::ChecksumMismatch,
            manifest.entry.clone(),
            "entry code unit does not match the declared BLAKE3 checksum",
        ));
    }

    issues.extend(inspect::inspect_module(&manifest.entry, &bytes, &manifest.permissions));
}

/// Walk the package, reporting symlinks and collecting source files as
/// (package-relative label, path).
fn walk(
    root: &Path,
    dir: &Path,
    depth: usize,
    issues: &mut Vec<Issue>,
    sources: &mut Vec<(String, std::path::PathBuf)>,
) {
    let label_of = |p: &Path| {
        p.strip_prefix(root)
            .unwrap_or(p)
            .to_string_lossy()
            .replace('\\', "/")
    };

    if depth > MAX_SCAN_DEPTH {
        issues.push(Issue::with_subject(
            IssueCode::Unreadable,
            label_of(dir),
            format!("package nests deeper than {MAX_SCAN_DEPTH} directories"),
        ));
        return;
    }

    let mut entries: Vec<_> = match std::fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).collect(),
        Err(e) => {
            issues.push(Issue::with_subject(
                IssueCode::Unreadable,
                label_of(dir),
                format!("cannot list directory: {e}"),
            ));
            return;
        }
    };
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            issues.push(Issue::with_subject(
                IssueCode::Symlink,
                label_of(&path),
                "symbolic links are not allowed in plugin packages",
            ));
        } else if file_type.is_dir() {
            walk(root, &path, depth + 1, issues, sources);
        } else if file_type.is_file() && inspect::is_source_file(&path) {
            sources.push((label_of(&path), path));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(manifest: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), manifest).unwrap();
        dir
    }

    const NOOP: &str = r#"(module (func (export "run")))"#;

    #[test]
    fn missing_manifest_is_single_fatal_issue() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = validate(dir.path());
        assert!(!outcome.ok);
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].code, IssueCode::ManifestMissing);
    }

    #[test]
    fn unparseable_manifest_is_single_fatal_issue() {
        let dir = package("[plugin\nid = ");
        let outcome = validate(dir.path());
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].code, IssueCode::ManifestUnparseable);
        assert!(outcome.issues[0].code.is_fatal());
    }

    #[test]
    fn entry_missing_reported() {
        let dir = package(
            "[plugin]\nid = \"a.b\"\nname = \"x\"\nversion = \"1.0.0\"\nmin_host_version = \"0.1.0\"\n",
        );
        let outcome = validate(dir.path());
        assert!(!outcome.ok);
        assert_eq!(outcome.issues[0].code, IssueCode::EntryMissing);
        assert!(outcome.manifest.is_some());
    }

    #[test]
    fn entry_outside_package_rejected() {
        let dir = package(
            "[plugin]\nid = \"a.b\"\nname = \"x\"\nversion = \"1.0.0\"\nmin_host_version = \"0.1.0\"\nentry = \"../x.wat\"\n",
        );
        let outcome = validate(dir.path());
        assert_eq!(outcome.issues[0].code, IssueCode::EntryMissing);
        assert!(outcome.issues[0].message.contains("relative"));
    }

    #[test]
    fn checksum_mismatch_reported() {
        let dir = package(
            "[plugin]\nid = \"a.b\"\nname = \"x\"\nversion = \"1.0.0\"\nmin_host_version = \"0.1.0\"\nentry = \"plugin.wat\"\nchecksum = \"deadbeef\"\n",
        );
        std::fs::write(dir.path().join("plugin.wat"), NOOP).unwrap();
        let outcome = validate(dir.path());
        let codes: Vec<_> = outcome.issues.iter().map(|i| i.code).collect();
        assert_eq!(codes, vec![IssueCode::ChecksumMismatch]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_reported() {
        let dir = package(
            "[plugin]\nid = \"a.b\"\nname = \"x\"\nversion = \"1.0.0\"\nmin_host_version = \"0.1.0\"\nentry = \"plugin.wat\"\n",
        );
        std::fs::write(dir.path().join("plugin.wat"), NOOP).unwrap();
        std::os::unix::fs::symlink("/etc/passwd", dir.path().join("passwd")).unwrap();
        let outcome = validate(dir.path());
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].code, IssueCode::Symlink);
        assert_eq!(outcome.issues[0].subject.as_deref(), Some("passwd"));
    }

    #[test]
    fn source_exemption_follows_grants() {
        let dir = package(
            "permissions = [\"process.spawn\"]\n[plugin]\nid = \"a.b\"\nname = \"x\"\nversion = \"1.0.0\"\n\
             min_host_version = \"0.1.0\"\nentry = \"plugin.wat\"\n",
        );
        std::fs::write(dir.path().join("plugin.wat"), NOOP).unwrap();
        std::fs::write(dir.path().join("tool.py"), "import subprocess\n").unwrap();

        assert!(validate(dir.path()).ok);
        let declined = validate_with_grants(dir.path(), &[]);
        assert!(!declined.ok);
        assert_eq!(declined.issues[0].code, IssueCode::DeniedConstruct);
        assert!(validate_with_grants(dir.path(), &["process.spawn".to_string()]).ok);
    }

    #[test]
    fn into_result_carries_issues() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate(dir.path()).into_result(dir.path()).unwrap_err();
        assert_eq!(err.issues().len(), 1);
    }
}
