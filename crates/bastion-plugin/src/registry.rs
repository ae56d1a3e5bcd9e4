//! Where candidate packages come from.
//!
//! - [`PluginRegistry`] enumerates package directories already on disk
//!   (used by startup restore)
//! - [`PackageRepository`] fetches a package by id and version into a
//!   staging directory for install

use semver::Version;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use bastion_core::{BastionError, PluginId, Result};

use crate::manifest::MANIFEST_FILE;

/// Enumerates candidate package directories.
pub trait PluginRegistry: Send + Sync {
    fn candidates(&self) -> Result<Vec<PathBuf>>;
}

/// Every direct subdirectory of `root` that contains a `plugin.toml`.
pub struct DirectoryRegistry {
    root: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PluginRegistry for DirectoryRegistry {
    fn candidates(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            info!(root = %self.root.display(), "plugin directory does not exist, nothing to discover");
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            // Staging leftovers from interrupted installs.
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            if entry.file_type()?.is_dir() && path.join(MANIFEST_FILE).is_file() {
                found.push(path);
            }
        }
        found.sort();
        debug!(root = %self.root.display(), count = found.len(), "discovered plugin packages");
        Ok(found)
    }
}

/// Fetches packages for install.
pub trait PackageRepository: Send + Sync {
    /// Versions available for `id`, ascending.
    fn versions(&self, id: &PluginId) -> Result<Vec<Version>>;

    /// Copy the package into a new directory under `staging` and return it.
    /// `None` picks the highest available version.
    fn fetch(&self, id: &PluginId, version: Option<&Version>, staging: &Path) -> Result<PathBuf>;
}

/// Repository backed by a local mirror laid out as `<root>/<id>/<version>/`.
pub struct MirrorRepository {
    root: PathBuf,
}

impl MirrorRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PackageRepository for MirrorRepository {
    fn versions(&self, id: &PluginId) -> Result<Vec<Version>> {
        let dir = self.root.join(id.as_str());
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut versions: Vec<Version> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| Version::parse(&e.file_name().to_string_lossy()).ok())
            .collect();
        versions.sort();
        Ok(versions)
    }

    fn fetch(&self, id: &PluginId, version: Option<&Version>, staging: &Path) -> Result<PathBuf> {
        let version = match version {
            Some(v) => v.clone(),
            None => self
                .versions(id)?
                .pop()
                .ok_or_else(|| not_found(format!("no versions of {id} in mirror {}", self.root.display())))?,
        };
        let source = self.root.join(id.as_str()).join(version.to_string());
        if !source.join(MANIFEST_FILE).is_file() {
            return Err(not_found(format!("{id} {version} not found in mirror {}", self.root.display())));
        }
        let dest = staging.join(format!("{id}-{version}"));
        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        copy_package(&source, &dest)?;
        info!(plugin = %id, %version, dest = %dest.display(), "package fetched from mirror");
        Ok(dest)
    }
}

fn not_found(msg: String) -> BastionError {
    std::io::Error::new(std::io::ErrorKind::NotFound, msg).into()
}

/// Recursively copy a package directory. Symbolic links are skipped; the
/// validator reports them on the source.
pub(crate) fn copy_package(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if ty.is_symlink() {
            warn!(path = %entry.path().display(), "skipping symbolic link while copying package");
        } else if ty.is_dir() {
            copy_package(&entry.path(), &target)?;
        } else if ty.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pkg(dir: &Path, id: &str, version: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILE),
            format!("[plugin]\nid = \"{id}\"\nname = \"x\"\nversion = \"{version}\"\nmin_host_version = \"0.1.0\"\n"),
        )
        .unwrap();
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join("src/lib.rs"), "fn main() {}").unwrap();
    }

    #[test]
    fn directory_registry_finds_packages() {
        let dir = tempfile::tempdir().unwrap();
        write_pkg(&dir.path().join("one"), "a.one", "1.0.0");
        write_pkg(&dir.path().join(".staging-x"), "a.two", "1.0.0");
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        let found = DirectoryRegistry::new(dir.path()).candidates().unwrap();
        assert_eq!(found, vec![dir.path().join("one")]);
    }

    #[test]
    fn missing_root_is_empty() {
        let found = DirectoryRegistry::new("/nonexistent/bastion/plugins").candidates().unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn mirror_fetches_latest() {
        let mirror = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let id = PluginId::new("com.example.m").unwrap();
        write_pkg(&mirror.path().join("com.example.m/1.0.0"), "com.example.m", "1.0.0");
        write_pkg(&mirror.path().join("com.example.m/1.10.0"), "com.example.m", "1.10.0");
        write_pkg(&mirror.path().join("com.example.m/1.2.0"), "com.example.m", "1.2.0");

        let repo = MirrorRepository::new(mirror.path());
        assert_eq!(repo.versions(&id).unwrap().last().unwrap(), &Version::new(1, 10, 0));

        let fetched = repo.fetch(&id, None, staging.path()).unwrap();
        assert!(fetched.ends_with("com.example.m-1.10.0"));
        assert!(fetched.join("src/lib.rs").is_file());

        let pinned = repo.fetch(&id, Some(&Version::new(1, 0, 0)), staging.path()).unwrap();
        assert!(pinned.join(MANIFEST_FILE).is_file());

        assert!(repo.fetch(&id, Some(&Version::new(9, 9, 9)), staging.path()).is_err());
    }
}
