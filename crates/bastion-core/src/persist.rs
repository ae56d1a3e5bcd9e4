//! Atomic replace-on-write for durable state files.
//!
//! The file is written to a temp file in the same directory, synced, then
//! renamed over the target. A crash mid-write leaves either the old file or
//! the new one, never a truncated mix.

use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::error::{BastionError, Result};

/// Write `contents` to `path` atomically, creating parent directories.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .map_err(|e| BastionError::persistence(path, format!("failed to create parent directory: {e}")))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| BastionError::persistence(path, format!("failed to create temp file: {e}")))?;
    tmp.write_all(contents)
        .map_err(|e| BastionError::persistence(path, format!("failed to write temp file: {e}")))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| BastionError::persistence(path, format!("failed to sync temp file: {e}")))?;
    tmp.persist(path)
        .map_err(|e| BastionError::persistence(path, format!("failed to rename into place: {}", e.error)))?;

    debug!(path = %path.display(), bytes = contents.len(), "persisted state file");
    Ok(())
}
