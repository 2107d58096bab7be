//! File system helpers for the update engine.
//!
//! Path containment checks used by extraction and the upgrade applier, atomic
//! writes for small state files, and a few metadata helpers for modification
//! times.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;

/// Normalizes a path by resolving `.` and `..` components lexically.
///
/// The file system is not consulted. A `..` at the root is dropped, so the
/// result never climbs above the first component.
///
/// # Examples
///
/// ```rust
/// use app_updater::utils::fs::normalize_path;
/// use std::path::{Path, PathBuf};
///
/// let path = Path::new("/opt/app/../app/./bin/tool");
/// assert_eq!(normalize_path(path), PathBuf::from("/opt/app/bin/tool"));
/// ```
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(components.last(), Some(Component::Normal(_))) {
                    components.pop();
                }
            }
            c => components.push(c),
        }
    }

    components.iter().collect()
}

/// Canonicalizes the longest existing prefix of `path` and appends the rest.
///
/// Destination files usually do not exist yet, so plain `canonicalize` would
/// fail. Resolving the existing ancestors still catches symlinks that point
/// outside the root.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();

    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }

    let mut resolved = std::fs::canonicalize(&existing).unwrap_or(existing);
    for name in rest.into_iter().rev() {
        resolved.push(name);
    }
    resolved
}

/// Resolves a relative entry name under `root`, enforcing path containment.
///
/// Backslashes are treated as separators and leading slashes are stripped, so
/// `\etc\passwd` and `/etc/passwd` both resolve under the root. Returns `None`
/// when the resolved path is neither equal to nor nested under the canonical
/// root.
///
/// # Examples
///
/// ```rust
/// use app_updater::utils::fs::resolve_contained;
/// use std::path::Path;
///
/// let root = Path::new("/opt/app");
/// assert!(resolve_contained(root, "bin/tool").is_some());
/// assert!(resolve_contained(root, "../../etc/passwd").is_none());
/// ```
#[must_use]
pub fn resolve_contained(root: &Path, entry_name: &str) -> Option<PathBuf> {
    let cleaned = entry_name.replace('\\', "/");
    let relative = cleaned.trim_start_matches('/');

    // Drive prefixes such as `C:` would make `join` replace the root.
    let relative_path = Path::new(relative);
    if relative_path.is_absolute()
        || relative_path.components().any(|c| matches!(c, Component::Prefix(_)))
    {
        return None;
    }

    let canonical_root = canonicalize_existing_prefix(&normalize_path(root));
    let candidate = normalize_path(&canonical_root.join(relative_path));
    let resolved = canonicalize_existing_prefix(&candidate);

    if resolved.starts_with(&canonical_root) { Some(resolved) } else { None }
}

/// Creates a directory and all of its parents.
pub async fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Writes `content` to `path` through a temporary file and a rename.
///
/// Readers never observe a half-written file. Parent directories are created
/// as needed.
pub async fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)
        .await
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;

    fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("Failed to rename temp file to: {}", path.display()))?;

    Ok(())
}

/// Returns the modification time of a file in UTC.
pub async fn modified_time(path: &Path) -> Result<DateTime<Utc>> {
    let metadata = fs::metadata(path)
        .await
        .with_context(|| format!("Failed to read metadata: {}", path.display()))?;
    let modified = metadata
        .modified()
        .with_context(|| format!("Modification time unavailable: {}", path.display()))?;
    Ok(DateTime::<Utc>::from(modified))
}

/// Sets the modification time of an existing file.
pub async fn set_modified_time(path: &Path, when: DateTime<Utc>) -> Result<()> {
    let path_buf = path.to_path_buf();
    let time = SystemTime::from(when);

    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path_buf)
            .with_context(|| format!("Failed to open {}", path_buf.display()))?;
        file.set_modified(time)
            .with_context(|| format!("Failed to set modification time on {}", path_buf.display()))
    })
    .await
    .context("Failed to join modification time task")?
}

/// Removes a file, ignoring the case where it is already gone.
pub async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Formats a byte count with a binary unit suffix.
///
/// # Examples
///
/// ```rust
/// use app_updater::utils::fs::format_size;
///
/// assert_eq!(format_size(512), "512 B");
/// assert_eq!(format_size(1536), "1.5 KB");
/// assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
/// ```
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{size:.1} {}", UNITS[unit])
}
