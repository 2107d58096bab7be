//! Local version state: cached package artifacts and the last-applied record.
//!
//! The working directory may hold downloaded `*.tar.gz` packages. The most
//! recently modified one describes the local version (name, modification time
//! and checksum). Without an artifact the store falls back to the persisted
//! record written by [`VersionStore::commit`] after each successful install.
//!
//! The persisted record is a small JSON document:
//!
//! ```json
//! { "Version": "1.3.0", "Modified": "2024-02-01T09:30:00Z" }
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::constants::{PACKAGE_SUFFIX, VERSION_STATE_FILE};
use crate::upgrade::models::LocalVersionState;
use crate::upgrade::verification::ChecksumVerifier;
use crate::utils::fs::{atomic_write, modified_time};

/// Last version applied to the installation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppliedVersion {
    /// Version string.
    #[serde(default, alias = "version")]
    pub version: Option<String>,
    /// Modification time of the package that produced it.
    #[serde(default, alias = "modified")]
    pub modified: Option<DateTime<Utc>>,
}

/// Reads and writes the local version state.
#[derive(Debug, Clone)]
pub struct VersionStore {
    work_dir: PathBuf,
    state_path: PathBuf,
}

impl VersionStore {
    /// Creates a store scanning `work_dir` and persisting next to it.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let state_path = work_dir.join(VERSION_STATE_FILE);
        Self {
            work_dir,
            state_path,
        }
    }

    /// Overrides where the last-applied record is stored.
    #[must_use]
    pub fn with_state_path(mut self, state_path: PathBuf) -> Self {
        self.state_path = state_path;
        self
    }

    /// Directory scanned for package artifacts.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Resolves the local version state.
    ///
    /// A present artifact always wins over the persisted record. Only the
    /// artifact path carries a checksum.
    pub async fn resolve(&self) -> Result<LocalVersionState> {
        if let Some(artifact) = self.latest_artifact().await? {
            debug!("Resolving local version from artifact {}", artifact.display());
            return Ok(LocalVersionState {
                version: version_from_file_name(&artifact),
                modified_at: Some(modified_time(&artifact).await?),
                checksum: Some(ChecksumVerifier::compute_sha256(&artifact).await?),
            });
        }

        let applied = self.last_applied().await?.unwrap_or_default();
        Ok(LocalVersionState {
            version: applied.version,
            modified_at: applied.modified,
            checksum: None,
        })
    }

    /// Returns the most recently modified `*.tar.gz` in the working directory.
    pub async fn latest_artifact(&self) -> Result<Option<PathBuf>> {
        if !self.work_dir.is_dir() {
            return Ok(None);
        }

        let pattern = format!(
            "{}/*{}",
            glob::Pattern::escape(&self.work_dir.to_string_lossy()),
            PACKAGE_SUFFIX
        );
        let entries = glob::glob(&pattern)
            .with_context(|| format!("Invalid artifact pattern: {pattern}"))?;

        let mut newest: Option<(DateTime<Utc>, PathBuf)> = None;
        for entry in entries {
            let path = match entry {
                Ok(path) if path.is_file() => path,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Skipping unreadable artifact candidate: {e}");
                    continue;
                }
            };
            let modified = modified_time(&path).await?;
            if newest.as_ref().is_none_or(|(time, _)| modified > *time) {
                newest = Some((modified, path));
            }
        }

        Ok(newest.map(|(_, path)| path))
    }

    /// Reads the persisted last-applied record.
    ///
    /// A missing file yields `None`. An unreadable or corrupt file is logged and
    /// also yields `None`, so a damaged record never blocks a check.
    pub async fn last_applied(&self) -> Result<Option<AppliedVersion>> {
        if !self.state_path.exists() {
            return Ok(None);
        }

        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read {}: {e}", self.state_path.display());
                return Ok(None);
            }
        };

        match serde_json::from_str::<AppliedVersion>(&content) {
            Ok(applied) => Ok(Some(applied)),
            Err(e) => {
                warn!("Ignoring corrupt version record {}: {e}", self.state_path.display());
                Ok(None)
            }
        }
    }

    /// Persists the last-applied version for the next launch.
    pub async fn commit(&self, version: &str, modified: DateTime<Utc>) -> Result<()> {
        let record = AppliedVersion {
            version: Some(version.to_string()),
            modified: Some(modified),
        };
        let content =
            serde_json::to_string_pretty(&record).context("Failed to serialize version record")?;
        atomic_write(&self.state_path, content.as_bytes()).await?;
        debug!("Committed version {version} to {}", self.state_path.display());
        Ok(())
    }
}

/// Extracts the version from a package file name.
///
/// The name (minus its final extension) is split on `-` and the last segment,
/// stripped of `.tar`, is the version. Names without a `-` carry no version.
///
/// # Examples
///
/// ```rust
/// use app_updater::upgrade::version_store::version_from_file_name;
/// use std::path::Path;
///
/// assert_eq!(version_from_file_name(Path::new("app-1.2.0.tar.gz")).as_deref(), Some("1.2.0"));
/// assert_eq!(version_from_file_name(Path::new("package.tar.gz")), None);
/// ```
#[must_use]
pub fn version_from_file_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_string_lossy();
    let segments: Vec<&str> = stem.split('-').collect();
    if segments.len() < 2 {
        return None;
    }

    let version = segments.last()?.replace(".tar", "");
    if version.is_empty() { None } else { Some(version) }
}

/// Compares two version strings.
///
/// Semantic versions are compared with [`semver`]; anything else falls back to
/// a numeric comparison of dot-separated components (`1.2` == `1.2.0`).
/// Returns `None` when either side cannot be parsed.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let strip = |v: &str| v.trim().trim_start_matches('v').to_string();
    let (a, b) = (strip(a), strip(b));

    if let (Ok(left), Ok(right)) = (semver::Version::parse(&a), semver::Version::parse(&b)) {
        return Some(left.cmp(&right));
    }

    let numeric = |v: &str| -> Option<Vec<u64>> {
        v.split('.').map(|part| part.parse::<u64>().ok()).collect()
    };
    let (mut left, mut right) = (numeric(&a)?, numeric(&b)?);
    let len = left.len().max(right.len());
    left.resize(len, 0);
    right.resize(len, 0);
    Some(left.cmp(&right))
}

/// Decides whether a cached artifact can be trusted as already downloaded.
///
/// The artifact is current only when a last-applied record exists, the
/// artifact's version is not older than the recorded one, and the artifact
/// was not modified before the recorded time.
#[must_use]
pub fn is_cached_artifact_current(
    applied: Option<&AppliedVersion>,
    artifact_version: Option<&str>,
    artifact_modified: DateTime<Utc>,
) -> bool {
    let Some(applied) = applied else {
        return false;
    };

    if let (Some(artifact), Some(recorded)) = (artifact_version, applied.version.as_deref()) {
        if compare_versions(artifact, recorded) == Some(Ordering::Less) {
            return false;
        }
    }

    applied.modified.is_none_or(|recorded| artifact_modified >= recorded)
}
