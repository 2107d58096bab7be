//! One complete update cycle.
//!
//! ```text
//! check ──► download ──► decompress ──► untar ──► apply bundle ──► commit
//!                        (install dir)  (install dir)  (if package-manifest.json)
//! ```
//!
//! The persisted version is only written once extraction and every upgrade
//! unit have succeeded. The downloaded package is kept in the working
//! directory, where the next check hashes it. A cycle holds an exclusive lock file in the working
//! directory for its whole duration, so two cycles never overlap, whether
//! they run in the same process or not.

use anyhow::{Context, Result};
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::applier::{ApplyReport, BundleOrigin, UpgradeApplier};
use super::history::{UpgradeLogEntry, UpgradeStage, UpgradeStatus};
use super::archive::{ArchiveReader, UntarSummary};
use super::checker::{AlertSink, CheckOutcome, UpdateChecker};
use super::downloader::Downloader;
use super::progress::ProgressSink;
use super::transport::UpdateTransport;
use super::version_store::{VersionStore, version_from_file_name};
use crate::config::UpdaterConfig;
use crate::constants::{CYCLE_LOCK_FILE, HISTORY_FILE, PACKAGE_MANIFEST_FILE};
use crate::core::UpdaterError;
use crate::utils::fs::{ensure_dir, modified_time, remove_file_if_exists};

/// Exclusive lock held for the duration of a cycle.
///
/// Released when dropped.
pub struct CycleLock {
    _file: File,
    path: PathBuf,
}

impl CycleLock {
    /// Takes the cycle lock in `work_dir` without waiting.
    ///
    /// # Errors
    ///
    /// [`UpdaterError::UpdateInProgress`] when another cycle holds it.
    pub async fn acquire(work_dir: &Path) -> Result<Self> {
        ensure_dir(work_dir).await?;
        let path = work_dir.join(CYCLE_LOCK_FILE);
        let lock_path = path.clone();

        let file = tokio::task::spawn_blocking(move || -> Result<Option<File>> {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)
                .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

            match file.try_lock_exclusive() {
                Ok(true) => Ok(Some(file)),
                Ok(false) => Ok(None),
                Err(e) => Err(e).with_context(|| format!("Failed to lock {}", lock_path.display())),
            }
        })
        .await
        .context("Failed to spawn blocking task for lock acquisition")??;

        match file {
            Some(file) => {
                debug!("Acquired update lock {}", path.display());
                Ok(Self {
                    _file: file,
                    path,
                })
            }
            None => Err(UpdaterError::UpdateInProgress {
                path: path.display().to_string(),
            }
            .into()),
        }
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// What a cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleResult {
    /// No update was needed.
    UpToDate,
    /// A package was installed.
    Installed(InstalledUpdate),
}

/// Details of an installed package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledUpdate {
    /// Version committed to the version state, when one could be derived.
    pub version: Option<String>,
    /// Package file that was installed. It stays in the working directory and
    /// describes the local version on the next check.
    pub package: PathBuf,
    /// Extraction counts.
    pub extracted: UntarSummary,
    /// Upgrade units applied, for bundle packages.
    pub upgrades: Option<ApplyReport>,
}

/// Runs check, download, extraction and apply as one sequence.
pub struct UpdateCycle {
    config: UpdaterConfig,
    store: VersionStore,
    checker: UpdateChecker,
    downloader: Downloader,
    archive: ArchiveReader,
    applier: UpgradeApplier,
}

impl UpdateCycle {
    /// Builds a cycle around `transport`, reporting alerts to `alerts`.
    pub fn new(
        config: UpdaterConfig,
        transport: Arc<dyn UpdateTransport>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self::with_archive_reader(config, transport, alerts, ArchiveReader::new())
    }

    /// Builds a cycle with a custom archive reader, for example one with a
    /// different locked-file policy.
    pub fn with_archive_reader(
        config: UpdaterConfig,
        transport: Arc<dyn UpdateTransport>,
        alerts: Arc<dyn AlertSink>,
        archive: ArchiveReader,
    ) -> Self {
        let store = VersionStore::new(config.work_dir());
        let history = config.log_dir().join(HISTORY_FILE);

        Self {
            checker: UpdateChecker::new(config.clone(), store.clone(), Arc::clone(&transport), alerts),
            downloader: Downloader::new(config.clone(), transport),
            applier: UpgradeApplier::new(archive.clone()).with_history(history),
            archive,
            store,
            config,
        }
    }

    /// The checker used by this cycle.
    pub fn checker(&self) -> &UpdateChecker {
        &self.checker
    }

    /// Runs one cycle.
    ///
    /// With `force`, a package is downloaded and installed even when the
    /// check reports the application as up to date.
    pub async fn run(&self, force: bool, sink: &dyn ProgressSink) -> Result<CycleResult> {
        let _lock = CycleLock::acquire(&self.config.work_dir()).await?;

        let outcome = self.checker.check().await;
        info!("{}", outcome.describe());

        if let CheckOutcome::Error(message) = &outcome {
            return Err(UpdaterError::ConfigurationError {
                message: message.clone(),
            }
            .into());
        }
        if !outcome.is_update_available() && !force {
            return Ok(CycleResult::UpToDate);
        }

        let package = self.downloader.download(&outcome, sink).await?;
        let installed = self.install(&package, &outcome, sink).await?;
        Ok(CycleResult::Installed(installed))
    }

    /// Installs a downloaded package and commits its version.
    async fn install(
        &self,
        package: &Path,
        outcome: &CheckOutcome,
        sink: &dyn ProgressSink,
    ) -> Result<InstalledUpdate> {
        let install_dir = self.config.install_dir()?;
        ensure_dir(&install_dir).await?;

        let tar_path = self.archive.decompress(package, &install_dir, sink).await?;
        let extracted = self.archive.untar(&tar_path, &install_dir, sink).await;
        remove_file_if_exists(&tar_path).await?;
        let extracted = extracted?;

        let manifest_path = install_dir.join(PACKAGE_MANIFEST_FILE);
        let upgrades = if tokio::fs::try_exists(&manifest_path).await.unwrap_or(false) {
            info!("Package contains an upgrade bundle");
            let origin = bundle_origin(package, outcome, &extracted).await;
            Some(self.applier.apply_from(&install_dir, &manifest_path, origin).await?)
        } else {
            None
        };

        let version = version_from_file_name(package).or_else(|| match outcome {
            CheckOutcome::ManifestAvailable(info) => info.target_version.clone(),
            _ => None,
        });
        let modified = modified_time(package).await?;
        match version.as_deref() {
            Some(version) => self.store.commit(version, modified).await?,
            None => warn!(
                "Cannot derive a version from {}, version state left unchanged",
                package.display()
            ),
        }

        info!("Update installed into {}", install_dir.display());

        Ok(InstalledUpdate {
            version,
            package: package.to_path_buf(),
            extracted,
            upgrades,
        })
    }
}

/// Describes the steps that produced a bundle for its history session.
async fn bundle_origin(package: &Path, outcome: &CheckOutcome, extracted: &UntarSummary) -> BundleOrigin {
    let announced = match outcome {
        CheckOutcome::ManifestAvailable(info) if info.package_size_bytes > 0 => Some(info.package_size_bytes),
        _ => None,
    };
    let package_size = match announced {
        Some(size) => Some(size),
        None => tokio::fs::metadata(package).await.ok().map(|m| m.len()),
    };

    let done = |stage, message: String| UpgradeLogEntry::new("", "", stage, UpgradeStatus::Completed, message);
    BundleOrigin {
        package_size,
        steps: vec![
            done(UpgradeStage::Check, outcome.describe()),
            done(UpgradeStage::Download, format!("Package ready at {}", package.display())),
            done(
                UpgradeStage::Extract,
                format!("Extracted {} file(s), skipped {}", extracted.files, extracted.skipped.len()),
            ),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cycle_lock_is_exclusive() -> Result<()> {
        let dir = TempDir::new()?;
        let first = CycleLock::acquire(dir.path()).await?;
        assert!(first.path().ends_with(CYCLE_LOCK_FILE));

        let err = CycleLock::acquire(dir.path()).await.err().expect("second lock must fail");
        assert!(matches!(
            err.downcast_ref::<UpdaterError>(),
            Some(UpdaterError::UpdateInProgress { .. })
        ));

        drop(first);
        CycleLock::acquire(dir.path()).await?;
        Ok(())
    }
}
