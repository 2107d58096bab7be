//! Manifest-driven upgrade bundles.
//!
//! A bundle is an extracted package with `package-manifest.json` at its root
//! and one `upgrades/<id>/` directory per upgrade unit:
//!
//! ```text
//! <output root>/
//! ├── package-manifest.json      {"fromVersion", "toVersion", "upgrades": ["u1", "u2"]}
//! └── upgrades/
//!     ├── u1/
//!     │   ├── manifest.json      {"files": [...], "preInstallScript": "pre.sh"}
//!     │   ├── pre.sh
//!     │   └── payload/...
//!     └── u2/...
//! ```
//!
//! Units run in the order the package manifest lists them. A unit whose
//! `manifest.json` is missing is logged and skipped. Any other failure aborts
//! the whole apply and leaves the bundle in place for diagnosis; on success
//! the package manifest and the `upgrades/` tree are removed.
//!
//! Every apply is recorded as an [`UpgradeSession`] in the upgrade history.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::archive::ArchiveReader;
use super::history::{UpgradeHistory, UpgradeLogEntry, UpgradeSession, UpgradeStage, UpgradeStatus};
use super::lock_recovery::with_lock_retry;
use super::models::{FileSpec, PackageManifest, UpgradeManifest};
use super::progress::NoProgress;
use super::script::ScriptRunner;
use super::verification::ChecksumVerifier;
use crate::constants::{UNIT_MANIFEST_FILE, UPGRADES_DIR};
use crate::core::UpdaterError;
use crate::utils::fs::{ensure_dir, remove_file_if_exists, resolve_contained};

/// Result of a completed apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Session recorded in the upgrade history, if any unit was processed.
    pub session_id: Option<Uuid>,
    /// Units applied, in execution order.
    pub applied: Vec<String>,
    /// Units skipped because their manifest was missing.
    pub skipped: Vec<String>,
}

/// How a bundle reached the output root.
///
/// The steps are recorded at the start of the session, ahead of the units.
#[derive(Debug, Clone, Default)]
pub struct BundleOrigin {
    /// Size of the downloaded package in bytes.
    pub package_size: Option<u64>,
    /// Check, download and extract steps that produced the bundle.
    pub steps: Vec<UpgradeLogEntry>,
}

/// Applies upgrade bundles.
pub struct UpgradeApplier {
    archive: ArchiveReader,
    scripts: ScriptRunner,
    history_path: Option<PathBuf>,
}

impl UpgradeApplier {
    pub fn new(archive: ArchiveReader) -> Self {
        Self {
            archive,
            scripts: ScriptRunner,
            history_path: None,
        }
    }

    /// Records sessions in the history file at `path`.
    #[must_use]
    pub fn with_history(mut self, path: PathBuf) -> Self {
        self.history_path = Some(path);
        self
    }

    /// Applies the bundle described by `manifest_path` to `output_root`.
    pub async fn apply(&self, output_root: &Path, manifest_path: &Path) -> Result<ApplyReport> {
        self.apply_from(output_root, manifest_path, BundleOrigin::default()).await
    }

    /// Like [`apply`](Self::apply), recording `origin` in the session.
    pub async fn apply_from(
        &self,
        output_root: &Path,
        manifest_path: &Path,
        origin: BundleOrigin,
    ) -> Result<ApplyReport> {
        let package: PackageManifest = read_manifest(manifest_path).await?;
        let mut report = ApplyReport::default();

        if package.upgrade_ids.is_empty() {
            info!("Package manifest {} lists no upgrades", manifest_path.display());
            return Ok(report);
        }

        info!(
            "Applying {} upgrade(s) from {} to {}",
            package.upgrade_ids.len(),
            package.from_version.as_deref().unwrap_or("unknown"),
            package.to_version.as_deref().unwrap_or("unknown")
        );

        let mut session = UpgradeSession::start(package.from_version.clone(), package.to_version.clone());
        report.session_id = Some(session.session_id);
        session.package_size = origin.package_size;
        for step in origin.steps {
            session.record(step);
        }

        let result = self
            .apply_bundle(output_root, manifest_path, &package, &mut session, &mut report)
            .await;

        match &result {
            Ok(()) => session.complete(),
            Err(e) => {
                error!("Upgrade failed: {e:#}");
                session.fail(format!("{e:#}"));
            }
        }
        self.save_session(session).await;

        result.map(|()| report)
    }

    async fn apply_bundle(
        &self,
        output_root: &Path,
        manifest_path: &Path,
        package: &PackageManifest,
        session: &mut UpgradeSession,
        report: &mut ApplyReport,
    ) -> Result<()> {
        let upgrades_dir = output_root.join(UPGRADES_DIR);

        for id in &package.upgrade_ids {
            if self.apply_unit(output_root, &upgrades_dir, id, session).await? {
                report.applied.push(id.clone());
            } else {
                report.skipped.push(id.clone());
            }
        }

        remove_file_if_exists(manifest_path).await?;
        if tokio::fs::try_exists(&upgrades_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&upgrades_dir)
                .await
                .with_context(|| format!("Failed to remove {}", upgrades_dir.display()))?;
        }
        session.record(UpgradeLogEntry::new(
            "",
            "",
            UpgradeStage::Cleanup,
            UpgradeStatus::Completed,
            "Removed package manifest and upgrade units",
        ));
        Ok(())
    }

    /// Applies one unit. Returns `false` when its manifest is missing.
    async fn apply_unit(
        &self,
        output_root: &Path,
        upgrades_dir: &Path,
        id: &str,
        session: &mut UpgradeSession,
    ) -> Result<bool> {
        let unit_dir = resolve_contained(upgrades_dir, id).ok_or_else(|| UpdaterError::PathTraversalAttempt {
            entry: id.to_string(),
        })?;
        let unit_manifest_path = unit_dir.join(UNIT_MANIFEST_FILE);

        if !tokio::fs::try_exists(&unit_manifest_path).await.unwrap_or(false) {
            let missing = UpdaterError::ManifestMissingError {
                upgrade_id: id.to_string(),
                path: unit_manifest_path.display().to_string(),
            };
            warn!("{missing}");
            session.record(
                UpgradeLogEntry::new(id, id, UpgradeStage::Install, UpgradeStatus::Skipped, "Upgrade manifest missing")
                    .with_error(missing.to_string()),
            );
            return Ok(false);
        }

        let unit: UpgradeManifest = read_manifest(&unit_manifest_path).await?;
        let name = unit.name.clone().unwrap_or_else(|| id.to_string());
        info!("Applying upgrade {id} ({name})");
        session.record(UpgradeLogEntry::new(
            id,
            &name,
            UpgradeStage::Install,
            UpgradeStatus::Started,
            unit.description.clone().unwrap_or_else(|| "Applying upgrade".to_string()),
        ));

        let result = self.run_unit(output_root, &unit_dir, id, &name, &unit, session).await;
        match &result {
            Ok(()) => session.record(UpgradeLogEntry::new(
                id,
                &name,
                UpgradeStage::Install,
                UpgradeStatus::Completed,
                "Upgrade applied",
            )),
            Err(e) => session.record(
                UpgradeLogEntry::new(id, &name, UpgradeStage::Install, UpgradeStatus::Failed, "Upgrade failed")
                    .with_error(format!("{e:#}")),
            ),
        }
        result.map(|()| true)
    }

    async fn run_unit(
        &self,
        output_root: &Path,
        unit_dir: &Path,
        id: &str,
        name: &str,
        unit: &UpgradeManifest,
        session: &mut UpgradeSession,
    ) -> Result<()> {
        if let Some(script) = unit.pre_install_script.as_deref() {
            self.run_script(output_root, unit_dir, script, (id, name), UpgradeStage::PreInstall, session)
                .await?;
        }

        for file in &unit.files {
            if let Some(target) = self.place_file(output_root, unit_dir, id, file).await? {
                session.record(
                    UpgradeLogEntry::new(id, name, UpgradeStage::Install, UpgradeStatus::InProgress, "File placed")
                        .with_details(target.display().to_string()),
                );
            }
        }

        if let Some(script) = unit.post_install_script.as_deref() {
            self.run_script(output_root, unit_dir, script, (id, name), UpgradeStage::PostInstall, session)
                .await?;
        }
        Ok(())
    }

    async fn run_script(
        &self,
        output_root: &Path,
        unit_dir: &Path,
        script: &str,
        (id, name): (&str, &str),
        stage: UpgradeStage,
        session: &mut UpgradeSession,
    ) -> Result<()> {
        if script.trim().is_empty() {
            return Ok(());
        }

        let script_path = resolve_contained(unit_dir, script).ok_or_else(|| UpdaterError::PathTraversalAttempt {
            entry: script.to_string(),
        })?;
        if !tokio::fs::try_exists(&script_path).await.unwrap_or(false) {
            debug!("Script {} not present, skipping", script_path.display());
            return Ok(());
        }

        session.record(UpgradeLogEntry::new(id, name, stage, UpgradeStatus::Started, format!("Running {script}")));
        let result = self
            .scripts
            .run(&script_path, unit_dir, output_root, |line| {
                session.record(
                    UpgradeLogEntry::new(id, name, stage, UpgradeStatus::InProgress, line.text)
                        .with_details(line.stream.as_str()),
                );
            })
            .await;

        match &result {
            Ok(()) => session.record(UpgradeLogEntry::new(
                id,
                name,
                stage,
                UpgradeStatus::Completed,
                format!("{script} finished"),
            )),
            Err(e) => session.record(
                UpgradeLogEntry::new(id, name, stage, UpgradeStatus::Failed, format!("{script} failed"))
                    .with_error(format!("{e:#}")),
            ),
        }
        result
    }

    /// Places one file. Returns the target, or `None` when nothing was placed.
    async fn place_file(
        &self,
        output_root: &Path,
        unit_dir: &Path,
        id: &str,
        file: &FileSpec,
    ) -> Result<Option<PathBuf>> {
        let Some(source_rel) = file.source_path.as_deref().filter(|p| !p.trim().is_empty()) else {
            return Ok(None);
        };
        let target_rel = file
            .target_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(source_rel);

        let source = resolve_contained(unit_dir, source_rel).ok_or_else(|| UpdaterError::PathTraversalAttempt {
            entry: source_rel.to_string(),
        })?;
        let target = resolve_contained(output_root, target_rel).ok_or_else(|| UpdaterError::PathTraversalAttempt {
            entry: target_rel.to_string(),
        })?;
        let mode = parse_permissions(file, unit_dir)?;

        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            if file.required {
                return Err(UpdaterError::RequiredFileMissing {
                    upgrade_id: id.to_string(),
                    path: source.display().to_string(),
                }
                .into());
            }
            debug!("Optional file {} missing, skipping", source.display());
            return Ok(None);
        }

        if let Some(parent) = target.parent() {
            ensure_dir(parent).await?;
        }

        if file.explode {
            if let Some(expected) = file.checksum.as_deref() {
                ChecksumVerifier::verify_checksum(&source, expected).await?;
            }
            debug!("Exploding {} into {}", source.display(), target.display());
            self.archive.extract(&source, &target, &NoProgress).await?;
            return Ok(Some(target));
        }

        let (from, to) = (source.as_path(), target.as_path());
        with_lock_retry(to, self.archive.retry_policy(), self.archive.terminator(), move || async move {
            tokio::fs::copy(from, to).await
        })
        .await
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;

        if let Some(expected) = file.checksum.as_deref() {
            ChecksumVerifier::verify_checksum(&target, expected).await?;
        }

        apply_mode(&target, mode, file.executable).await?;
        debug!("Placed {}", target.display());
        Ok(Some(target))
    }

    async fn save_session(&self, session: UpgradeSession) {
        let Some(path) = &self.history_path else {
            return;
        };
        if let Err(e) = UpgradeHistory::append(path, session).await {
            warn!("Failed to record upgrade history: {e:#}");
        }
    }
}

/// Parses `FileSpec.permissions` as an octal mode.
fn parse_permissions(file: &FileSpec, unit_dir: &Path) -> Result<Option<u32>> {
    let Some(raw) = file.permissions.as_deref().map(str::trim).filter(|p| !p.is_empty()) else {
        return Ok(None);
    };

    match u32::from_str_radix(raw, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(Some(mode)),
        _ => Err(UpdaterError::InvalidManifest {
            path: unit_dir.join(UNIT_MANIFEST_FILE).display().to_string(),
            reason: format!("permissions '{raw}' is not an octal mode"),
        }
        .into()),
    }
}

#[cfg(unix)]
async fn apply_mode(target: &Path, mode: Option<u32>, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = match mode {
        Some(mode) => mode,
        None if executable => {
            let current = tokio::fs::metadata(target).await?.permissions().mode();
            current | 0o111
        }
        None => return Ok(()),
    };

    tokio::fs::set_permissions(target, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("Failed to set permissions on {}", target.display()))
}

#[cfg(not(unix))]
async fn apply_mode(_target: &Path, _mode: Option<u32>, _executable: bool) -> Result<()> {
    Ok(())
}

async fn read_manifest<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
    let content = content.trim_start_matches('\u{feff}');

    serde_json::from_str(content).map_err(|e| {
        UpdaterError::InvalidManifest {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}
