//! Package download.
//!
//! The download URL depends on the [`CheckOutcome`]:
//!
//! | Outcome | Request |
//! |---------|---------|
//! | [`CheckOutcome::ManifestAvailable`] | `GET download-upgrade?fromVersion=..&includePrerelease=..` |
//! | [`CheckOutcome::LegacyAvailable`] | `GET download?includePreRelease=..` |
//! | [`CheckOutcome::UpToDate`] with a validated cached artifact | no request, the artifact is reused |
//! | [`CheckOutcome::UpToDate`] without one (forced update) | `GET download?includePreRelease=..` |
//!
//! Manifest bundles are specific to a version pair and are always fetched.
//! When the server did not echo `currentVersion`, `fromVersion` is the locally
//! resolved version.
//!
//! The body is streamed in small chunks into `<name>.part` next to the other
//! artifacts and renamed once complete. The file name comes from the
//! `Content-Disposition` header and the file's modification time from
//! `Last-Modified`, falling back to the current time.

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::UpdaterConfig;
use crate::constants::{DEFAULT_DOWNLOAD_NAME, DOWNLOAD_CHUNK_SIZE};
use crate::core::UpdaterError;
use crate::upgrade::checker::CheckOutcome;
use crate::upgrade::progress::{ProgressSink, ThrottledProgress};
use crate::upgrade::transport::UpdateTransport;
use crate::upgrade::version_store::VersionStore;
use crate::utils::fs::{ensure_dir, remove_file_if_exists, set_modified_time};

/// Downloads update packages into the working directory.
pub struct Downloader {
    config: UpdaterConfig,
    transport: Arc<dyn UpdateTransport>,
}

impl Downloader {
    /// Creates a downloader.
    pub fn new(config: UpdaterConfig, transport: Arc<dyn UpdateTransport>) -> Self {
        Self {
            config,
            transport,
        }
    }

    /// Downloads the package selected by `outcome` and returns its path.
    ///
    /// # Errors
    ///
    /// - [`UpdaterError::ConfigurationError`] when the outcome is an error
    /// - [`UpdaterError::ProtocolError`] for a non-success status
    /// - [`UpdaterError::TransportError`] for network failures and truncated bodies
    pub async fn download(&self, outcome: &CheckOutcome, sink: &dyn ProgressSink) -> Result<PathBuf> {
        let include = self.config.include_prerelease.to_string();
        let url = match outcome {
            CheckOutcome::Error(message) => {
                return Err(UpdaterError::ConfigurationError {
                    message: message.clone(),
                }
                .into());
            }
            CheckOutcome::UpToDate {
                cached_artifact: Some(artifact),
            } => return self.reuse_cached(artifact, sink).await,
            CheckOutcome::ManifestAvailable(info) => {
                let from = match &info.current_version {
                    Some(version) => Some(version.clone()),
                    None => VersionStore::new(self.config.work_dir()).resolve().await?.version,
                };
                let from = from.unwrap_or_default();
                self.config.endpoint_url(
                    "download-upgrade",
                    &[("fromVersion", from.as_str()), ("includePrerelease", include.as_str())],
                )?
            }
            CheckOutcome::LegacyAvailable
            | CheckOutcome::UpToDate {
                cached_artifact: None,
            } => self.config.endpoint_url("download", &[("includePreRelease", include.as_str())])?,
        };

        info!("Downloading update from {url}");
        let response = self.transport.download(url.as_str()).await?;
        if !(200..300).contains(&response.status) {
            return Err(UpdaterError::ProtocolError {
                endpoint: url.path().to_string(),
                status: response.status,
            }
            .into());
        }

        let work_dir = self.config.work_dir();
        ensure_dir(&work_dir).await?;
        let file_name = response
            .file_name
            .as_deref()
            .and_then(sanitize_file_name)
            .unwrap_or_else(|| DEFAULT_DOWNLOAD_NAME.to_string());
        let target = work_dir.join(&file_name);
        let partial = work_dir.join(format!("{file_name}.part"));

        let total = response.content_length;
        let mut progress = ThrottledProgress::new(sink);
        progress.start(total);

        let written = match stream_to_file(response.body, &partial, total, &mut progress).await {
            Ok(written) => written,
            Err(e) => {
                remove_file_if_exists(&partial).await.ok();
                return Err(e);
            }
        };

        if let Some(expected) = total {
            if written != expected {
                remove_file_if_exists(&partial).await.ok();
                return Err(UpdaterError::TransportError {
                    operation: "download".to_string(),
                    reason: format!("body ended after {written} of {expected} bytes"),
                }
                .into());
            }
        }

        fs::rename(&partial, &target)
            .await
            .with_context(|| format!("Failed to move download into place: {}", target.display()))?;
        set_modified_time(&target, response.last_modified.unwrap_or_else(Utc::now)).await?;

        progress.finish(written, total);
        info!("Downloaded {} ({written} bytes)", target.display());
        Ok(target)
    }

    async fn reuse_cached(&self, artifact: &Path, sink: &dyn ProgressSink) -> Result<PathBuf> {
        info!("Already downloaded, reusing {}", artifact.display());
        let len = fs::metadata(artifact)
            .await
            .with_context(|| format!("Cached artifact disappeared: {}", artifact.display()))?
            .len();

        let mut progress = ThrottledProgress::new(sink);
        progress.finish(len, Some(len));
        Ok(artifact.to_path_buf())
    }
}

async fn stream_to_file(
    mut body: futures::stream::BoxStream<'static, Result<bytes::Bytes>>,
    path: &Path,
    total: Option<u64>,
    progress: &mut ThrottledProgress<'_>,
) -> Result<u64> {
    let mut file = File::create(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for piece in chunk.chunks(DOWNLOAD_CHUNK_SIZE) {
            file.write_all(piece)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            written += piece.len() as u64;
            progress.update(written, total);
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    debug!("Wrote {written} bytes to {}", path.display());
    Ok(written)
}

/// Reduces a server-supplied file name to a safe final path component.
///
/// Returns `None` when nothing usable remains.
#[must_use]
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.replace('\\', "/");
    let last = last.rsplit('/').next().unwrap_or_default().trim();

    if last.is_empty() || last == "." || last == ".." || last.contains('\0') {
        return None;
    }
    Some(last.to_string())
}
