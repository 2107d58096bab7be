//! Update check against the server.
//!
//! Two protocols coexist on the server side:
//!
//! - The **manifest protocol** (`check-upgrades`) answers with an [`UpgradeInfo`]
//!   describing the upgrade units between the local and the target version.
//! - The **legacy protocol** (`check`) answers with a single boolean telling
//!   whether the client is up to date.
//!
//! The manifest protocol is tried first whenever a local version is known. Its
//! answer is authoritative unless the server does not implement it (404) or the
//! call fails, in which case the legacy protocol decides.
//!
//! The result is a [`CheckOutcome`] that the caller passes to the
//! [`Downloader`](crate::upgrade::downloader::Downloader), so the download URL
//! follows from the outcome rather than from shared state.
//!
//! # Failure policy
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | invalid configuration | alert, [`CheckOutcome::Error`], no network I/O |
//! | manifest 404 / error / bad status | legacy protocol |
//! | legacy transport failure or bad response | alert, [`CheckOutcome::UpToDate`] |

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::UpdaterConfig;
use crate::core::UpdaterError;
use crate::upgrade::models::{LatestInfo, LocalVersionState, UpdateCheckRequest, UpgradeInfo};
use crate::upgrade::transport::UpdateTransport;
use crate::upgrade::version_store::{VersionStore, is_cached_artifact_current, version_from_file_name};
use crate::utils::fs::modified_time;

/// Message shown when the server cannot be reached during a check.
pub const SERVER_ERROR_ALERT: &str = "Error on calling server. Please contact administrator.";

/// Receiver of user-visible alerts.
///
/// The CLI prints them; an embedding UI would show a blocking dialog.
pub trait AlertSink: Send + Sync {
    /// Presents `message` to the user.
    fn alert(&self, message: &str);
}

impl<F> AlertSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn alert(&self, message: &str) {
        self(message);
    }
}

/// Result of an update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No update is needed.
    ///
    /// `cached_artifact` is set when the legacy protocol validated a package
    /// already present in the working directory; a forced download reuses it.
    UpToDate {
        /// Validated local package, if any.
        cached_artifact: Option<PathBuf>,
    },
    /// The legacy protocol reports a newer package.
    LegacyAvailable,
    /// The manifest protocol reports an upgrade bundle.
    ManifestAvailable(UpgradeInfo),
    /// The check could not run (invalid configuration). Treated as "no update".
    Error(String),
}

impl CheckOutcome {
    /// Returns `true` when an update should be downloaded.
    #[must_use]
    pub const fn is_update_available(&self) -> bool {
        matches!(self, Self::LegacyAvailable | Self::ManifestAvailable(_))
    }

    /// Short human-readable summary.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::UpToDate {
                ..
            } => "Application is up to date".to_string(),
            Self::LegacyAvailable => "A new version is available".to_string(),
            Self::ManifestAvailable(info) => format!(
                "Upgrade available: {} -> {} ({} upgrade(s))",
                info.current_version.as_deref().unwrap_or("unknown"),
                info.target_version.as_deref().unwrap_or("unknown"),
                info.upgrades.len()
            ),
            Self::Error(message) => format!("Update check failed: {message}"),
        }
    }
}

/// Runs update checks.
pub struct UpdateChecker {
    config: UpdaterConfig,
    store: VersionStore,
    transport: Arc<dyn UpdateTransport>,
    alerts: Arc<dyn AlertSink>,
}

impl UpdateChecker {
    /// Creates a checker.
    pub fn new(
        config: UpdaterConfig,
        store: VersionStore,
        transport: Arc<dyn UpdateTransport>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            alerts,
        }
    }

    /// Determines whether an update is available.
    ///
    /// Never fails: every problem is mapped onto an outcome according to the
    /// failure policy described in the module documentation.
    pub async fn check(&self) -> CheckOutcome {
        if let Err(e) = self.config.validate() {
            error!("{e}");
            self.alerts.alert(&e.to_string());
            let message = match e {
                UpdaterError::ConfigurationError {
                    message,
                } => message,
                other => other.to_string(),
            };
            return CheckOutcome::Error(message);
        }

        let state = match self.store.resolve().await {
            Ok(state) => state,
            Err(e) => {
                error!("Failed to resolve local version: {e:#}");
                self.alerts.alert(&format!("Failed to read local version: {e}"));
                return CheckOutcome::Error(format!("{e:#}"));
            }
        };
        debug!("Local version state: {state:?}");
        let request = UpdateCheckRequest::from(&state);

        if state.has_version() {
            match self.check_manifest(&request).await {
                Ok(Some(outcome)) => return outcome,
                Ok(None) => info!("Server does not support upgrade manifests, using legacy check"),
                Err(e) => warn!("Manifest check failed, falling back to legacy check: {e:#}"),
            }
        }

        self.check_legacy(&request, &state).await
    }

    /// Manifest protocol. `Ok(None)` means the server does not implement it.
    async fn check_manifest(&self, request: &UpdateCheckRequest) -> Result<Option<CheckOutcome>> {
        let include = self.config.include_prerelease.to_string();
        let url = self
            .config
            .endpoint_url("check-upgrades", &[("includePrerelease", include.as_str())])?;

        let body = serde_json::to_value(request)?;
        let response = self
            .transport
            .post_json(url.as_str(), &body, Some(self.config.check_timeout()))
            .await?;

        match response.status {
            200 => {
                let info: UpgradeInfo = response.json()?;
                if info.requires_download {
                    info!(
                        "Upgrade bundle available: {:?} -> {:?}",
                        info.current_version, info.target_version
                    );
                    Ok(Some(CheckOutcome::ManifestAvailable(info)))
                } else {
                    Ok(Some(CheckOutcome::UpToDate {
                        cached_artifact: None,
                    }))
                }
            }
            204 => Ok(Some(CheckOutcome::UpToDate {
                cached_artifact: None,
            })),
            404 => Ok(None),
            status => {
                warn!("check-upgrades answered {status}: {}", response.text());
                Err(UpdaterError::ProtocolError {
                    endpoint: "check-upgrades".to_string(),
                    status,
                }
                .into())
            }
        }
    }

    async fn check_legacy(
        &self,
        request: &UpdateCheckRequest,
        state: &LocalVersionState,
    ) -> CheckOutcome {
        match self.legacy_is_up_to_date(request).await {
            Ok(false) => CheckOutcome::LegacyAvailable,
            Ok(true) => CheckOutcome::UpToDate {
                cached_artifact: self.validated_artifact(state).await,
            },
            Err(e) => {
                error!("Legacy update check failed: {e:#}");
                self.alerts.alert(SERVER_ERROR_ALERT);
                CheckOutcome::UpToDate {
                    cached_artifact: None,
                }
            }
        }
    }

    async fn legacy_is_up_to_date(&self, request: &UpdateCheckRequest) -> Result<bool> {
        let include = self.config.include_prerelease.to_string();
        let url =
            self.config.endpoint_url("check", &[("includePreRelease", include.as_str())])?;

        let body = serde_json::to_value(request)?;
        let response = self
            .transport
            .post_json(url.as_str(), &body, Some(self.config.check_timeout()))
            .await?;

        if !(200..300).contains(&response.status) {
            error!("check answered {}: {}", response.status, response.text());
            return Err(UpdaterError::ProtocolError {
                endpoint: "check".to_string(),
                status: response.status,
            }
            .into());
        }

        response.json::<bool>()
    }

    /// Returns the local artifact when it can be trusted as already downloaded.
    async fn validated_artifact(&self, state: &LocalVersionState) -> Option<PathBuf> {
        state.checksum.as_ref()?;
        let artifact = self.store.latest_artifact().await.ok().flatten()?;
        let modified = modified_time(&artifact).await.ok()?;
        let applied = self.store.last_applied().await.ok().flatten();

        let version = version_from_file_name(&artifact);
        if is_cached_artifact_current(applied.as_ref(), version.as_deref(), modified) {
            debug!("Cached artifact {} is current", artifact.display());
            Some(artifact)
        } else {
            debug!("Cached artifact {} is not current", artifact.display());
            None
        }
    }

    /// Fetches the latest published versions.
    pub async fn latest_info(&self) -> Result<LatestInfo> {
        self.config.validate()?;
        let include = self.config.include_prerelease.to_string();
        let url = self
            .config
            .endpoint_url("latest-info", &[("includePreRelease", include.as_str())])?;

        let response = self.transport.get(url.as_str(), Some(self.config.check_timeout())).await?;
        if response.status != 200 {
            return Err(UpdaterError::ProtocolError {
                endpoint: "latest-info".to_string(),
                status: response.status,
            }
            .into());
        }
        response.json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockTransport, RecordingAlerts, test_config};
    use crate::utils::fs::set_modified_time;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        checker: UpdateChecker,
        transport: Arc<MockTransport>,
        alerts: Arc<RecordingAlerts>,
        store: VersionStore,
    }

    fn fixture(transport: MockTransport) -> Fixture {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path());
        let store = VersionStore::new(config.work_dir());
        let transport = Arc::new(transport);
        let alerts = Arc::new(RecordingAlerts::default());
        let checker =
            UpdateChecker::new(config, store.clone(), transport.clone(), alerts.clone());
        Fixture {
            _temp: temp,
            checker,
            transport,
            alerts,
            store,
        }
    }

    #[tokio::test]
    async fn test_invalid_config_makes_no_network_call() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(temp.path());
        config.server_url = None;
        let transport = Arc::new(MockTransport::new());
        let alerts = Arc::new(RecordingAlerts::default());
        let checker = UpdateChecker::new(
            config,
            VersionStore::new(temp.path()),
            transport.clone(),
            alerts.clone(),
        );

        let outcome = checker.check().await;
        assert!(matches!(outcome, CheckOutcome::Error(_)));
        assert!(!outcome.is_update_available());
        assert!(transport.requests().is_empty());
        assert_eq!(alerts.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_version_skips_manifest_protocol() {
        let f = fixture(MockTransport::new().respond("/check?", 200, json!(false)));

        assert_eq!(f.checker.check().await, CheckOutcome::LegacyAvailable);
        let requests = f.transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].contains("/update/test-app/check?includePreRelease=false"));
    }

    #[tokio::test]
    async fn test_manifest_requires_download() {
        let f = fixture(MockTransport::new().respond(
            "/check-upgrades",
            200,
            json!({"currentVersion": "1.0.0", "targetVersion": "1.1.0", "upgrades": [], "packageSize": 10, "requiresDownload": true}),
        ));
        f.store.commit("1.0.0", Utc::now()).await.unwrap();

        match f.checker.check().await {
            CheckOutcome::ManifestAvailable(info) => {
                assert_eq!(info.target_version.as_deref(), Some("1.1.0"));
            }
            other => panic!("Expected manifest outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_manifest_not_required_short_circuits_legacy() {
        let f = fixture(
            MockTransport::new()
                .respond("/check-upgrades", 200, json!({"requiresDownload": false}))
                .respond("/check?", 200, json!(false)),
        );
        f.store.commit("1.0.0", Utc::now()).await.unwrap();

        assert_eq!(
            f.checker.check().await,
            CheckOutcome::UpToDate {
                cached_artifact: None
            }
        );
        let requests = f.transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests.iter().all(|r| !r.contains("/check?")));
    }

    #[tokio::test]
    async fn test_manifest_no_content_is_up_to_date() {
        let f = fixture(MockTransport::new().respond_empty("/check-upgrades", 204));
        f.store.commit("1.0.0", Utc::now()).await.unwrap();

        assert!(matches!(f.checker.check().await, CheckOutcome::UpToDate { .. }));
        assert_eq!(f.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_manifest_404_falls_back_to_legacy() {
        let f = fixture(
            MockTransport::new()
                .respond_empty("/check-upgrades", 404)
                .respond("/check?", 200, json!(false)),
        );
        f.store.commit("1.0.0", Utc::now()).await.unwrap();

        assert_eq!(f.checker.check().await, CheckOutcome::LegacyAvailable);
        assert_eq!(f.transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_manifest_server_error_falls_back_to_legacy() {
        let f = fixture(
            MockTransport::new()
                .respond_empty("/check-upgrades", 500)
                .respond("/check?", 200, json!(true)),
        );
        f.store.commit("1.0.0", Utc::now()).await.unwrap();

        assert!(matches!(f.checker.check().await, CheckOutcome::UpToDate { .. }));
        assert!(f.alerts.messages().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_transport_failure_alerts_and_reports_up_to_date() {
        let f = fixture(MockTransport::new().fail("/check?"));

        assert_eq!(
            f.checker.check().await,
            CheckOutcome::UpToDate {
                cached_artifact: None
            }
        );
        assert_eq!(f.alerts.messages(), vec![SERVER_ERROR_ALERT.to_string()]);
    }

    #[tokio::test]
    async fn test_request_body_describes_artifact() {
        let f = fixture(
            MockTransport::new()
                .respond_empty("/check-upgrades", 404)
                .respond("/check?", 200, json!(true)),
        );
        let artifact = f.store.work_dir().join("app-2.1.0.tar.gz");
        std::fs::write(&artifact, b"payload").unwrap();

        f.checker.check().await;
        let body = f.transport.last_body().unwrap();
        assert_eq!(body["Version"], "2.1.0");
        assert!(body["Checksum"].as_str().unwrap().starts_with("sha256:"));
    }

    #[tokio::test]
    async fn test_legacy_up_to_date_validates_cached_artifact() {
        let f = fixture(
            MockTransport::new()
                .respond_empty("/check-upgrades", 404)
                .respond("/check?", 200, json!(true)),
        );
        let artifact = f.store.work_dir().join("app-1.3.0.tar.gz");
        std::fs::write(&artifact, b"payload").unwrap();
        let time = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        set_modified_time(&artifact, time).await.unwrap();
        f.store.commit("1.3.0", time).await.unwrap();

        assert_eq!(
            f.checker.check().await,
            CheckOutcome::UpToDate {
                cached_artifact: Some(artifact)
            }
        );
    }

    #[tokio::test]
    async fn test_legacy_up_to_date_rejects_stale_artifact() {
        let f = fixture(
            MockTransport::new()
                .respond_empty("/check-upgrades", 404)
                .respond("/check?", 200, json!(true)),
        );
        let artifact = f.store.work_dir().join("app-1.2.0.tar.gz");
        std::fs::write(&artifact, b"payload").unwrap();
        f.store.commit("1.3.0", Utc::now()).await.unwrap();

        assert_eq!(
            f.checker.check().await,
            CheckOutcome::UpToDate {
                cached_artifact: None
            }
        );
    }

    #[tokio::test]
    async fn test_latest_info() {
        let f = fixture(MockTransport::new().respond(
            "/latest-info",
            200,
            json!({"Stable": {"Version": "3.0.0"}, "PreRelease": {"Version": "3.1.0-rc.1"}}),
        ));

        let info = f.checker.latest_info().await.unwrap();
        assert_eq!(info.stable.unwrap().version.as_deref(), Some("3.0.0"));
        assert_eq!(info.pre_release.unwrap().version.as_deref(), Some("3.1.0-rc.1"));
    }
}
