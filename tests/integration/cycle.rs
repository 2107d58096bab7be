//! Full update cycles against a scripted server.

use anyhow::Result;
use app_updater::config::UpdaterConfig;
use app_updater::constants::{HISTORY_FILE, PACKAGE_MANIFEST_FILE, UPGRADES_DIR};
use app_updater::core::UpdaterError;
use app_updater::test_utils::{
    MockTransport, RecordingAlerts, RecordingProgress, TarBuilder, gzip, init_test_logging,
    test_config,
};
use app_updater::upgrade::cycle::{CycleLock, CycleResult, UpdateCycle};
use app_updater::upgrade::history::{UpgradeHistory, UpgradeStage};
use app_updater::upgrade::version_store::VersionStore;
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn cycle(config: &UpdaterConfig, transport: &Arc<MockTransport>) -> UpdateCycle {
    UpdateCycle::new(config.clone(), transport.clone(), Arc::new(RecordingAlerts::default()))
}

fn legacy_package() -> Vec<u8> {
    gzip(
        &TarBuilder::new()
            .directory("bin/")
            .file("bin/app", b"#!/bin/sh\necho 1.2.0\n")
            .file("README.md", b"# App 1.2.0\n")
            .build(),
    )
}

#[tokio::test]
async fn test_legacy_package_is_installed_and_committed() -> Result<()> {
    init_test_logging(None);
    let temp = TempDir::new()?;
    let config = test_config(temp.path());
    let published = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
    let transport = Arc::new(
        MockTransport::new().respond("/check?", 200, json!(false)).respond_download(
            "/download?",
            legacy_package(),
            Some("app-1.2.0.tar.gz"),
            Some(published),
        ),
    );
    let progress = RecordingProgress::default();

    let result = cycle(&config, &transport).run(false, &progress).await?;

    let installed = match result {
        CycleResult::Installed(installed) => installed,
        other => panic!("Expected an installation, got {other:?}"),
    };
    assert_eq!(installed.version.as_deref(), Some("1.2.0"));
    assert_eq!(installed.extracted.files, 2);
    assert!(installed.upgrades.is_none());

    let install_dir = config.install_dir()?;
    assert_eq!(std::fs::read_to_string(install_dir.join("README.md"))?, "# App 1.2.0\n");
    assert!(install_dir.join("bin/app").is_file());
    assert!(!install_dir.join("app-1.2.0.tar").exists());
    assert!(installed.package.is_file());
    assert_eq!(installed.package.parent(), Some(config.work_dir().as_path()));

    let store = VersionStore::new(config.work_dir());
    let applied = store.last_applied().await?.unwrap();
    assert_eq!(applied.version.as_deref(), Some("1.2.0"));
    assert_eq!(applied.modified, Some(published));

    let local = store.resolve().await?;
    assert_eq!(local.version.as_deref(), Some("1.2.0"));
    assert_eq!(local.modified_at, Some(published));
    assert!(local.checksum.is_some());

    let events = progress.events();
    assert!(events.iter().any(|e| e.percent == Some(100.0)));
    Ok(())
}

#[tokio::test]
async fn test_next_check_reports_kept_package() -> Result<()> {
    let temp = TempDir::new()?;
    let config = test_config(temp.path());
    let installing = Arc::new(MockTransport::new().respond("/check?", 200, json!(false)).respond_download(
        "/download?",
        legacy_package(),
        Some("app-1.2.0.tar.gz"),
        None,
    ));
    cycle(&config, &installing).run(false, &RecordingProgress::default()).await?;

    let checking = Arc::new(MockTransport::new().respond("/check?", 200, json!(true)));
    let result = cycle(&config, &checking).run(false, &RecordingProgress::default()).await?;

    assert_eq!(result, CycleResult::UpToDate);
    let body = checking.last_body().unwrap();
    assert_eq!(body["Version"], "1.2.0");
    assert!(body["Checksum"].as_str().is_some_and(|c| !c.is_empty()));

    let reinstalled = cycle(&config, &checking).run(true, &RecordingProgress::default()).await?;
    assert!(matches!(reinstalled, CycleResult::Installed(_)));
    assert!(checking.requests().iter().all(|r| !r.contains("/download")));
    Ok(())
}

#[tokio::test]
async fn test_manifest_bundle_is_applied() -> Result<()> {
    let temp = TempDir::new()?;
    let config = test_config(temp.path());
    let store = VersionStore::new(config.work_dir());
    store.commit("1.0.0", Utc::now()).await?;

    let bundle = TarBuilder::new()
        .file(
            PACKAGE_MANIFEST_FILE,
            json!({"fromVersion": "1.0.0", "toVersion": "1.1.0", "upgrades": ["u1", "u2"]})
                .to_string()
                .as_bytes(),
        )
        .file(
            "upgrades/u1/manifest.json",
            json!({"id": "u1", "name": "Binary", "files": [{"path": "payload/app", "target": "bin/app"}]})
                .to_string()
                .as_bytes(),
        )
        .file("upgrades/u1/payload/app", b"app 1.1.0")
        .build();
    let transport = Arc::new(
        MockTransport::new()
            .respond(
                "/check-upgrades",
                200,
                json!({
                    "currentVersion": "1.0.0",
                    "targetVersion": "1.1.0",
                    "upgrades": [{"id": "u1", "name": "Binary", "priority": 1}],
                    "packageSize": 512,
                    "requiresDownload": true
                }),
            )
            .respond_download("/download-upgrade?", gzip(&bundle), None, None),
    );

    let result = cycle(&config, &transport).run(false, &RecordingProgress::default()).await?;

    let installed = match result {
        CycleResult::Installed(installed) => installed,
        other => panic!("Expected an installation, got {other:?}"),
    };
    assert_eq!(installed.version.as_deref(), Some("1.1.0"));
    let report = installed.upgrades.expect("bundle must be applied");
    assert_eq!(report.applied, vec!["u1".to_string()]);
    assert_eq!(report.skipped, vec!["u2".to_string()]);

    let install_dir = config.install_dir()?;
    assert_eq!(std::fs::read_to_string(install_dir.join("bin/app"))?, "app 1.1.0");
    assert!(!install_dir.join(PACKAGE_MANIFEST_FILE).exists());
    assert!(!install_dir.join(UPGRADES_DIR).exists());

    let requests = transport.requests();
    assert!(requests.iter().any(|r| r.contains("fromVersion=1.0.0")));
    assert!(requests.iter().all(|r| !r.contains("/check?")));

    let applied = store.last_applied().await?.unwrap();
    assert_eq!(applied.version.as_deref(), Some("1.1.0"));

    let history = UpgradeHistory::load(&config.log_dir().join(HISTORY_FILE)).await;
    assert_eq!(history.sessions.len(), 1);
    let session = &history.sessions[0];
    assert_eq!(Some(session.session_id), report.session_id);
    assert_eq!(session.package_size, Some(512));
    let stages: Vec<UpgradeStage> = session.upgrades.iter().map(|e| e.stage).collect();
    assert_eq!(&stages[..3], &[UpgradeStage::Check, UpgradeStage::Download, UpgradeStage::Extract]);
    Ok(())
}

#[tokio::test]
async fn test_up_to_date_does_not_download() -> Result<()> {
    let temp = TempDir::new()?;
    let config = test_config(temp.path());
    let transport = Arc::new(
        MockTransport::new()
            .respond("/check?", 200, json!(true))
            .respond_download("/download?", legacy_package(), Some("app-1.2.0.tar.gz"), None),
    );

    let result = cycle(&config, &transport).run(false, &RecordingProgress::default()).await?;

    assert_eq!(result, CycleResult::UpToDate);
    assert!(transport.requests().iter().all(|r| !r.contains("/download")));
    Ok(())
}

#[tokio::test]
async fn test_force_installs_when_up_to_date() -> Result<()> {
    let temp = TempDir::new()?;
    let config = test_config(temp.path());
    let transport = Arc::new(
        MockTransport::new()
            .respond("/check?", 200, json!(true))
            .respond_download("/download?", legacy_package(), Some("app-1.2.0.tar.gz"), None),
    );

    let result = cycle(&config, &transport).run(true, &RecordingProgress::default()).await?;

    assert!(matches!(result, CycleResult::Installed(_)));
    assert!(config.install_dir()?.join("bin/app").is_file());
    Ok(())
}

#[tokio::test]
async fn test_invalid_configuration_fails_without_network() -> Result<()> {
    let temp = TempDir::new()?;
    let mut config = test_config(temp.path());
    config.app_name = None;
    let transport = Arc::new(MockTransport::new());

    let err = cycle(&config, &transport).run(true, &RecordingProgress::default()).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<UpdaterError>(),
        Some(UpdaterError::ConfigurationError { .. })
    ));
    assert!(transport.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_cycle_is_rejected() -> Result<()> {
    let temp = TempDir::new()?;
    let config = test_config(temp.path());
    let transport = Arc::new(MockTransport::new().respond("/check?", 200, json!(false)));

    let _held = CycleLock::acquire(&config.work_dir()).await?;
    let err = cycle(&config, &transport).run(false, &RecordingProgress::default()).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<UpdaterError>(),
        Some(UpdaterError::UpdateInProgress { .. })
    ));
    assert!(transport.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failed_download_leaves_installation_untouched() -> Result<()> {
    let temp = TempDir::new()?;
    let config = test_config(temp.path());
    let install_dir = config.install_dir()?;
    std::fs::write(install_dir.join("keep.txt"), b"current")?;
    let transport = Arc::new(
        MockTransport::new().respond("/check?", 200, json!(false)).respond_empty("/download?", 503),
    );

    let err = cycle(&config, &transport).run(false, &RecordingProgress::default()).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<UpdaterError>(),
        Some(UpdaterError::ProtocolError { status: 503, .. })
    ));
    assert_eq!(std::fs::read_to_string(install_dir.join("keep.txt"))?, "current");
    assert!(VersionStore::new(config.work_dir()).last_applied().await?.is_none());
    Ok(())
}
