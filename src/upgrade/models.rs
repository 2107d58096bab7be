//! Wire and on-disk data types for the update protocols.
//!
//! Field names follow the server's JSON contract: check requests use PascalCase
//! (`Version`, `Modified`, `Checksum`), upgrade descriptors and bundle manifests
//! use camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version state of the local installation.
///
/// Derived from a cached package artifact when one exists (including its
/// checksum), otherwise from the persisted last-applied record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalVersionState {
    /// Installed or cached version, if known.
    pub version: Option<String>,
    /// Modification time associated with that version.
    pub modified_at: Option<DateTime<Utc>>,
    /// Content digest of the cached artifact (never set for persisted state).
    pub checksum: Option<String>,
}

impl LocalVersionState {
    /// Returns `true` when a version is known.
    #[must_use]
    pub fn has_version(&self) -> bool {
        self.version.as_deref().is_some_and(|v| !v.trim().is_empty())
    }
}

/// Body of both check endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateCheckRequest {
    /// Local version.
    pub version: Option<String>,
    /// Local modification time.
    pub modified: Option<DateTime<Utc>>,
    /// Local artifact checksum.
    pub checksum: Option<String>,
}

impl From<&LocalVersionState> for UpdateCheckRequest {
    fn from(state: &LocalVersionState) -> Self {
        Self {
            version: state.version.clone(),
            modified: state.modified_at,
            checksum: state.checksum.clone(),
        }
    }
}

/// Response of the manifest check endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeInfo {
    /// Version the server believes the client runs.
    #[serde(default)]
    pub current_version: Option<String>,
    /// Version the package upgrades to.
    #[serde(default)]
    pub target_version: Option<String>,
    /// Upgrade units contained in the package, in server order.
    #[serde(default)]
    pub upgrades: Vec<UpgradeSummary>,
    /// Package size in bytes.
    #[serde(default, rename = "packageSize")]
    pub package_size_bytes: u64,
    /// `false` means the server already considers the client current.
    #[serde(default)]
    pub requires_download: bool,
}

/// Short description of one upgrade unit.
///
/// `priority` is informational; units run in package-manifest list order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeSummary {
    /// Unit id.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Server-assigned priority.
    #[serde(default)]
    pub priority: i32,
}

/// `package-manifest.json` at the root of an upgrade bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    /// Version the bundle upgrades from.
    #[serde(default)]
    pub from_version: Option<String>,
    /// Version the bundle upgrades to.
    #[serde(default)]
    pub to_version: Option<String>,
    /// Upgrade unit ids in execution order.
    #[serde(default, rename = "upgrades")]
    pub upgrade_ids: Vec<String>,
}

/// `upgrades/<id>/manifest.json` describing one upgrade unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeManifest {
    /// Unit id.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Unit version.
    #[serde(default)]
    pub version: Option<String>,
    /// Files placed by this unit.
    #[serde(default)]
    pub files: Vec<FileSpec>,
    /// Script run before files are placed, relative to the unit directory.
    #[serde(default)]
    pub pre_install_script: Option<String>,
    /// Script run after files are placed, relative to the unit directory.
    #[serde(default)]
    pub post_install_script: Option<String>,
}

/// One file placed by an upgrade unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    /// Source path relative to the unit directory.
    #[serde(default, rename = "path")]
    pub source_path: Option<String>,
    /// Target path relative to the destination root.
    #[serde(default, rename = "target")]
    pub target_path: Option<String>,
    /// Octal permission string such as `"755"`.
    #[serde(default)]
    pub permissions: Option<String>,
    /// A missing source is fatal when set.
    #[serde(default)]
    pub required: bool,
    /// Set the executable bit when no explicit permissions are given.
    #[serde(default)]
    pub executable: bool,
    /// Expand the source archive into the target directory.
    #[serde(default)]
    pub explode: bool,
    /// Declared ordering hint; not applied.
    #[serde(default)]
    pub run_order: i32,
    /// Expected content digest of the source.
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Response of the `latest-info` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LatestInfo {
    /// Latest stable release.
    #[serde(default, alias = "stable")]
    pub stable: Option<VersionDescriptor>,
    /// Latest pre-release, if the server publishes one.
    #[serde(default, alias = "preRelease")]
    pub pre_release: Option<VersionDescriptor>,
}

/// A published version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionDescriptor {
    /// Version string.
    #[serde(default, alias = "version")]
    pub version: Option<String>,
    /// Publication time.
    #[serde(default, alias = "modified")]
    pub modified: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_request_uses_pascal_case() {
        let request = UpdateCheckRequest {
            version: Some("1.2.0".to_string()),
            modified: None,
            checksum: Some("abc".to_string()),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["Version"], "1.2.0");
        assert_eq!(json["Checksum"], "abc");
        assert!(json["Modified"].is_null());
    }

    #[test]
    fn test_upgrade_info_parses_server_payload() {
        let info: UpgradeInfo = serde_json::from_str(
            r#"{
                "currentVersion": "1.0.0",
                "targetVersion": "1.1.0",
                "upgrades": [{"id": "u1", "name": "Schema", "priority": 2}],
                "packageSize": 4096,
                "requiresDownload": true
            }"#,
        )
        .unwrap();

        assert_eq!(info.target_version.as_deref(), Some("1.1.0"));
        assert_eq!(info.upgrades[0].priority, 2);
        assert_eq!(info.package_size_bytes, 4096);
        assert!(info.requires_download);
    }

    #[test]
    fn test_file_spec_defaults() {
        let spec: FileSpec = serde_json::from_str(r#"{"path": "bin/tool"}"#).unwrap();
        assert_eq!(spec.source_path.as_deref(), Some("bin/tool"));
        assert!(spec.target_path.is_none());
        assert!(!spec.required && !spec.executable && !spec.explode);
    }

    #[test]
    fn test_package_manifest_upgrade_order_preserved() {
        let manifest: PackageManifest =
            serde_json::from_str(r#"{"fromVersion":"1","toVersion":"2","upgrades":["b","a","c"]}"#)
                .unwrap();
        assert_eq!(manifest.upgrade_ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_latest_info_accepts_both_casings() {
        let pascal: LatestInfo =
            serde_json::from_str(r#"{"Stable":{"Version":"2.0.0"},"PreRelease":null}"#).unwrap();
        let camel: LatestInfo =
            serde_json::from_str(r#"{"stable":{"version":"2.0.0"}}"#).unwrap();
        assert_eq!(pascal, camel);
    }
}
