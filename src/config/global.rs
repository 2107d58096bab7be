//! Updater configuration file.
//!
//! The configuration is a small TOML document describing where the update
//! server lives, which application is being updated and where it is installed.
//!
//! # Location
//!
//! Resolved in this order:
//! 1. An explicit path (the CLI `--config` flag)
//! 2. The `UPDATER_CONFIG_PATH` environment variable
//! 3. The platform default:
//!    - Windows: `%LOCALAPPDATA%\app-updater\config.toml`
//!    - macOS/Linux: `~/.app-updater/config.toml`
//!
//! A missing file yields the default (empty) configuration, which then fails
//! [`UpdaterConfig::validate`] until the required keys are set.
//!
//! # Example
//!
//! ```toml
//! server_url = "https://updates.example.com"
//! app_name = "point-of-sale"
//! install_path = "~/apps/pos"
//! include_prerelease = false
//!
//! # Disables TLS certificate validation. Only for servers whose trust is
//! # established out of band.
//! accept_invalid_certs = false
//! ```

use anyhow::{Context, Result, bail};
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::fs;

use crate::constants::DEFAULT_CHECK_TIMEOUT;
use crate::core::UpdaterError;

/// Environment variable overriding the configuration file location.
pub const CONFIG_PATH_ENV: &str = "UPDATER_CONFIG_PATH";

/// Keys accepted by [`UpdaterConfig::set`].
pub const CONFIG_KEYS: &[&str] = &[
    "server_url",
    "app_name",
    "install_path",
    "include_prerelease",
    "accept_invalid_certs",
    "work_dir",
    "log_dir",
    "check_timeout_secs",
];

const fn default_check_timeout_secs() -> u64 {
    DEFAULT_CHECK_TIMEOUT.as_secs()
}

fn is_default_check_timeout(secs: &u64) -> bool {
    *secs == default_check_timeout_secs()
}

/// Updater settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Update server base URL. `http://` is assumed when no scheme is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,

    /// Application identifier used in endpoint paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,

    /// Installation directory receiving extracted packages. Supports `~` and
    /// environment variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,

    /// Ask the server for pre-release versions.
    #[serde(default)]
    pub include_prerelease: bool,

    /// Disable TLS certificate validation.
    ///
    /// Security trade-off: any certificate is accepted, so a network attacker
    /// can serve arbitrary packages. Leave `false` unless server trust is
    /// established out of band.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Directory holding downloaded packages and the last-applied record.
    /// Defaults to the directory of the running executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,

    /// Directory for plaintext and structured logs. Defaults to `<work_dir>/logs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Timeout for check requests, in seconds.
    #[serde(
        default = "default_check_timeout_secs",
        skip_serializing_if = "is_default_check_timeout"
    )]
    pub check_timeout_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            app_name: None,
            install_path: None,
            include_prerelease: false,
            accept_invalid_certs: false,
            work_dir: None,
            log_dir: None,
            check_timeout_secs: default_check_timeout_secs(),
        }
    }
}

impl UpdaterConfig {
    /// Loads the configuration from the resolved location.
    ///
    /// A missing file yields the default configuration.
    pub async fn load(explicit: Option<PathBuf>) -> Result<Self> {
        let path = Self::resolve_path(explicit)?;
        if path.exists() {
            Self::load_from(&path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Loads the configuration from a specific file.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Writes the configuration as TOML.
    ///
    /// On Unix the file is restricted to the owner (0o600).
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mut perms = fs::metadata(path)
                .await
                .with_context(|| format!("Failed to read permissions for {}", path.display()))?
                .permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)
                .await
                .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        }

        Ok(())
    }

    /// Resolves the configuration file location.
    pub fn resolve_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path);
        }
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        Self::default_path()
    }

    /// Platform default configuration path.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = if cfg!(target_os = "windows") {
            dirs::data_local_dir()
                .ok_or_else(|| anyhow::anyhow!("Unable to determine local data directory"))?
                .join("app-updater")
        } else {
            dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("Unable to determine home directory"))?
                .join(".app-updater")
        };

        Ok(config_dir.join("config.toml"))
    }

    /// Checks that the server URL, application name and install path are present
    /// and that the server URL is absolute.
    pub fn validate(&self) -> Result<(), UpdaterError> {
        let missing = |key: &str| UpdaterError::ConfigurationError {
            message: format!("{key} is not set"),
        };

        let server = self
            .server_base()
            .ok_or_else(|| missing("server_url"))?;
        let url = Url::parse(&server).map_err(|e| UpdaterError::ConfigurationError {
            message: format!("server_url '{server}' is not a valid absolute URL: {e}"),
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(UpdaterError::ConfigurationError {
                message: format!("server_url '{server}' must be an http(s) URL with a host"),
            });
        }

        if self.app_name.as_deref().is_none_or(|name| name.trim().is_empty()) {
            return Err(missing("app_name"));
        }
        if self.install_path.as_deref().is_none_or(|path| path.trim().is_empty()) {
            return Err(missing("install_path"));
        }

        Ok(())
    }

    /// Server URL with a scheme and without a trailing slash.
    #[must_use]
    pub fn server_base(&self) -> Option<String> {
        let raw = self.server_url.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        Some(normalize_server_url(raw))
    }

    /// Builds `{server}/update/{app_name}/{endpoint}?{query}`.
    pub fn endpoint_url(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<Url> {
        self.validate()?;
        let server = self.server_base().unwrap_or_default();
        let app_name = self.app_name.as_deref().unwrap_or_default().trim();

        let mut url = Url::parse(&format!("{server}/update/{app_name}/{endpoint}"))
            .with_context(|| format!("Invalid endpoint URL for {endpoint}"))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter().copied());
        }
        Ok(url)
    }

    /// Expanded installation directory.
    pub fn install_dir(&self) -> Result<PathBuf> {
        let raw = self.install_path.as_deref().ok_or_else(|| UpdaterError::ConfigurationError {
            message: "install_path is not set".to_string(),
        })?;
        let expanded = shellexpand::full(raw)
            .with_context(|| format!("Failed to expand install_path '{raw}'"))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }

    /// Directory holding downloaded packages and version state.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        if let Some(dir) = &self.work_dir {
            return dir.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Directory for plaintext and structured logs.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| self.work_dir().join("logs"))
    }

    /// Timeout for check requests.
    #[must_use]
    pub const fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    /// Sets a single key from its string form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = |value: &str| {
            let trimmed = value.trim();
            if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
        };
        let flag = |value: &str| -> Result<bool> {
            match value.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                other => bail!("Invalid boolean for {key}: '{other}'"),
            }
        };

        match key {
            "server_url" => self.server_url = optional(value).map(|v| normalize_server_url(&v)),
            "app_name" => self.app_name = optional(value),
            "install_path" => self.install_path = optional(value),
            "include_prerelease" => self.include_prerelease = flag(value)?,
            "accept_invalid_certs" => self.accept_invalid_certs = flag(value)?,
            "work_dir" => self.work_dir = optional(value).map(PathBuf::from),
            "log_dir" => self.log_dir = optional(value).map(PathBuf::from),
            "check_timeout_secs" => {
                self.check_timeout_secs = value
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid number for {key}: '{value}'"))?;
            }
            other => bail!("Unknown configuration key '{other}'. Valid keys: {}", CONFIG_KEYS.join(", ")),
        }

        Ok(())
    }
}

/// Prefixes `http://` when the URL has no scheme and strips trailing slashes.
#[must_use]
pub fn normalize_server_url(raw: &str) -> String {
    static SCHEME: OnceLock<Option<Regex>> = OnceLock::new();
    let has_scheme = SCHEME
        .get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(raw));

    let with_scheme = if has_scheme { raw.to_string() } else { format!("http://{raw}") };
    with_scheme.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn valid() -> UpdaterConfig {
        UpdaterConfig {
            server_url: Some("https://updates.example.com/".to_string()),
            app_name: Some("pos".to_string()),
            install_path: Some("/opt/pos".to_string()),
            ..UpdaterConfig::default()
        }
    }

    #[test]
    fn test_normalize_server_url() {
        assert_eq!(normalize_server_url("updates.local:8080"), "http://updates.local:8080");
        assert_eq!(normalize_server_url("https://x.io/"), "https://x.io");
    }

    #[test]
    fn test_validate_accepts_complete_config() {
        valid().validate().unwrap();
    }

    #[test]
    fn test_validate_reports_missing_keys() {
        for key in ["server_url", "app_name", "install_path"] {
            let mut config = valid();
            config.set(key, "").unwrap();
            match config.validate() {
                Err(UpdaterError::ConfigurationError {
                    message,
                }) => assert!(message.contains(key), "{message}"),
                other => panic!("Expected configuration error for {key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let mut config = valid();
        config.server_url = Some("ftp://updates.example.com".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_url_encodes_query() {
        let url = valid()
            .endpoint_url("download-upgrade", &[("fromVersion", "1.0 beta"), ("includePrerelease", "false")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://updates.example.com/update/pos/download-upgrade?fromVersion=1.0+beta&includePrerelease=false"
        );
    }

    #[test]
    fn test_set_parses_values() {
        let mut config = UpdaterConfig::default();
        config.set("server_url", "updates.local").unwrap();
        config.set("include_prerelease", "yes").unwrap();
        config.set("check_timeout_secs", "9").unwrap();

        assert_eq!(config.server_url.as_deref(), Some("http://updates.local"));
        assert!(config.include_prerelease);
        assert_eq!(config.check_timeout(), Duration::from_secs(9));
        assert!(config.set("nope", "1").is_err());
        assert!(config.set("accept_invalid_certs", "maybe").is_err());
    }

    #[test]
    fn test_insecure_tls_is_off_by_default() {
        let config: UpdaterConfig = toml::from_str("app_name = \"x\"").unwrap();
        assert!(!config.accept_invalid_certs);
        assert_eq!(config.check_timeout_secs, 5);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/config.toml");
        let config = valid();

        config.save_to(&path).await.unwrap();
        let loaded = UpdaterConfig::load_from(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    #[serial]
    async fn test_load_honors_env_override() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("env.toml");
        std::fs::write(&path, "app_name = \"from-env\"\n").unwrap();

        // SAFETY: serialized test, no other thread reads the environment.
        unsafe { std::env::set_var(CONFIG_PATH_ENV, &path) };
        let loaded = UpdaterConfig::load(None).await;
        unsafe { std::env::remove_var(CONFIG_PATH_ENV) };

        assert_eq!(loaded.unwrap().app_name.as_deref(), Some("from-env"));
    }

    #[tokio::test]
    async fn test_load_missing_file_yields_default() {
        let temp = TempDir::new().unwrap();
        let loaded = UpdaterConfig::load(Some(temp.path().join("absent.toml"))).await.unwrap();
        assert_eq!(loaded, UpdaterConfig::default());
    }
}
