//! Structured upgrade history.
//!
//! Each apply phase is recorded as an [`UpgradeSession`] holding one
//! [`UpgradeLogEntry`] per step. Sessions are appended to a JSON file in the
//! log directory so failed upgrades can be diagnosed after the fact. Only the
//! newest [`MAX_HISTORY_SESSIONS`] sessions are kept.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

use crate::constants::MAX_HISTORY_SESSIONS;
use crate::utils::fs::atomic_write;

/// Outcome of a step or a whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeStatus {
    Started,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// Phase of the update cycle an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeStage {
    Check,
    Download,
    Extract,
    PreInstall,
    Install,
    PostInstall,
    Cleanup,
}

/// One recorded step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeLogEntry {
    pub timestamp: DateTime<Utc>,
    pub upgrade_id: String,
    pub upgrade_name: String,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub status: UpgradeStatus,
    pub stage: UpgradeStage,
    pub message: String,
    pub error: Option<String>,
    pub details: Option<String>,
}

impl UpgradeLogEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(
        upgrade_id: impl Into<String>,
        upgrade_name: impl Into<String>,
        stage: UpgradeStage,
        status: UpgradeStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            upgrade_id: upgrade_id.into(),
            upgrade_name: upgrade_name.into(),
            from_version: None,
            to_version: None,
            status,
            stage,
            message: message.into(),
            error: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// One apply phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSession {
    pub session_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub overall_status: UpgradeStatus,
    pub upgrades: Vec<UpgradeLogEntry>,
    pub package_size: Option<u64>,
    pub error: Option<String>,
}

impl UpgradeSession {
    /// Opens a session in the `Started` state.
    pub fn start(from_version: Option<String>, to_version: Option<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            start_time: Utc::now(),
            end_time: None,
            from_version,
            to_version,
            overall_status: UpgradeStatus::Started,
            upgrades: Vec::new(),
            package_size: None,
            error: None,
        }
    }

    /// Appends an entry, filling in the session's versions.
    pub fn record(&mut self, mut entry: UpgradeLogEntry) {
        if entry.from_version.is_none() {
            entry.from_version.clone_from(&self.from_version);
        }
        if entry.to_version.is_none() {
            entry.to_version.clone_from(&self.to_version);
        }
        if self.overall_status == UpgradeStatus::Started {
            self.overall_status = UpgradeStatus::InProgress;
        }
        self.upgrades.push(entry);
    }

    /// Closes the session successfully.
    pub fn complete(&mut self) {
        self.overall_status = UpgradeStatus::Completed;
        self.end_time = Some(Utc::now());
    }

    /// Closes the session with a failure.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.overall_status = UpgradeStatus::Failed;
        self.error = Some(error.into());
        self.end_time = Some(Utc::now());
    }

    /// Entries recorded for one upgrade unit.
    pub fn entries_for<'a>(&'a self, upgrade_id: &'a str) -> impl Iterator<Item = &'a UpgradeLogEntry> + 'a {
        self.upgrades.iter().filter(move |e| e.upgrade_id == upgrade_id)
    }
}

/// Persisted list of sessions, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeHistory {
    pub sessions: Vec<UpgradeSession>,
}

impl UpgradeHistory {
    /// Loads the history file. A missing or unreadable file yields an empty history.
    pub async fn load(path: &Path) -> Self {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!("Failed to read upgrade history {}: {e}", path.display());
                return Self::default();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Replacing corrupt upgrade history {}: {e}", path.display());
            Self::default()
        })
    }

    /// Writes the history as pretty JSON.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize upgrade history")?;
        atomic_write(path, json.as_bytes()).await
    }

    /// Adds a session and drops the oldest beyond the retention limit.
    pub fn push(&mut self, session: UpgradeSession) {
        self.sessions.push(session);
        if self.sessions.len() > MAX_HISTORY_SESSIONS {
            let excess = self.sessions.len() - MAX_HISTORY_SESSIONS;
            self.sessions.drain(..excess);
        }
    }

    /// Loads the history at `path`, appends `session` and saves it back.
    pub async fn append(path: &Path, session: UpgradeSession) -> Result<()> {
        let mut history = Self::load(path).await;
        history.push(session);
        history.save(path).await
    }
}
