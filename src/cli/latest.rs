//! `latest` command.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::sync::Arc;

use crate::config::UpdaterConfig;
use crate::upgrade::checker::UpdateChecker;
use crate::upgrade::models::VersionDescriptor;
use crate::upgrade::transport::HttpTransport;
use crate::upgrade::version_store::VersionStore;

#[derive(Args, Debug)]
pub struct LatestCommand {}

impl LatestCommand {
    pub async fn execute(self, config: UpdaterConfig) -> Result<()> {
        let transport = Arc::new(HttpTransport::new(config.accept_invalid_certs)?);
        let store = VersionStore::new(config.work_dir());
        let checker = UpdateChecker::new(config, store, transport, super::terminal_alerts());

        let info = checker.latest_info().await?;
        println!("{}", "Latest versions".bold());
        println!("  stable:      {}", describe(info.stable.as_ref()));
        println!("  pre-release: {}", describe(info.pre_release.as_ref()));
        Ok(())
    }
}

fn describe(descriptor: Option<&VersionDescriptor>) -> String {
    match descriptor.and_then(|d| d.version.as_deref().map(|v| (v, d.modified))) {
        Some((version, Some(modified))) => {
            format!("{} ({})", version.green(), modified.format("%Y-%m-%d %H:%M UTC"))
        }
        Some((version, None)) => version.green().to_string(),
        None => "none".dimmed().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_describe() {
        colored::control::set_override(false);
        let descriptor = VersionDescriptor {
            version: Some("2.1.0".to_string()),
            modified: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).single(),
        };
        assert_eq!(describe(Some(&descriptor)), "2.1.0 (2024-05-01 12:30 UTC)");
        assert_eq!(describe(None), "none");
        assert_eq!(
            describe(Some(&VersionDescriptor {
                version: None,
                modified: None
            })),
            "none"
        );
    }
}
