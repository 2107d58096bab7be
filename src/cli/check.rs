//! `check` command.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::sync::Arc;

use crate::config::UpdaterConfig;
use crate::core::UpdaterError;
use crate::upgrade::checker::{CheckOutcome, UpdateChecker};
use crate::upgrade::transport::HttpTransport;
use crate::upgrade::version_store::VersionStore;
use crate::utils::fs::format_size;

#[derive(Args, Debug)]
pub struct CheckCommand {}

impl CheckCommand {
    pub async fn execute(self, config: UpdaterConfig) -> Result<()> {
        let transport = Arc::new(HttpTransport::new(config.accept_invalid_certs)?);
        let store = VersionStore::new(config.work_dir());
        let checker = UpdateChecker::new(config, store, transport, super::terminal_alerts());

        println!("{}", "Checking for updates...".cyan());
        let outcome = checker.check().await;
        print_outcome(&outcome)
    }
}

fn print_outcome(outcome: &CheckOutcome) -> Result<()> {
    match outcome {
        CheckOutcome::Error(message) => {
            return Err(UpdaterError::ConfigurationError {
                message: message.clone(),
            }
            .into());
        }
        CheckOutcome::UpToDate {
            cached_artifact,
        } => {
            println!("{}", outcome.describe().green());
            if let Some(artifact) = cached_artifact {
                println!("  Package already downloaded: {}", artifact.display());
            }
        }
        CheckOutcome::LegacyAvailable => {
            println!("{}", outcome.describe().green());
            println!("Run `app-updater update` to install it");
        }
        CheckOutcome::ManifestAvailable(info) => {
            println!("{}", outcome.describe().green());
            for unit in &info.upgrades {
                println!(
                    "  {} {}",
                    unit.id.as_deref().unwrap_or("?").bold(),
                    unit.name.as_deref().unwrap_or_default()
                );
            }
            if info.package_size_bytes > 0 {
                println!("  Package size: {}", format_size(info.package_size_bytes));
            }
            println!("Run `app-updater update` to install it");
        }
    }
    Ok(())
}
