//! `update` command.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::sync::Arc;

use super::CliConfig;
use crate::config::UpdaterConfig;
use crate::upgrade::cycle::{CycleResult, UpdateCycle};
use crate::upgrade::transport::HttpTransport;
use crate::utils::fs::format_size;

#[derive(Args, Debug)]
pub struct UpdateCommand {
    /// Download and install even when the check reports no update
    #[arg(short, long)]
    pub force: bool,
}

impl UpdateCommand {
    pub async fn execute(self, config: UpdaterConfig, cli_config: &CliConfig) -> Result<()> {
        let transport = Arc::new(HttpTransport::new(config.accept_invalid_certs)?);
        let cycle = UpdateCycle::new(config, transport, super::terminal_alerts());

        println!("{}", "Checking for updates...".cyan());
        let progress = cli_config.progress("Updating");
        let result = cycle.run(self.force, &progress).await;
        progress.finish_and_clear();

        match result? {
            CycleResult::UpToDate => {
                println!("{}", "Application is up to date".green());
            }
            CycleResult::Installed(installed) => {
                let version = installed.version.as_deref().unwrap_or("unknown version");
                println!("{}", format!("Installed {version}").green().bold());
                println!(
                    "  {} file(s) extracted ({})",
                    installed.extracted.files,
                    format_size(installed.extracted.bytes)
                );
                if !installed.extracted.skipped.is_empty() {
                    println!(
                        "  {}",
                        format!(
                            "{} entr(ies) outside the install directory were skipped",
                            installed.extracted.skipped.len()
                        )
                        .yellow()
                    );
                }
                if let Some(report) = installed.upgrades {
                    println!("  {} upgrade(s) applied", report.applied.len());
                    for id in &report.skipped {
                        println!("  {}", format!("Upgrade {id} skipped: manifest missing").yellow());
                    }
                }
            }
        }
        Ok(())
    }
}
