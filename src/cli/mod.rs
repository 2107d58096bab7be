//! Command-line interface for the updater.
//!
//! # Commands
//!
//! - `check` - ask the server whether an update is available
//! - `update [--force]` - run a full update cycle
//! - `latest` - show the latest published versions
//! - `config show|set|path` - inspect and edit the configuration file
//!
//! # Global Options
//!
//! - `--verbose` / `-v` - debug output on the console
//! - `--quiet` / `-q` - errors only
//! - `--no-progress` - hide progress bars (also `UPDATER_NO_PROGRESS`)
//! - `--config <PATH>` - configuration file (also `UPDATER_CONFIG_PATH`)
//!
//! # Examples
//!
//! ```bash
//! app-updater config set server_url updates.example.com
//! app-updater config set app_name my-app
//! app-updater config set install_path ~/apps/my-app
//! app-updater check
//! app-updater update --no-progress
//! ```

mod check;
mod config;
mod latest;
mod update;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;

use crate::config::UpdaterConfig;
use crate::upgrade::checker::AlertSink;
use crate::utils::logging::init_logging;
use crate::utils::progress::TerminalProgress;

/// Settings derived from the global flags.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Filter for all log outputs unless `RUST_LOG` is set.
    pub log_level: String,
    /// Additional limit for console output.
    pub console_level: LevelFilter,
    /// Hide progress bars.
    pub no_progress: bool,
    /// Explicit configuration file.
    pub config_path: Option<PathBuf>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            console_level: LevelFilter::WARN,
            no_progress: false,
            config_path: None,
        }
    }
}

impl CliConfig {
    /// Progress sink honoring `--no-progress`.
    pub fn progress(&self, prefix: &str) -> TerminalProgress {
        if self.no_progress {
            TerminalProgress::hidden()
        } else {
            TerminalProgress::new(prefix)
        }
    }
}

#[derive(Parser)]
#[command(
    name = "app-updater",
    about = "Self-update agent - check, download and install application updates",
    version,
    long_about = "app-updater asks an update server whether a newer version of the installed \
                  application exists, downloads the package and installs it, running \
                  manifest-driven upgrade units when the package contains them."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Disable progress bars
    #[arg(long, global = true)]
    no_progress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether an update is available
    Check(check::CheckCommand),

    /// Download and install the available update
    Update(update::UpdateCommand),

    /// Show the latest published versions
    Latest(latest::LatestCommand),

    /// Show or change the configuration
    Config(config::ConfigCommand),
}

impl Cli {
    /// Runs the selected command.
    pub async fn execute(self) -> Result<()> {
        let cli_config = self.build_config();

        match self.command {
            Commands::Config(cmd) => cmd.execute(cli_config.config_path.clone()).await,
            Commands::Check(cmd) => {
                let config = load_with_logging(&cli_config).await?;
                cmd.execute(config).await
            }
            Commands::Update(cmd) => {
                let config = load_with_logging(&cli_config).await?;
                cmd.execute(config, &cli_config).await
            }
            Commands::Latest(cmd) => {
                let config = load_with_logging(&cli_config).await?;
                cmd.execute(config).await
            }
        }
    }

    /// Derives [`CliConfig`] from the global flags.
    #[must_use]
    pub fn build_config(&self) -> CliConfig {
        let (log_level, console_level) = if self.verbose {
            ("debug", LevelFilter::DEBUG)
        } else if self.quiet {
            ("info", LevelFilter::ERROR)
        } else {
            ("info", LevelFilter::WARN)
        };

        CliConfig {
            log_level: log_level.to_string(),
            console_level,
            no_progress: self.no_progress,
            config_path: self.config.clone(),
        }
    }
}

/// Loads the configuration and starts logging into its log directory.
async fn load_with_logging(cli_config: &CliConfig) -> Result<UpdaterConfig> {
    let config = UpdaterConfig::load(cli_config.config_path.clone()).await?;
    let log_dir = config.log_dir();
    if let Err(e) = init_logging(&cli_config.log_level, cli_config.console_level, Some(&log_dir)) {
        eprintln!("Warning: logging unavailable: {e}");
    }
    Ok(config)
}

/// Alert sink printing to stderr.
pub(crate) fn terminal_alerts() -> Arc<dyn AlertSink> {
    Arc::new(|message: &str| eprintln!("{} {}", "alert:".yellow().bold(), message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_config_levels() {
        let cli = Cli::try_parse_from(["app-updater", "check"]).unwrap();
        let config = cli.build_config();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.console_level, LevelFilter::WARN);
        assert!(!config.no_progress);

        let cli = Cli::try_parse_from(["app-updater", "-v", "update", "--force"]).unwrap();
        assert_eq!(cli.build_config().console_level, LevelFilter::DEBUG);

        let cli =
            Cli::try_parse_from(["app-updater", "check", "--quiet", "--no-progress", "--config", "/tmp/c.toml"])
                .unwrap();
        let config = cli.build_config();
        assert_eq!(config.console_level, LevelFilter::ERROR);
        assert!(config.no_progress);
        assert_eq!(config.config_path, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["app-updater", "-v", "-q", "check"]).is_err());
    }

    #[test]
    fn test_config_subcommands_parse() {
        assert!(Cli::try_parse_from(["app-updater", "config", "show"]).is_ok());
        assert!(Cli::try_parse_from(["app-updater", "config", "set", "app_name", "demo"]).is_ok());
        assert!(Cli::try_parse_from(["app-updater", "config", "set", "app_name"]).is_err());
    }
}
