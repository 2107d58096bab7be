//! `config` command.

use anyhow::Result;
use clap::{Args, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use crate::config::{CONFIG_KEYS, UpdaterConfig};

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    command: Option<ConfigSubcommands>,
}

#[derive(Subcommand)]
enum ConfigSubcommands {
    /// Print the configuration
    Show,

    /// Set a configuration key
    Set {
        /// Key name (see `config show`)
        key: String,

        /// New value; an empty string clears optional keys
        value: String,
    },

    /// Print the configuration file path
    Path,
}

impl ConfigCommand {
    pub async fn execute(self, config_path: Option<PathBuf>) -> Result<()> {
        let path = UpdaterConfig::resolve_path(config_path)?;

        match self.command {
            Some(ConfigSubcommands::Show) | None => Self::show(&path).await,
            Some(ConfigSubcommands::Set {
                key,
                value,
            }) => Self::set(&path, &key, &value).await,
            Some(ConfigSubcommands::Path) => {
                println!("{}", path.display());
                Ok(())
            }
        }
    }

    async fn show(path: &std::path::Path) -> Result<()> {
        let exists = path.exists();
        let config = if exists { UpdaterConfig::load_from(path).await? } else { UpdaterConfig::default() };

        println!("{} {}", "Configuration:".bold(), path.display());
        if !exists {
            println!("  {}", "(file not found, showing defaults)".dimmed());
        }
        println!("{}", toml::to_string_pretty(&config)?);

        if let Err(e) = config.validate() {
            println!("{} {e}", "Warning:".yellow().bold());
        }
        println!("{} {}", "Keys:".dimmed(), CONFIG_KEYS.join(", ").dimmed());
        Ok(())
    }

    async fn set(path: &std::path::Path, key: &str, value: &str) -> Result<()> {
        let mut config =
            if path.exists() { UpdaterConfig::load_from(path).await? } else { UpdaterConfig::default() };

        config.set(key, value)?;
        config.save_to(path).await?;

        println!("{} {key} in {}", "Updated".green(), path.display());
        Ok(())
    }
}
