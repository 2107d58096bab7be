//! app-updater - a self-update agent for deployed applications.
//!
//! The agent asks an update server whether a newer version of the installed
//! application exists, downloads the package, unpacks it with a hand-written
//! tar reader and installs it. Packages either replace the installation
//! wholesale or carry manifest-driven upgrade units (scripts, files and
//! permissions) that are applied in order.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌────────────┐  CheckOutcome  ┌────────────┐  package  ┌───────────────┐
//! │ UpdateCheck│ ─────────────► │ Downloader │ ────────► │ ArchiveReader │
//! └────────────┘                └────────────┘           └───────┬───────┘
//!       ▲                                                        │ package-manifest.json?
//!       │ LocalVersionState                                      ▼
//! ┌────────────┐              commit version              ┌───────────────┐
//! │VersionStore│ ◄──────────────────────────────────────  │UpgradeApplier │
//! └────────────┘                                          └───────────────┘
//! ```
//!
//! # Core Modules
//!
//! - [`upgrade`] - the update engine: version state, check protocols, download,
//!   archive extraction, upgrade units and the full update cycle
//! - [`config`] - the TOML configuration file
//! - [`core`] - error types and user-facing error rendering
//! - [`cli`] - the `app-updater` command line
//! - [`utils`] - file system helpers, logging setup and progress bars
//! - [`constants`] - protocol and file-layout constants
//!
//! # Configuration
//!
//! ```toml
//! server_url = "https://updates.example.com"
//! app_name = "my-app"
//! install_path = "~/apps/my-app"
//! include_prerelease = false
//!
//! # Only for servers whose trust is established out of band.
//! accept_invalid_certs = false
//! ```
//!
//! # Server Protocol
//!
//! | Request | Purpose |
//! |---------|---------|
//! | `POST {server}/{app}/check-upgrades?includePrerelease=` | manifest protocol check |
//! | `POST {server}/{app}/check?includePreRelease=` | legacy check, answers `true` when current |
//! | `GET {server}/{app}/download-upgrade?fromVersion=&includePrerelease=` | upgrade bundle |
//! | `GET {server}/{app}/download?includePreRelease=` | full package |
//! | `GET {server}/{app}/latest-info?includePreRelease=` | latest published versions |
//!
//! # Example
//!
//! ```rust,no_run
//! use app_updater::config::UpdaterConfig;
//! use app_updater::upgrade::{HttpTransport, NoProgress, UpdateCycle};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = UpdaterConfig::load(None).await?;
//! let transport = Arc::new(HttpTransport::new(config.accept_invalid_certs)?);
//! let alerts = Arc::new(|message: &str| eprintln!("{message}"));
//!
//! let cycle = UpdateCycle::new(config, transport, alerts);
//! let result = cycle.run(false, &NoProgress).await?;
//! println!("{result:?}");
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod constants;
pub mod core;
pub mod upgrade;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
