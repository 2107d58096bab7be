//! The update engine.
//!
//! This module decides whether a newer version of the deployed application
//! exists, downloads the package and installs it into the configured
//! installation directory.
//!
//! # Architecture Overview
//!
//! ## Core Components
//!
//! - **[`VersionStore`]**: local version state from the newest package artifact
//!   or the last-applied record
//! - **[`UpdateChecker`]**: the manifest (`check-upgrades`) and legacy (`check`)
//!   protocols, producing a [`CheckOutcome`]
//! - **[`Downloader`]**: streams the package selected by the outcome into the
//!   working directory
//! - **[`ArchiveReader`]**: gzip decompression and a tar reader that keeps every
//!   entry inside the output root
//! - **[`UpgradeApplier`]**: runs manifest-driven upgrade units (scripts, files,
//!   permissions) from an extracted bundle
//! - **[`UpdateCycle`]**: runs all of the above as one non-reentrant sequence
//!
//! ## Update Process Flow
//!
//! ```text
//! 1. Check
//!    ├── Resolve local version (artifact or last-applied record)
//!    ├── POST check-upgrades when a version is known
//!    └── POST check when the manifest protocol is unavailable
//!
//! 2. Download
//!    ├── Reuse a validated cached artifact (legacy protocol only)
//!    └── GET download-upgrade or download into <name>.part, then rename
//!
//! 3. Extract
//!    ├── Inflate <package>.tar.gz into the install directory
//!    └── Untar, skipping entries that escape the install directory
//!
//! 4. Apply (only when package-manifest.json was extracted)
//!    ├── Per unit: pre-install script, files, post-install script
//!    └── Remove package-manifest.json and upgrades/
//!
//! 5. Commit
//!    ├── Record version and package time in last-version.json
//!    └── Delete the package
//! ```
//!
//! # Progress
//!
//! Long-running steps accept a [`ProgressSink`]. Events are throttled to about
//! 60 per second; the first and the final event of each step are always
//! delivered.
//!
//! # Locked Files
//!
//! Writing over a file held by a running process is retried. From the third
//! failure on, processes that look like the holder are terminated through a
//! [`ProcessTerminator`]; after the ninth failure the write fails with
//! [`LockedFileError`](crate::core::UpdaterError::LockedFileError).

pub mod applier;
pub mod archive;
pub mod checker;
pub mod cycle;
pub mod downloader;
pub mod history;
pub mod lock_recovery;
pub mod models;
pub mod progress;
pub mod script;
pub mod transport;
pub mod verification;
pub mod version_store;

pub use applier::{ApplyReport, UpgradeApplier};
pub use archive::{ArchiveReader, UntarSummary};
pub use checker::{AlertSink, CheckOutcome, SERVER_ERROR_ALERT, UpdateChecker};
pub use cycle::{CycleLock, CycleResult, InstalledUpdate, UpdateCycle};
pub use downloader::Downloader;
pub use history::{UpgradeHistory, UpgradeLogEntry, UpgradeSession, UpgradeStage, UpgradeStatus};
pub use lock_recovery::{LockRetryPolicy, ProcessTerminator, SystemProcessTerminator};
pub use models::{LatestInfo, LocalVersionState, PackageManifest, UpgradeInfo, UpgradeManifest};
pub use progress::{NoProgress, ProgressEvent, ProgressSink, ThrottledProgress};
pub use script::ScriptRunner;
pub use transport::{HttpTransport, UpdateTransport};
pub use verification::ChecksumVerifier;
pub use version_store::{AppliedVersion, VersionStore};
