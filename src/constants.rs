//! Global constants used throughout the updater.
//!
//! Timeouts, retry parameters, well-known file names and wire constants
//! shared by several modules live here so that magic numbers stay
//! discoverable.

use std::time::Duration;

/// Timeout applied to update-check calls (5 seconds).
///
/// Only the check endpoints are bounded. Downloads, extraction and
/// script execution rely on OS-level limits.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum interval between two throttled progress events (~60 Hz).
pub const PROGRESS_INTERVAL: Duration = Duration::from_micros(16_667);

/// Chunk size used when streaming download bodies to disk.
pub const DOWNLOAD_CHUNK_SIZE: usize = 1024;

/// Tar block size in bytes.
pub const TAR_BLOCK_SIZE: usize = 512;

/// Maximum number of retries for a locked destination file.
///
/// The first attempt is not counted, so a file is tried at most
/// `LOCKED_FILE_MAX_RETRIES + 1` times before extraction fails.
pub const LOCKED_FILE_MAX_RETRIES: u32 = 8;

/// Number of failed attempts after which the process holding a locked
/// file is terminated.
pub const LOCKED_FILE_KILL_AFTER: u32 = 3;

/// Delay between attempts to write a locked file.
pub const LOCKED_FILE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Suffix of downloadable package artifacts in the working directory.
pub const PACKAGE_SUFFIX: &str = ".tar.gz";

/// File name used when the server does not send a `Content-Disposition`.
pub const DEFAULT_DOWNLOAD_NAME: &str = "unknown.gz";

/// Marker file that turns an extracted payload into an upgrade bundle.
pub const PACKAGE_MANIFEST_FILE: &str = "package-manifest.json";

/// Directory inside a bundle holding one subdirectory per upgrade unit.
pub const UPGRADES_DIR: &str = "upgrades";

/// Per-unit manifest file name.
pub const UNIT_MANIFEST_FILE: &str = "manifest.json";

/// Persisted last-applied version record.
pub const VERSION_STATE_FILE: &str = "last-version.json";

/// Lock file guarding a running update cycle.
pub const CYCLE_LOCK_FILE: &str = ".app-updater.lock";

/// Structured session history file.
pub const HISTORY_FILE: &str = "upgrade-history.json";

/// Number of sessions retained in the history file.
pub const MAX_HISTORY_SESSIONS: usize = 50;

/// Value of the `User-Agent` header sent with every request.
pub fn user_agent() -> String {
    format!("AppUpdater/{}", env!("CARGO_PKG_VERSION"))
}
