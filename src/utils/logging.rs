//! Logging setup for the updater binary.
//!
//! Console output goes to stderr. When a log directory is available two
//! plaintext files are appended to as well:
//!
//! - `upgrade.log` receives every event that passes the filter
//! - `error.log` receives `ERROR` events only
//!
//! `RUST_LOG` takes precedence over the level chosen on the command line.
//! Files are never rotated.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Log file receiving every event.
pub const UPGRADE_LOG_FILE: &str = "upgrade.log";

/// Log file receiving errors only.
pub const ERROR_LOG_FILE: &str = "error.log";

/// Normalizes a user-supplied level name.
#[must_use]
pub fn parse_level(value: &str) -> String {
    match value.to_lowercase().as_str() {
        "trace" => "trace".to_string(),
        "debug" => "debug".to_string(),
        "info" => "info".to_string(),
        "warn" | "warning" => "warn".to_string(),
        "error" => "error".to_string(),
        "off" | "none" => "off".to_string(),
        _ => DEFAULT_LOG_LEVEL.to_string(),
    }
}

/// Opens `name` in `log_dir` for appending, creating both as needed.
fn open_log(log_dir: &Path, name: &str) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(log_dir.join(name))
}

/// Opens `upgrade.log` and `error.log` in `log_dir`.
pub fn open_log_files(log_dir: &Path) -> io::Result<(File, File)> {
    fs::create_dir_all(log_dir)?;
    Ok((open_log(log_dir, UPGRADE_LOG_FILE)?, open_log(log_dir, ERROR_LOG_FILE)?))
}

/// Installs the global subscriber.
///
/// `level` is the filter for all outputs unless `RUST_LOG` is set. `console`
/// further limits what reaches stderr. When `log_dir` cannot be created the
/// updater still runs with console logging only.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(level: &str, console: LevelFilter, log_dir: Option<&Path>) -> io::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(parse_level(level)));

    let console_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(console);

    let files = log_dir.and_then(|dir| match open_log_files(dir) {
        Ok(files) => Some((dir.to_path_buf(), files)),
        Err(e) => {
            eprintln!("Warning: cannot open log files in {}: {e}", dir.display());
            None
        }
    });

    let (log_path, upgrade_layer, error_layer) = match files {
        Some((dir, (upgrade_log, error_log))) => (
            Some(dir),
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(upgrade_log).with_max_level(Level::TRACE))
                    .with_ansi(false)
                    .with_target(true),
            ),
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(error_log).with_max_level(Level::ERROR))
                    .with_ansi(false)
                    .with_target(true),
            ),
        ),
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(upgrade_layer)
        .with(error_layer)
        .try_init()
        .map_err(io::Error::other)?;

    if let Some(dir) = &log_path {
        tracing::debug!("Logging to {}", dir.display());
    }
    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), "debug");
        assert_eq!(parse_level("warning"), "warn");
        assert_eq!(parse_level("none"), "off");
        assert_eq!(parse_level("loud"), DEFAULT_LOG_LEVEL);
    }

    #[test]
    fn test_open_log_files_creates_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("nested/logs");

        open_log_files(&dir).unwrap();
        assert!(dir.join(UPGRADE_LOG_FILE).exists());
        assert!(dir.join(ERROR_LOG_FILE).exists());
    }

    #[test]
    fn test_open_log_files_appends() {
        use std::io::Write;

        let temp = TempDir::new().unwrap();
        {
            let (mut upgrade, _) = open_log_files(temp.path()).unwrap();
            writeln!(upgrade, "first").unwrap();
        }
        {
            let (mut upgrade, _) = open_log_files(temp.path()).unwrap();
            writeln!(upgrade, "second").unwrap();
        }
        let content = fs::read_to_string(temp.path().join(UPGRADE_LOG_FILE)).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }
}
