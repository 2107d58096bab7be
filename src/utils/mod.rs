//! Shared helpers: file system operations, logging setup and terminal progress.

pub mod fs;
pub mod logging;
pub mod progress;

pub use fs::{atomic_write, ensure_dir, format_size, normalize_path, resolve_contained};
pub use logging::init_logging;
pub use progress::TerminalProgress;
