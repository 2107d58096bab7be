//! Configuration management.
//!
//! The updater reads a single TOML file describing the update server, the
//! application identifier and the installation directory. See
//! [`UpdaterConfig`] for the available keys and how the file is located.

mod global;

pub use global::{CONFIG_KEYS, CONFIG_PATH_ENV, UpdaterConfig, normalize_server_url};
