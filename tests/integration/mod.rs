//! Integration test suite for app-updater
//!
//! End-to-end tests that drive complete update cycles against a scripted
//! transport and run the compiled binary.
//!
//! # Running Integration Tests
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//!
//! - **cycle**: full check, download, extract and apply sequences
//! - **cli**: the `app-updater` binary

mod cli;
mod cycle;
