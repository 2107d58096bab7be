//! Core types shared by every part of the updater.
//!
//! At the moment this is the error taxonomy ([`UpdaterError`]) and the
//! user-facing error rendering ([`ErrorContext`], [`user_friendly_error`]).

pub mod error;

pub use error::{ErrorContext, UpdaterError, user_friendly_error};
