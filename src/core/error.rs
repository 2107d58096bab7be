//! Error handling for the updater
//!
//! This module provides the error taxonomy used across the update engine together
//! with the helpers that turn those errors into readable terminal output.
//!
//! # Error Handling Strategy
//!
//! - [`UpdaterError`] enumerates every failure the engine distinguishes. Callers that
//!   need to branch on a failure (fallback, skip, retry) `downcast_ref` to it.
//! - Engine functions return [`anyhow::Result`] and attach context with
//!   [`anyhow::Context`] as errors bubble up.
//! - [`ErrorContext`] wraps an error with an optional suggestion and details and is
//!   what the CLI prints before exiting.
//!
//! # Recoverability
//!
//! Not every variant is fatal. The engine recovers from some of them locally:
//!
//! | Variant | Handling |
//! |---------|----------|
//! | [`UpdaterError::ConfigurationError`] | fatal to the check, no network call |
//! | [`UpdaterError::TransportError`] | alert, check reported as up to date |
//! | [`UpdaterError::ProtocolError`] | manifest protocol falls back to legacy |
//! | [`UpdaterError::ArchiveFormatError`] | aborts extraction |
//! | [`UpdaterError::PathTraversalAttempt`] | entry skipped and logged |
//! | [`UpdaterError::LockedFileError`] | raised after retries are exhausted |
//! | [`UpdaterError::ScriptExecutionError`] | aborts the apply step |
//! | [`UpdaterError::ManifestMissingError`] | unit skipped and logged |
//!
//! # Examples
//!
//! ```rust,no_run
//! use app_updater::core::{UpdaterError, user_friendly_error};
//!
//! let err = anyhow::Error::from(UpdaterError::ConfigurationError {
//!     message: "server_url is not set".to_string(),
//! });
//! user_friendly_error(err).display();
//! ```

use colored::Colorize;
use std::fmt;
use thiserror::Error;

/// The main error type for update operations.
///
/// Each variant maps onto one failure mode of the check, download, extract or
/// apply phases and carries enough detail to be reported without further context.
#[derive(Error, Debug)]
pub enum UpdaterError {
    /// Required configuration is missing or malformed.
    ///
    /// Raised before any network I/O when the server URL, application name or
    /// install path is absent, or when the server URL is not absolute.
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// What is wrong with the configuration
        message: String,
    },

    /// The server could not be reached (timeout, DNS, connect or TLS failure).
    #[error("Could not reach update server during {operation}: {reason}")]
    TransportError {
        /// The operation in progress (e.g. "check", "download")
        operation: String,
        /// Underlying transport error message
        reason: String,
    },

    /// The server answered with a status code the protocol does not expect.
    #[error("Unexpected response {status} from {endpoint}")]
    ProtocolError {
        /// Endpoint that answered
        endpoint: String,
        /// HTTP status code received
        status: u16,
    },

    /// A tar header or gzip stream could not be parsed.
    #[error("Invalid archive: {reason}")]
    ArchiveFormatError {
        /// Description of the malformed data
        reason: String,
    },

    /// An archive entry resolved to a path outside the extraction root.
    #[error("Archive entry '{entry}' escapes the output directory")]
    PathTraversalAttempt {
        /// Raw entry name as stored in the archive
        entry: String,
    },

    /// A destination file stayed locked after every retry.
    #[error("File {path} is still locked after {attempts} attempts")]
    LockedFileError {
        /// Destination path that could not be written
        path: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// An install script failed to start or exited with a non-zero status.
    #[error("Script {script} failed: {reason}")]
    ScriptExecutionError {
        /// Script path
        script: String,
        /// Exit status or spawn error
        reason: String,
    },

    /// An upgrade id listed in the package manifest has no unit manifest.
    #[error("Manifest for upgrade '{upgrade_id}' not found at {path}")]
    ManifestMissingError {
        /// Upgrade unit id
        upgrade_id: String,
        /// Expected manifest location
        path: String,
    },

    /// A file marked as required is missing from its upgrade unit.
    #[error("Required file {path} is missing from upgrade '{upgrade_id}'")]
    RequiredFileMissing {
        /// Upgrade unit id
        upgrade_id: String,
        /// Missing source path
        path: String,
    },

    /// A package or unit manifest could not be parsed or holds invalid values.
    #[error("Invalid manifest {path}: {reason}")]
    InvalidManifest {
        /// Manifest path
        path: String,
        /// Parse or validation failure
        reason: String,
    },

    /// A file's content digest does not match the one declared for it.
    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// File that was checked
        path: String,
        /// Declared checksum
        expected: String,
        /// Computed checksum
        actual: String,
    },

    /// Another update cycle holds the cycle lock.
    #[error("Another update is already running (lock held on {path})")]
    UpdateInProgress {
        /// Lock file path
        path: String,
    },

    /// I/O error from the standard library.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other failure.
    #[error("{message}")]
    Other {
        /// Error message
        message: String,
    },
}

impl Clone for UpdaterError {
    fn clone(&self) -> Self {
        match self {
            Self::ConfigurationError {
                message,
            } => Self::ConfigurationError {
                message: message.clone(),
            },
            Self::TransportError {
                operation,
                reason,
            } => Self::TransportError {
                operation: operation.clone(),
                reason: reason.clone(),
            },
            Self::ProtocolError {
                endpoint,
                status,
            } => Self::ProtocolError {
                endpoint: endpoint.clone(),
                status: *status,
            },
            Self::ArchiveFormatError {
                reason,
            } => Self::ArchiveFormatError {
                reason: reason.clone(),
            },
            Self::PathTraversalAttempt {
                entry,
            } => Self::PathTraversalAttempt {
                entry: entry.clone(),
            },
            Self::LockedFileError {
                path,
                attempts,
            } => Self::LockedFileError {
                path: path.clone(),
                attempts: *attempts,
            },
            Self::ScriptExecutionError {
                script,
                reason,
            } => Self::ScriptExecutionError {
                script: script.clone(),
                reason: reason.clone(),
            },
            Self::ManifestMissingError {
                upgrade_id,
                path,
            } => Self::ManifestMissingError {
                upgrade_id: upgrade_id.clone(),
                path: path.clone(),
            },
            Self::RequiredFileMissing {
                upgrade_id,
                path,
            } => Self::RequiredFileMissing {
                upgrade_id: upgrade_id.clone(),
                path: path.clone(),
            },
            Self::InvalidManifest {
                path,
                reason,
            } => Self::InvalidManifest {
                path: path.clone(),
                reason: reason.clone(),
            },
            Self::ChecksumMismatch {
                path,
                expected,
                actual,
            } => Self::ChecksumMismatch {
                path: path.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            Self::UpdateInProgress {
                path,
            } => Self::UpdateInProgress {
                path: path.clone(),
            },
            // io::Error is not Clone
            Self::IoError(e) => Self::Other {
                message: format!("IO error: {e}"),
            },
            Self::Other {
                message,
            } => Self::Other {
                message: message.clone(),
            },
        }
    }
}

/// Error wrapper carrying user-facing guidance.
///
/// The CLI converts every error it receives into an [`ErrorContext`] and prints it
/// with [`ErrorContext::display`].
#[derive(Debug)]
pub struct ErrorContext {
    /// The underlying error
    pub error: UpdaterError,
    /// Optional suggestion for resolving the error
    pub suggestion: Option<String>,
    /// Optional additional details about the error
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a new error context with no suggestion or details.
    #[must_use]
    pub const fn new(error: UpdaterError) -> Self {
        Self {
            error,
            suggestion: None,
            details: None,
        }
    }

    /// Add a suggestion for resolving the error.
    ///
    /// Suggestions are printed in green.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add details explaining the error.
    ///
    /// Details are printed in yellow.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Print the error, details and suggestion to stderr with terminal colors.
    pub fn display(&self) {
        eprintln!("{}: {}", "error".red().bold(), self.error);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Convert any error into an [`ErrorContext`] with a suggestion where one is known.
///
/// [`UpdaterError`]s anywhere in the chain get a tailored suggestion, a few
/// [`std::io::Error`] kinds are mapped to friendlier messages, and everything else
/// becomes [`UpdaterError::Other`] carrying the full context chain.
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    if let Some(ctx) = error.downcast_ref::<ErrorContext>() {
        return ErrorContext {
            error: ctx.error.clone(),
            suggestion: ctx.suggestion.clone(),
            details: ctx.details.clone(),
        };
    }

    for cause in error.chain() {
        if let Some(updater_error) = cause.downcast_ref::<UpdaterError>() {
            return create_error_context(updater_error.clone());
        }
    }

    if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
        match io_error.kind() {
            std::io::ErrorKind::PermissionDenied => {
                return ErrorContext::new(UpdaterError::Other {
                    message: format!("Permission denied: {io_error}"),
                })
                .with_suggestion(
                    "Run the updater as a user that can write to the install directory",
                );
            }
            std::io::ErrorKind::NotFound => {
                return ErrorContext::new(UpdaterError::Other {
                    message: format!("File not found: {io_error}"),
                })
                .with_suggestion("Check that the configured paths exist");
            }
            _ => {}
        }
    }

    ErrorContext::new(UpdaterError::Other {
        message: format!("{error:#}"),
    })
}

fn create_error_context(error: UpdaterError) -> ErrorContext {
    match &error {
        UpdaterError::ConfigurationError {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Set the missing value with 'app-updater config set <key> <value>'")
            .with_details("server_url, app_name and install_path are required"),
        UpdaterError::TransportError {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Check your network connection or contact the administrator"),
        UpdaterError::ProtocolError {
            status,
            ..
        } => {
            let suggestion = if *status >= 500 {
                "The update server reported an internal error. Try again later"
            } else {
                "Verify that server_url and app_name are correct"
            };
            ErrorContext::new(error).with_suggestion(suggestion)
        }
        UpdaterError::ArchiveFormatError {
            ..
        }
        | UpdaterError::ChecksumMismatch {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Delete the downloaded package and run the update again")
            .with_details("The package appears to be corrupt or truncated"),
        UpdaterError::LockedFileError {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Close the application before updating and try again"),
        UpdaterError::ScriptExecutionError {
            ..
        } => ErrorContext::new(error)
            .with_details("Install artifacts were left in place for diagnosis")
            .with_suggestion("Inspect upgrade-history.json in the log directory"),
        UpdaterError::UpdateInProgress {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Wait for the running update to finish"),
        _ => ErrorContext::new(error),
    }
}
