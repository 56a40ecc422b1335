//! Common error types for ciel.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`CielError`].
pub type CielResult<T> = Result<T, CielError>;

/// Errors raised while preparing, running or tearing down a container.
#[derive(Error, Diagnostic, Debug)]
pub enum CielError {
    /// Invalid container name format.
    #[error("Invalid container name: {name}")]
    #[diagnostic(
        code(ciel::container::invalid_name),
        help(
            "Container names must be 1-64 characters of [A-Za-z0-9._-] and start with an alphanumeric character"
        )
    )]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(ciel::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(ciel::io))]
    Io(#[from] std::io::Error),

    /// The union mount could not be established.
    #[error("Failed to mount {}: {source}", target.display())]
    #[diagnostic(
        code(ciel::fs::mount),
        help("Overlay mounts require CAP_SYS_ADMIN; try running with elevated privileges")
    )]
    Mount {
        /// Mount target.
        target: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The union mount could not be removed. The filesystem is still mounted.
    #[error("Failed to unmount {}: {source}", target.display())]
    #[diagnostic(code(ciel::fs::unmount), help("Check for processes still using the mount"))]
    Unmount {
        /// Mount target.
        target: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The mount is gone but its scratch directories could not be removed.
    #[error("Unmounted, but failed to clean up {}: {source}", path.display())]
    #[diagnostic(code(ciel::fs::cleanup))]
    Cleanup {
        /// Directory that could not be removed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A boot or chroot backend could not perform the requested operation.
    ///
    /// This is distinct from a command that ran and exited with a nonzero status.
    #[error("Backend failed to {operation}: {message}")]
    #[diagnostic(code(ciel::backend))]
    Backend {
        /// What the backend was asked to do.
        operation: String,
        /// The error message.
        message: String,
    },

    /// The command dispatch was cancelled by its caller.
    #[error("Command cancelled")]
    #[diagnostic(code(ciel::cancelled))]
    Cancelled,

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(ciel::unsupported), help("ciel containers require Linux"))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(ciel::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl CielError {
    /// Build a [`CielError::Backend`] from an operation name and any displayable cause.
    pub fn backend(operation: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: cause.to_string(),
        }
    }

    /// Returns `true` if the error came from cancelling a dispatch.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
