//! CLI error types.

use thiserror::Error;

use claw_routing::RoutingError;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// A tree or config file could not be read or parsed.
    #[error("{path}: {reason}")]
    File {
        /// The offending file.
        path: String,
        /// What went wrong.
        reason: String,
    },
    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Output formatting error.
    #[error("format error: {0}")]
    Format(String),
    /// Error from the routing engine.
    #[error(transparent)]
    Routing(#[from] RoutingError),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub(crate) fn file(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::File {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}
