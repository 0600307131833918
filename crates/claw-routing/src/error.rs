//! Error types for the claw-routing crate.

use thiserror::Error;

/// Errors that can occur while loading routing trees or routing alerts.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// The routing tree (or a referenced definition) is malformed.
    ///
    /// Fatal to that tree version: the last-known-good snapshot stays active.
    #[error("invalid routing configuration: {reason}")]
    Config {
        /// The reason the configuration is invalid.
        reason: String,
    },

    /// The notification sink could not accept a dispatch.
    #[error("dispatch to receiver '{receiver}' failed: {reason}")]
    TransientDispatch {
        /// The receiver the dispatch was addressed to.
        receiver: String,
        /// The reason delivery failed.
        reason: String,
    },

    /// Unexpected internal fault while matching or aggregating.
    #[error("evaluation failed: {reason}")]
    Evaluation {
        /// The reason the evaluation failed.
        reason: String,
    },

    /// A routing tree with the given name does not exist in the source.
    #[error("routing tree not found: {name}")]
    TreeNotFound {
        /// The tree name that was not found.
        name: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The tree source cannot report changes.
    #[error("cannot watch routing trees: {0}")]
    Watch(String),

    /// The engine's background tasks are no longer running.
    #[error("routing engine stopped")]
    EngineStopped,
}

impl RoutingError {
    /// Shorthand for a [`RoutingError::Config`].
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`RoutingError::Evaluation`].
    pub(crate) fn evaluation(reason: impl Into<String>) -> Self {
        Self::Evaluation {
            reason: reason.into(),
        }
    }

    /// Returns true if this error rejects a tree version.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

impl From<serde_json::Error> for RoutingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for routing operations.
pub type Result<T> = std::result::Result<T, RoutingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_config() {
        let err = RoutingError::config("unknown mute interval 'weekends'");
        assert_eq!(
            err.to_string(),
            "invalid routing configuration: unknown mute interval 'weekends'"
        );
        assert!(err.is_config());
    }

    #[test]
    fn error_display_transient_dispatch() {
        let err = RoutingError::TransientDispatch {
            receiver: "ops".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "dispatch to receiver 'ops' failed: connection refused"
        );
        assert!(!err.is_config());
    }

    #[test]
    fn error_display_evaluation() {
        let err = RoutingError::evaluation("active group without flush time");
        assert_eq!(
            err.to_string(),
            "evaluation failed: active group without flush time"
        );
    }

    #[test]
    fn error_display_tree_not_found() {
        let err = RoutingError::TreeNotFound {
            name: "user-defined".to_string(),
        };
        assert_eq!(err.to_string(), "routing tree not found: user-defined");
    }

    #[test]
    fn error_display_watch() {
        let err = RoutingError::Watch("no such directory".to_string());
        assert_eq!(err.to_string(), "cannot watch routing trees: no such directory");
        assert!(!err.is_config());
    }

    #[test]
    fn error_display_engine_stopped() {
        assert_eq!(RoutingError::EngineStopped.to_string(), "routing engine stopped");
    }

    #[test]
    fn error_from_serde_json() {
        let json_err = serde_json::from_str::<String>("invalid json");
        assert!(json_err.is_err());
        let err: RoutingError = json_err.unwrap_err().into();
        assert!(matches!(err, RoutingError::Serialization(_)));
    }
}
