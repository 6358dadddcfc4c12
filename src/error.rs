//! Error types for sandboxed repair episodes.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for sandbox, service, tool and controller operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The execution environment or a session could not be constructed.
    #[error("failed to provision environment: {0}")]
    EnvironmentProvision(String),

    /// A tool was called with a bad name or bad arguments.
    #[error("invalid tool call: {0}")]
    ToolArgument(String),

    /// The ephemeral service could not be provisioned or bound.
    #[error("service binding failed: {0}")]
    ServiceBinding(String),

    /// The diff could not be computed.
    #[error("diff computation failed: {0}")]
    DiffComputation(String),

    /// Posting the final report failed.
    #[error("reporting failed: {0}")]
    Reporting(String),

    /// The ref carries no numeric identifier.
    #[error("malformed ref '{0}': no numeric identifier found")]
    MalformedRef(String),

    /// A path does not exist in the session.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A path resolves outside the session working directory.
    #[error("path escapes the sandbox: {0}")]
    PathEscape(String),

    /// An operation exceeded its wall-clock limit.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The decision function failed to produce a decision.
    #[error("decision function failed: {0}")]
    Decision(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error during sandbox operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true when the error must end the episode.
    ///
    /// Only environment construction is fatal; everything else is fed back
    /// into deliberation as a failed tool result.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::EnvironmentProvision(_))
    }
}

/// Result type alias for repair operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_provisioning_errors_are_fatal() {
        assert!(Error::EnvironmentProvision("no docker".into()).is_fatal());
        assert!(!Error::ToolArgument("bad".into()).is_fatal());
        assert!(!Error::ServiceBinding("port".into()).is_fatal());
        assert!(!Error::DiffComputation("git".into()).is_fatal());
        assert!(!Error::Reporting("401".into()).is_fatal());
        assert!(!Error::NotFound(PathBuf::from("x")).is_fatal());
    }

    #[test]
    fn not_found_displays_path() {
        let err = Error::NotFound(PathBuf::from("app/models.py"));
        assert_eq!(err.to_string(), "not found: app/models.py");
    }
}
