//! Error types
//!
//! `SessionError` covers the native session, `TransportError` the duplex
//! channel, and `ExecutionError` is what the controller reports to clients.
//! Each `ExecutionError` maps to a stable wire code.

use std::io;

use thiserror::Error;

use crate::core::pty::OsResourceError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    OsResource(#[from] OsResourceError),

    #[error("Session has already been started")]
    AlreadyStarted,

    #[error("Session has not been started")]
    NotStarted,

    #[error("Session has been torn down")]
    TornDown,

    #[error("Session output has already been taken")]
    OutputTaken,

    #[error("Failed to read from pseudo console: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to write to pseudo console: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to wait for process exit: {0}")]
    Wait(#[source] io::Error),

    #[error("Failed to resize pseudo console: {0}")]
    Resize(#[source] io::Error),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures reported to the client as an `error` event.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("{message}")]
    DomainValidation {
        message: String,
        hint: Option<String>,
    },

    #[error("{message}")]
    DependencyMissing {
        message: String,
        hint: Option<String>,
    },

    #[error("Failed to start process: {0}")]
    OsResource(#[source] OsResourceError),

    #[error("Streaming failed: {0}")]
    Stream(#[source] SessionError),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl ExecutionError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::DomainValidation {
            message: message.into(),
            hint: None,
        }
    }

    pub fn dependency_missing<S: Into<String>, H: Into<String>>(message: S, hint: H) -> Self {
        Self::DependencyMissing {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    /// Stable code carried in the `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::DomainValidation { .. } => "VALIDATION_FAILED",
            ExecutionError::DependencyMissing { .. } => "DEPENDENCY_MISSING",
            ExecutionError::OsResource(_) => "OS_RESOURCE_ERROR",
            ExecutionError::Stream(_) => "STREAM_FAILURE",
            ExecutionError::Cancelled => "CANCELLED",
            ExecutionError::Unexpected(_) => "UNEXPECTED_ERROR",
        }
    }

    pub fn remediation_hint(&self) -> Option<String> {
        match self {
            ExecutionError::DomainValidation { hint, .. }
            | ExecutionError::DependencyMissing { hint, .. } => hint.clone(),
            ExecutionError::OsResource(err) => Some(format!(
                "The operating system refused `{}`; check that the executable exists and \
                 that pseudo consoles are supported on this host",
                err.operation
            )),
            ExecutionError::Stream(_) | ExecutionError::Cancelled | ExecutionError::Unexpected(_) => {
                None
            }
        }
    }
}

impl From<SessionError> for ExecutionError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::OsResource(os) => ExecutionError::OsResource(os),
            other => ExecutionError::Stream(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config: {0}")]
    Write(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ExecutionError::validation("bad").code(), "VALIDATION_FAILED");
        assert_eq!(
            ExecutionError::dependency_missing("no git", "install git").code(),
            "DEPENDENCY_MISSING"
        );
        assert_eq!(ExecutionError::Cancelled.code(), "CANCELLED");
        assert_eq!(
            ExecutionError::Unexpected("boom".into()).code(),
            "UNEXPECTED_ERROR"
        );
    }

    #[test]
    fn test_session_error_conversion() {
        let os = OsResourceError::new("openpty", 24);
        let err: ExecutionError = SessionError::OsResource(os.clone()).into();
        assert_eq!(err.code(), "OS_RESOURCE_ERROR");
        assert!(err.remediation_hint().unwrap().contains("openpty"));

        let err: ExecutionError = SessionError::OutputTaken.into();
        assert_eq!(err.code(), "STREAM_FAILURE");
        assert_eq!(err.remediation_hint(), None);
    }

    #[test]
    fn test_dependency_hint_is_kept() {
        let err = ExecutionError::dependency_missing("terraform not found", "install terraform");
        assert_eq!(err.to_string(), "terraform not found");
        assert_eq!(err.remediation_hint().as_deref(), Some("install terraform"));
    }
}
