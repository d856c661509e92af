use std::time::Duration;

use thiserror::Error;

use crate::workspace::WorkspaceState;

/// Errors raised by the directory client, the orchestrator and the SSH merger.
///
/// Callers branch on [`SpaceError::kind`] rather than on message text.
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("the gh CLI is not installed or not on PATH")]
    NotInstalled,

    #[error("gh is not authenticated; run `gh auth login`")]
    NotAuthenticated,

    #[error("gh token is missing the '{scope}' scope; run `gh auth refresh -h github.com -s {scope}`")]
    ScopeRequired { scope: String },

    #[error("{command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("could not parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("workspace '{0}' no longer exists")]
    NotFound(String),

    #[error("workspace '{0}' is in a failed state; rebuild it to recover")]
    FailedState(String),

    #[error("workspace '{name}' did not reach {target} within {waited:?}")]
    Timeout {
        name: String,
        target: WorkspaceState,
        waited: Duration,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid {field} value {value:?}: control characters and line breaks are not allowed")]
    InvalidValue { field: &'static str, value: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Closed classification of [`SpaceError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Tool missing, not authenticated, or scope missing.
    Readiness,
    NotFound,
    FailedState,
    Timeout,
    Cancelled,
    Parse,
    InvalidValue,
    CommandFailed,
    Io,
}

impl SpaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotInstalled | Self::NotAuthenticated | Self::ScopeRequired { .. } => {
                ErrorKind::Readiness
            }
            Self::CommandFailed { .. } => ErrorKind::CommandFailed,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::FailedState(_) => ErrorKind::FailedState,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidValue { .. } => ErrorKind::InvalidValue,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_readiness(&self) -> bool {
        self.kind() == ErrorKind::Readiness
    }

    pub(crate) fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    pub(crate) fn parse(what: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T, E = SpaceError> = std::result::Result<T, E>;
