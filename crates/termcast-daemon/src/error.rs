//! Error types of the session host.

use std::io;

use serde_json::{Value, json};
use termcast_common::ErrorCategory;
use termcast_core::SessionId;
use termcast_core::TerminalSizeError;
use termcast_terminal::PtyError;
use thiserror::Error;

/// Which ceiling of the [`crate::ResourceGovernor`] was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Sessions,
    Connections,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Sessions => "sessions",
            Resource::Connections => "connections",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GovernorError {
    #[error("Limit reached: at most {limit} concurrent {}", resource.as_str())]
    LimitReached { resource: Resource, limit: usize },
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session {0} is not running")]
    NotRunning(SessionId),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Invalid working directory '{path}': {reason}")]
    InvalidWorkingDir { path: String, reason: String },
    #[error("Invalid terminal size: {0}")]
    InvalidSize(#[from] TerminalSizeError),
    #[error("Failed to spawn session: {0}")]
    Spawn(#[source] PtyError),
    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),
    #[error(transparent)]
    LimitReached(#[from] GovernorError),
    #[error("Persistence error during {operation}: {reason}")]
    Persistence {
        operation: &'static str,
        reason: String,
    },
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::NotFound(_) => ErrorCategory::NotFound,
            SessionError::NotRunning(_)
            | SessionError::InvalidCommand(_)
            | SessionError::InvalidWorkingDir { .. }
            | SessionError::InvalidSize(_) => ErrorCategory::InvalidInput,
            SessionError::LimitReached(_) => ErrorCategory::Busy,
            SessionError::Spawn(_) | SessionError::Pty(_) => ErrorCategory::External,
            SessionError::Persistence { .. } => ErrorCategory::Internal,
        }
    }

    pub fn context(&self) -> Value {
        match self {
            SessionError::NotFound(id) | SessionError::NotRunning(id) => {
                json!({ "session_id": id })
            }
            SessionError::InvalidCommand(reason) => json!({ "reason": reason }),
            SessionError::InvalidWorkingDir { path, reason } => {
                json!({ "working_dir": path, "reason": reason })
            }
            SessionError::InvalidSize(err) => json!({ "reason": err.to_string() }),
            SessionError::Spawn(err) | SessionError::Pty(err) => err.context(),
            SessionError::LimitReached(GovernorError::LimitReached { resource, limit }) => {
                json!({ "resource": resource.as_str(), "limit": limit })
            }
            SessionError::Persistence { operation, reason } => {
                json!({ "operation": operation, "reason": reason })
            }
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            SessionError::NotFound(_) => {
                "List sessions to see which ones exist, or create a new one.".to_string()
            }
            SessionError::NotRunning(_) => {
                "The process has exited. Create a new session to run it again.".to_string()
            }
            SessionError::InvalidCommand(_) => {
                "Provide the program and its arguments as a non-empty list.".to_string()
            }
            SessionError::InvalidWorkingDir { .. } => {
                "Pass an existing directory as the working directory.".to_string()
            }
            SessionError::InvalidSize(_) => {
                "Columns must be 2-1000 and rows 1-500.".to_string()
            }
            SessionError::Spawn(err) | SessionError::Pty(err) => err.suggestion(),
            SessionError::LimitReached(_) => {
                "Kill unused sessions or raise TERMCAST_MAX_SESSIONS.".to_string()
            }
            SessionError::Persistence { .. } => {
                "Persistence error is non-fatal. Session continues to operate normally."
                    .to_string()
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Pty(err) => err.is_retryable(),
            SessionError::LimitReached(_) | SessionError::Persistence { .. } => true,
            _ => false,
        }
    }
}

/// A title write that could not be delivered; the pending title was dropped.
#[derive(Error, Debug)]
#[error("Title injection failed: {source}")]
pub struct InjectionError {
    #[from]
    pub source: io::Error,
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Invalid listen address: {message}")]
    InvalidListen { message: String },
    #[error("Failed to {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Failed to set up signal handler: {0}")]
    SignalSetup(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
}
