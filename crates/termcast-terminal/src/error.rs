//! PTY errors with structured context.

use std::fmt;
use std::io;

use serde_json::{Value, json};
use termcast_common::ErrorCategory;
use thiserror::Error;

/// The PTY step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyOperation {
    Open,
    Spawn,
    Write,
    Read,
    Resize,
    Signal,
}

impl PtyOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            PtyOperation::Open => "open",
            PtyOperation::Spawn => "spawn",
            PtyOperation::Write => "write",
            PtyOperation::Read => "read",
            PtyOperation::Resize => "resize",
            PtyOperation::Signal => "signal",
        }
    }
}

impl fmt::Display for PtyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the OS refused to start the session's command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnErrorKind {
    NotFound,
    PermissionDenied,
    Other,
}

impl SpawnErrorKind {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => SpawnErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => SpawnErrorKind::PermissionDenied,
            _ => SpawnErrorKind::Other,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            SpawnErrorKind::NotFound => "not_found",
            SpawnErrorKind::PermissionDenied => "permission_denied",
            SpawnErrorKind::Other => "other",
        }
    }

    fn hint(self) -> &'static str {
        match self {
            SpawnErrorKind::NotFound => {
                "Command not found. Pass an absolute path or make sure it is on PATH."
            }
            SpawnErrorKind::PermissionDenied => {
                "Permission denied. Check that the command is executable."
            }
            SpawnErrorKind::Other => "The process could not be started. Check the command line.",
        }
    }
}

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {reason}")]
    Open { reason: String },
    #[error("Failed to spawn process: {reason}")]
    Spawn { reason: String, kind: SpawnErrorKind },
    #[error("Failed to write to PTY: {reason}")]
    Write {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },
    #[error("Failed to read from PTY: {reason}")]
    Read {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },
    #[error("Failed to resize PTY: {reason}")]
    Resize { reason: String },
    #[error("Failed to signal process: {reason}")]
    Signal {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },
}

impl PtyError {
    pub fn write(err: io::Error) -> Self {
        PtyError::Write {
            reason: err.to_string(),
            source: Some(err),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::External
    }

    pub fn pty_operation(&self) -> PtyOperation {
        match self {
            PtyError::Open { .. } => PtyOperation::Open,
            PtyError::Spawn { .. } => PtyOperation::Spawn,
            PtyError::Write { .. } => PtyOperation::Write,
            PtyError::Read { .. } => PtyOperation::Read,
            PtyError::Resize { .. } => PtyOperation::Resize,
            PtyError::Signal { .. } => PtyOperation::Signal,
        }
    }

    pub fn operation(&self) -> &'static str {
        self.pty_operation().as_str()
    }

    pub fn reason(&self) -> &str {
        match self {
            PtyError::Open { reason }
            | PtyError::Spawn { reason, .. }
            | PtyError::Write { reason, .. }
            | PtyError::Read { reason, .. }
            | PtyError::Resize { reason }
            | PtyError::Signal { reason, .. } => reason,
        }
    }

    pub fn context(&self) -> Value {
        let mut ctx = json!({
            "operation": self.operation(),
            "reason": self.reason(),
        });
        if let PtyError::Spawn { kind, .. } = self {
            ctx["kind"] = Value::from(kind.as_str());
        }
        ctx
    }

    pub fn suggestion(&self) -> String {
        let hint = match self {
            PtyError::Spawn { kind, .. } => kind.hint(),
            PtyError::Open { .. } => {
                "No PTY could be allocated. Check the open-file limit (ulimit -n)."
            }
            PtyError::Resize { .. } => "Resizing failed. Retry, or recreate the session.",
            PtyError::Write { .. } | PtyError::Read { .. } | PtyError::Signal { .. } => {
                "The session's process may have exited. List sessions to check its status."
            }
        };
        hint.to_string()
    }

    /// I/O on a live PTY can fail transiently; setup and signal failures do not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.pty_operation(),
            PtyOperation::Read | PtyOperation::Write
        )
    }
}
