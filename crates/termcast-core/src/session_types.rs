//! Value types describing sessions.
//!
//! The same types are persisted to `session.json` and returned from
//! `list_sessions`, so they carry serde derives with camelCase field names.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::activity::ActivityState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SessionIdError {
    pub message: String,
}

/// Opaque session identifier.
///
/// # Invariants
/// - never empty or whitespace-only
/// - never contains a path separator, since it names a directory on disk
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

/// Deserialized ids go through [`SessionId::try_new`], so ids read from
/// clients or from disk uphold the same invariants.
impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        SessionId::try_new(raw).map_err(serde::de::Error::custom)
    }
}

impl SessionId {
    /// Validates an id received from outside the process.
    pub fn try_new(id: impl Into<String>) -> Result<Self, SessionIdError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SessionIdError {
                message: "Session ID cannot be empty or whitespace-only".to_string(),
            });
        }
        if id.contains('/') || id.contains('\\') || id == "." || id == ".." {
            return Err(SessionIdError {
                message: format!("Session ID '{}' must not contain path components", id),
            });
        }
        Ok(Self(id))
    }

    /// Wraps an id that is already known to be valid, e.g. a freshly generated UUID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for SessionId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Exited,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Exited => "exited",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session's terminal title is managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleMode {
    /// Output passes through untouched.
    #[default]
    None,
    /// A descriptive title is injected once after spawn.
    Static,
    /// Like `Static`, with the title refreshed from detected activity.
    Dynamic,
    /// Application title sequences are removed from the stream.
    Filter,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid title mode '{0}'. Must be one of: none, static, dynamic, filter")]
pub struct TitleModeError(pub String);

impl TitleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::Filter => "filter",
        }
    }

    pub fn injects_titles(&self) -> bool {
        matches!(self, Self::Static | Self::Dynamic)
    }
}

impl FromStr for TitleMode {
    type Err = TitleModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "static" => Ok(Self::Static),
            "dynamic" => Ok(Self::Dynamic),
            "filter" => Ok(Self::Filter),
            _ => Err(TitleModeError(s.to_string())),
        }
    }
}

impl fmt::Display for TitleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminalSizeError {
    #[error("Columns must be between {min} and {max}, got {cols}")]
    Columns { cols: u16, min: u16, max: u16 },
    #[error("Rows must be between {min} and {max}, got {rows}")]
    Rows { rows: u16, min: u16, max: u16 },
}

/// Terminal dimensions in cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    cols: u16,
    rows: u16,
}

impl TerminalSize {
    pub const MIN_COLS: u16 = 2;
    pub const MAX_COLS: u16 = 1000;
    pub const MIN_ROWS: u16 = 1;
    pub const MAX_ROWS: u16 = 500;

    pub fn try_new(cols: u16, rows: u16) -> Result<Self, TerminalSizeError> {
        if !(Self::MIN_COLS..=Self::MAX_COLS).contains(&cols) {
            return Err(TerminalSizeError::Columns {
                cols,
                min: Self::MIN_COLS,
                max: Self::MAX_COLS,
            });
        }
        if !(Self::MIN_ROWS..=Self::MAX_ROWS).contains(&rows) {
            return Err(TerminalSizeError::Rows {
                rows,
                min: Self::MIN_ROWS,
                max: Self::MAX_ROWS,
            });
        }
        Ok(Self { cols, rows })
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Persisted description of a session, stored as `session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: SessionId,
    #[serde(default)]
    pub name: Option<String>,
    pub command: Vec<String>,
    pub working_dir: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub title_mode: TitleMode,
    #[serde(default)]
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl SessionRecord {
    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }

    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// One entry of `list_sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(flatten)]
    pub record: SessionRecord,
    pub activity: Option<ActivityState>,
    /// True when the session is not owned by this process instance.
    pub external: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_rejects_empty() {
        assert!(SessionId::try_new("").is_err());
        assert!(SessionId::try_new("   ").is_err());
        assert!(SessionId::try_new("abc").is_ok());
    }

    #[test]
    fn test_session_id_rejects_path_components() {
        assert!(SessionId::try_new("../etc").is_err());
        assert!(SessionId::try_new("a/b").is_err());
        assert!(SessionId::try_new("..").is_err());
    }

    #[test]
    fn test_session_id_serializes_as_plain_string() {
        let id = SessionId::new("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }

    #[test]
    fn test_session_id_deserialization_validates() {
        let id: SessionId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(id.as_str(), "abc");
        assert!(serde_json::from_str::<SessionId>("\"  \"").is_err());
        assert!(serde_json::from_str::<SessionId>("\"../etc\"").is_err());
    }

    #[test]
    fn test_title_mode_parse() {
        assert_eq!("Dynamic".parse::<TitleMode>().unwrap(), TitleMode::Dynamic);
        assert_eq!(" filter ".parse::<TitleMode>().unwrap(), TitleMode::Filter);
        assert!("loud".parse::<TitleMode>().is_err());
        assert!(TitleMode::Static.injects_titles());
        assert!(!TitleMode::Filter.injects_titles());
    }

    #[test]
    fn test_terminal_size_bounds() {
        assert!(TerminalSize::try_new(80, 24).is_ok());
        assert!(matches!(
            TerminalSize::try_new(0, 24),
            Err(TerminalSizeError::Columns { .. })
        ));
        assert!(matches!(
            TerminalSize::try_new(80, 0),
            Err(TerminalSizeError::Rows { .. })
        ));
    }

    #[test]
    fn test_session_record_json_shape() {
        let record = SessionRecord {
            id: SessionId::new("s1"),
            name: None,
            command: vec!["cat".to_string()],
            working_dir: "/tmp".to_string(),
            status: SessionStatus::Running,
            started_at: Utc::now(),
            title_mode: TitleMode::Dynamic,
            pid: Some(42),
            cols: 80,
            rows: 24,
            exit_code: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["workingDir"], "/tmp");
        assert_eq!(value["titleMode"], "dynamic");
        assert_eq!(value["status"], "running");

        let back: SessionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
