//! Per-session `activity.json` side files read by other processes.

use std::fs;
use std::io;
use std::path::Path;

use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use termcast_core::ActivityState;
use thiserror::Error;

use crate::error::SessionError;
use crate::store::write_json_atomic;

pub const ACTIVITY_FILE_NAME: &str = "activity.json";

/// Entries further than this from the reader's clock, in either direction,
/// are treated as absent.
pub const ACTIVITY_MAX_AGE: TimeDelta = TimeDelta::seconds(60);

#[derive(Error, Debug)]
pub enum ActivityFileError {
    #[error("activity file missing")]
    Missing,
    #[error("failed to read activity file: {0}")]
    Read(#[from] io::Error),
    #[error("failed to parse activity file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Rewrites the side file wholesale.
pub fn write_activity_file(path: &Path, state: &ActivityState) -> Result<(), SessionError> {
    write_json_atomic(path, state, "write activity file")
}

/// Reads a side file; `Ok(None)` when the entry is stale.
pub fn read_activity_file(
    path: &Path,
    now: DateTime<Utc>,
) -> Result<Option<ActivityState>, ActivityFileError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ActivityFileError::Missing),
        Err(e) => return Err(e.into()),
    };
    let state: ActivityState = serde_json::from_slice(&raw)?;
    Ok(is_fresh(&state, now).then_some(state))
}

pub fn is_fresh(state: &ActivityState, now: DateTime<Utc>) -> bool {
    (now - state.timestamp).abs() <= ACTIVITY_MAX_AGE
}
