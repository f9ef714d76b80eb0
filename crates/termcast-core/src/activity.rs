//! Status-line activity detection for interactive agent CLIs.
//!
//! The detector only looks at decoded text. It never alters the stream it
//! is shown; the caller forwards the original bytes independently. Raw PTY
//! reads go through [`ActivityDetector::process_bytes`], which keeps a
//! codepoint split across reads intact.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use tracing::trace;

/// How long a matched status stays active after it was last seen.
pub const ACTIVITY_HOLD: Duration = Duration::from_secs(2);

/// Commands whose sessions default to the dynamic title mode.
pub const KNOWN_DYNAMIC_COMMANDS: &[&str] = &["claude", "codex", "gemini", "aider"];

/// Launchers that commonly wrap the actual program.
const LAUNCHERS: &[&str] = &["node", "npx", "bunx", "pnpx", "python", "python3", "uvx"];

/// Longest unterminated line carried into the next chunk.
const MAX_CARRY_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecificStatus {
    pub app: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityState {
    pub is_active: bool,
    pub specific_status: Option<SpecificStatus>,
    pub timestamp: DateTime<Utc>,
}

impl ActivityState {
    pub fn idle() -> Self {
        Self {
            is_active: false,
            specific_status: None,
            timestamp: Utc::now(),
        }
    }

    /// Same activity, ignoring when it was computed.
    pub fn same_activity(&self, other: &ActivityState) -> bool {
        self.is_active == other.is_active && self.specific_status == other.specific_status
    }
}

struct StatusPattern {
    app: &'static str,
    regex: Regex,
}

fn status_patterns() -> &'static [StatusPattern] {
    static PATTERNS: OnceLock<Vec<StatusPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                "claude",
                r"(?m)^\s*[·✢✳✶✻✽*]\s+([A-Z][\w' -]*?)(?:…|\.\.\.)\s*\([^)\n]*esc to interrupt",
            ),
            (
                "codex",
                r"(?m)^\s*[•◦]\s+([A-Z][\w' -]*?)\s*\([^)\n]*esc to interrupt",
            ),
            (
                "gemini",
                r"(?m)^\s*[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]\s+([^()\n]+?)\s*\(esc to cancel",
            ),
        ]
        .into_iter()
        .filter_map(|(app, pattern)| {
            Regex::new(pattern)
                .ok()
                .map(|regex| StatusPattern { app, regex })
        })
        .collect()
    })
}

fn generic_busy_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)esc to (?:interrupt|cancel)").ok())
        .as_ref()
}

fn ansi_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"\x1b\[[0-9;?<>=!]*[ -/]*[@-~]",
            r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
            r"|\x1b[()*+][0-9A-Za-z]",
            r"|\x1b[@-_]",
        ))
        .ok()
    })
    .as_ref()
}

/// Removes escape sequences so patterns can be matched against visible text.
pub fn strip_ansi(text: &str) -> String {
    match ansi_regex() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Returns the known program a command line launches, if any.
///
/// Matches the basename case-insensitively, looking through one level of
/// launcher such as `npx claude`.
pub fn detect_dynamic_command(command: &[String]) -> Option<&'static str> {
    let mut parts = command.iter();
    let first = basename(parts.next()?);
    if let Some(known) = known_command(&first) {
        return Some(known);
    }
    if LAUNCHERS.contains(&first.as_str()) {
        let target = parts.find(|arg| !arg.starts_with('-'))?;
        return known_command(&basename(target));
    }
    None
}

fn basename(arg: &str) -> String {
    Path::new(arg)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| arg.to_lowercase())
}

fn known_command(name: &str) -> Option<&'static str> {
    KNOWN_DYNAMIC_COMMANDS
        .iter()
        .copied()
        .find(|known| name == *known || name.strip_suffix(".js") == Some(*known))
}

/// Classifies output chunks of one session.
#[derive(Debug)]
pub struct ActivityDetector {
    app: Option<String>,
    carry: String,
    /// Leading bytes of a UTF-8 sequence cut off at the end of the last read.
    utf8_tail: Vec<u8>,
    last_status: Option<SpecificStatus>,
    last_seen: Option<Instant>,
    state: ActivityState,
}

impl ActivityDetector {
    /// `app` names the program for statuses that only match the generic marker.
    pub fn new(app: Option<String>) -> Self {
        Self {
            app,
            carry: String::new(),
            utf8_tail: Vec::new(),
            last_status: None,
            last_seen: None,
            state: ActivityState::idle(),
        }
    }

    pub fn process_bytes(&mut self, chunk: &[u8]) {
        self.process_bytes_at(chunk, Instant::now());
    }

    pub fn process_bytes_at(&mut self, chunk: &[u8], now: Instant) {
        let text = decode_utf8(&mut self.utf8_tail, chunk);
        self.process_output_at(&text, now);
    }

    pub fn process_output(&mut self, chunk: &str) {
        self.process_output_at(chunk, Instant::now());
    }

    pub fn process_output_at(&mut self, chunk: &str, now: Instant) {
        let mut text = std::mem::take(&mut self.carry);
        text.push_str(chunk);
        let visible = strip_ansi(&text);

        match self.match_status(&visible) {
            Some(status) => {
                trace!(app = %status.app, status = %status.status, "Activity status matched");
                self.last_status = Some(status);
                self.last_seen = Some(now);
            }
            // Only an unmatched tail can complete a status line in the next chunk.
            None => self.carry = tail_line(&text),
        }
        self.refresh(now);
    }

    pub fn activity_state(&mut self) -> ActivityState {
        self.activity_state_at(Instant::now())
    }

    /// Current state, expiring a held status once [`ACTIVITY_HOLD`] has passed.
    pub fn activity_state_at(&mut self, now: Instant) -> ActivityState {
        self.refresh(now);
        self.state.clone()
    }

    fn refresh(&mut self, now: Instant) {
        let held = self
            .last_seen
            .is_some_and(|seen| now.saturating_duration_since(seen) <= ACTIVITY_HOLD);
        let status = if held { self.last_status.clone() } else { None };
        self.state = ActivityState {
            is_active: status.is_some(),
            specific_status: status,
            timestamp: Utc::now(),
        };
    }

    fn match_status(&self, visible: &str) -> Option<SpecificStatus> {
        for pattern in status_patterns() {
            if let Some(status) = pattern
                .regex
                .captures_iter(visible)
                .last()
                .and_then(|caps| caps.get(1))
            {
                return Some(SpecificStatus {
                    app: pattern.app.to_string(),
                    status: status.as_str().trim().to_string(),
                });
            }
        }

        if generic_busy_regex().is_some_and(|re| re.is_match(visible)) {
            return Some(SpecificStatus {
                app: self.app.clone().unwrap_or_else(|| "app".to_string()),
                status: "Working".to_string(),
            });
        }
        None
    }
}

/// Decodes `chunk` after any bytes left over from the previous call. Invalid
/// bytes become U+FFFD; an incomplete sequence at the end is kept in `tail`.
fn decode_utf8(tail: &mut Vec<u8>, chunk: &[u8]) -> String {
    let mut bytes = std::mem::take(tail);
    bytes.extend_from_slice(chunk);

    let mut text = String::with_capacity(bytes.len());
    let mut rest = bytes.as_slice();
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                text.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    }
                    None => {
                        *tail = after.to_vec();
                        break;
                    }
                }
            }
        }
    }
    text
}

/// Text after the last newline, bounded in size.
fn tail_line(text: &str) -> String {
    let tail = match text.rfind('\n') {
        Some(idx) => &text[idx + 1..],
        None => text,
    };
    if tail.len() <= MAX_CARRY_BYTES {
        return tail.to_string();
    }
    let mut start = tail.len() - MAX_CARRY_BYTES;
    while !tail.is_char_boundary(start) {
        start += 1;
    }
    tail[start..].to_string()
}
