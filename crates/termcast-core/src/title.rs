//! Terminal title formatting and filtering.

use std::path::Path;

use crate::activity::ActivityState;

/// Upper bound on the sanitized title, in bytes.
pub const MAX_TITLE_BYTES: usize = 256;

const TITLE_SEPARATOR: &str = " · ";
const ACTIVITY_MARKER: &str = "●";

/// Removes control characters and truncates to [`MAX_TITLE_BYTES`] on a char boundary.
pub fn sanitize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len().min(MAX_TITLE_BYTES));
    for ch in title.chars().filter(|c| !c.is_control()) {
        if out.len() + ch.len_utf8() > MAX_TITLE_BYTES {
            break;
        }
        out.push(ch);
    }
    out
}

/// Wraps a title in an `OSC 2` set-window-title sequence terminated by BEL.
pub fn title_sequence(title: &str) -> Vec<u8> {
    let title = sanitize_title(title);
    let mut seq = Vec::with_capacity(title.len() + 5);
    seq.extend_from_slice(b"\x1b]2;");
    seq.extend_from_slice(title.as_bytes());
    seq.push(0x07);
    seq
}

/// `<cwd> · <command> · <name>`, with the home directory shortened to `~`.
pub fn static_title(
    working_dir: &Path,
    command: &[String],
    name: Option<&str>,
    home: Option<&Path>,
) -> String {
    let mut parts = vec![abbreviate_home(working_dir, home)];

    if let Some((program, args)) = command.split_first() {
        let program = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.clone());
        let mut line = program;
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        parts.push(line);
    }

    if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
        parts.push(name.to_string());
    }

    parts.join(TITLE_SEPARATOR)
}

/// Prefixes `base` with the detected activity, if any.
pub fn dynamic_title(base: &str, activity: &ActivityState) -> String {
    match &activity.specific_status {
        Some(status) => format!(
            "{} {}: {}{}{}",
            ACTIVITY_MARKER, status.app, status.status, TITLE_SEPARATOR, base
        ),
        None if activity.is_active => format!("{} {}", ACTIVITY_MARKER, base),
        None => base.to_string(),
    }
}

fn abbreviate_home(path: &Path, home: Option<&Path>) -> String {
    if let Some(home) = home.filter(|h| !h.as_os_str().is_empty()) {
        if path == home {
            return "~".to_string();
        }
        if let Ok(rest) = path.strip_prefix(home) {
            return format!("~/{}", rest.display());
        }
    }
    path.display().to_string()
}

#[derive(Debug, Clone, Default)]
enum FilterState {
    #[default]
    Pass,
    /// An ESC was seen and held back.
    Escape,
    /// `ESC ]` plus the numeric parameter read so far.
    OscPrefix(Vec<u8>),
    Dropping,
    DroppingEscape,
}

/// Longest OSC prefix held back while deciding whether it sets the title.
const MAX_OSC_PREFIX: usize = 8;

/// Strips application-emitted `OSC 0`, `OSC 1` and `OSC 2` sequences.
///
/// Partial sequences at the end of a chunk are held back until the next
/// call decides them, so a title split across reads is still removed.
#[derive(Debug, Clone, Default)]
pub struct TitleFilter {
    state: FilterState,
}

impl TitleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len());
        for &byte in chunk {
            self.step(byte, &mut out);
        }
        out
    }

    /// Bytes currently held back awaiting a decision.
    pub fn pending_len(&self) -> usize {
        match &self.state {
            FilterState::Escape => 1,
            FilterState::OscPrefix(held) => held.len(),
            _ => 0,
        }
    }

    fn step(&mut self, byte: u8, out: &mut Vec<u8>) {
        match std::mem::take(&mut self.state) {
            FilterState::Pass => {
                if byte == 0x1b {
                    self.state = FilterState::Escape;
                } else {
                    out.push(byte);
                }
            }
            FilterState::Escape => match byte {
                b']' => self.state = FilterState::OscPrefix(vec![0x1b, b']']),
                0x1b => {
                    out.push(0x1b);
                    self.state = FilterState::Escape;
                }
                _ => out.extend_from_slice(&[0x1b, byte]),
            },
            FilterState::OscPrefix(mut held) => match byte {
                b'0'..=b'9' if held.len() < MAX_OSC_PREFIX => {
                    held.push(byte);
                    self.state = FilterState::OscPrefix(held);
                }
                b';' if matches!(&held[2..], b"0" | b"1" | b"2") => {
                    self.state = FilterState::Dropping;
                }
                _ => {
                    out.extend_from_slice(&held);
                    self.step(byte, out);
                }
            },
            FilterState::Dropping => match byte {
                0x07 | 0x18 | 0x1a => {}
                0x1b => self.state = FilterState::DroppingEscape,
                _ => self.state = FilterState::Dropping,
            },
            FilterState::DroppingEscape => {
                if byte != b'\\' {
                    self.state = FilterState::Escape;
                    self.step(byte, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::SpecificStatus;
    use chrono::Utc;

    #[test]
    fn test_sanitize_strips_controls() {
        assert_eq!(sanitize_title("a\x1b]b\x07c\nd\u{9b}e\x7f"), "a]bcde");
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let long = "é".repeat(200);
        let out = sanitize_title(&long);
        assert!(out.len() <= MAX_TITLE_BYTES);
        assert_eq!(out.len(), 256);
        assert!(out.chars().all(|c| c == 'é'));

        let odd = format!("a{}", "é".repeat(200));
        let out = sanitize_title(&odd);
        assert_eq!(out.len(), 255);
    }

    #[test]
    fn test_title_sequence_shape() {
        assert_eq!(title_sequence("hi\x07"), b"\x1b]2;hi\x07".to_vec());
    }

    #[test]
    fn test_static_title() {
        let home = Path::new("/home/ana");
        let title = static_title(
            Path::new("/home/ana/src/app"),
            &["/usr/bin/vim".to_string(), "main.rs".to_string()],
            Some("edit"),
            Some(home),
        );
        assert_eq!(title, "~/src/app · vim main.rs · edit");

        let title = static_title(Path::new("/home/ana"), &["cat".to_string()], None, Some(home));
        assert_eq!(title, "~ · cat");

        let title = static_title(Path::new("/srv"), &["cat".to_string()], Some("  "), None);
        assert_eq!(title, "/srv · cat");
    }

    #[test]
    fn test_dynamic_title() {
        let mut state = ActivityState {
            is_active: true,
            specific_status: Some(SpecificStatus {
                app: "claude".to_string(),
                status: "Thinking".to_string(),
            }),
            timestamp: Utc::now(),
        };
        assert_eq!(dynamic_title("~ · claude", &state), "● claude: Thinking · ~ · claude");

        state.specific_status = None;
        assert_eq!(dynamic_title("base", &state), "● base");

        state.is_active = false;
        assert_eq!(dynamic_title("base", &state), "base");
    }

    #[test]
    fn test_filter_removes_title_sequences() {
        let mut filter = TitleFilter::new();
        let out = filter.filter(b"a\x1b]0;one\x07b\x1b]2;two\x1b\\c\x1b]1;three\x07d");
        assert_eq!(out, b"abcd".to_vec());
    }

    #[test]
    fn test_filter_keeps_other_sequences() {
        let mut filter = TitleFilter::new();
        let input = b"\x1b[31mred\x1b]7;file:///tmp\x07\x1b]10;?\x07\x1b(B";
        assert_eq!(filter.filter(input), input.to_vec());
    }

    #[test]
    fn test_filter_across_chunks() {
        let mut filter = TitleFilter::new();
        let mut out = filter.filter(b"x\x1b");
        assert_eq!(filter.pending_len(), 1);
        out.extend(filter.filter(b"]"));
        out.extend(filter.filter(b"2;ti"));
        out.extend(filter.filter(b"tle\x1b"));
        out.extend(filter.filter(b"\\y"));
        assert_eq!(out, b"xy".to_vec());
    }

    #[test]
    fn test_filter_esc_cancels_title() {
        let mut filter = TitleFilter::new();
        let out = filter.filter(b"\x1b]2;abc\x1b[1mz");
        assert_eq!(out, b"\x1b[1mz".to_vec());
    }
}
