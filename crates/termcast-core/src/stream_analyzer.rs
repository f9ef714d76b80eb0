//! Incremental scanner that finds byte offsets where foreign bytes can be
//! inserted into a PTY stream without splitting a UTF-8 codepoint or an
//! escape sequence.
//!
//! The scanner is resumable: a chunk may end in the middle of a codepoint,
//! a CSI sequence or an OSC string, and the next call picks up exactly
//! where the previous one stopped.

use serde::Serialize;

const BEL: u8 = 0x07;
const LF: u8 = b'\n';
const CAN: u8 = 0x18;
const SUB: u8 = 0x1a;
const ESC: u8 = 0x1b;

/// Why a position was judged safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InjectionReason {
    /// The stream went quiet; produced by the idle timer, never by `process`.
    Idle,
    LineBoundary,
    AfterCompleteEscape,
    /// A cursor-home or erase-display sequence just completed.
    CursorHome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeInjectionPoint {
    /// Offset into the analyzed chunk; the foreign bytes go before `chunk[position]`.
    pub position: usize,
    pub reason: InjectionReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringKind {
    /// `ESC ]`, terminated by BEL or ST.
    Osc,
    /// `ESC P`, `ESC X`, `ESC ^`, `ESC _`, terminated by ST only.
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Ground,
    Utf8 {
        remaining: u8,
    },
    Escape,
    EscapeIntermediate,
    Csi,
    String(StringKind),
    StringEscape,
}

enum Step {
    Consumed(Option<InjectionReason>),
    /// The byte ended a malformed sequence and must be scanned again from ground.
    Reprocess,
}

#[derive(Debug, Clone, Default)]
pub struct StreamAnalyzer {
    state: State,
}

impl StreamAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no codepoint or escape sequence is open.
    pub fn is_ground(&self) -> bool {
        self.state == State::Ground
    }

    pub fn reset(&mut self) {
        self.state = State::Ground;
    }

    /// Scans `chunk` and returns every safe insertion point in it, in order.
    pub fn process(&mut self, chunk: &[u8]) -> Vec<SafeInjectionPoint> {
        let mut points = Vec::new();
        for (index, &byte) in chunk.iter().enumerate() {
            if let Some(reason) = self.advance(byte) {
                points.push(SafeInjectionPoint {
                    position: index + 1,
                    reason,
                });
            }
        }
        points
    }

    fn advance(&mut self, byte: u8) -> Option<InjectionReason> {
        // Every reprocess moves the state closer to Ground, so this terminates.
        loop {
            match self.step(byte) {
                Step::Consumed(reason) => return reason,
                Step::Reprocess => continue,
            }
        }
    }

    fn step(&mut self, byte: u8) -> Step {
        match self.state {
            State::Ground => Step::Consumed(self.ground(byte)),
            State::Utf8 { remaining } => {
                if (0x80..=0xbf).contains(&byte) {
                    self.state = if remaining > 1 {
                        State::Utf8 {
                            remaining: remaining - 1,
                        }
                    } else {
                        State::Ground
                    };
                    Step::Consumed(None)
                } else {
                    self.state = State::Ground;
                    Step::Reprocess
                }
            }
            State::Escape => match byte {
                b'[' => self.enter(State::Csi),
                b']' => self.enter(State::String(StringKind::Osc)),
                b'P' | b'X' | b'^' | b'_' => self.enter(State::String(StringKind::Control)),
                0x20..=0x2f => self.enter(State::EscapeIntermediate),
                0x30..=0x7e => self.complete(InjectionReason::AfterCompleteEscape),
                _ => self.control_in_sequence(byte),
            },
            State::EscapeIntermediate => match byte {
                0x20..=0x2f => Step::Consumed(None),
                0x30..=0x7e => self.complete(InjectionReason::AfterCompleteEscape),
                _ => self.control_in_sequence(byte),
            },
            State::Csi => match byte {
                0x20..=0x3f => Step::Consumed(None),
                b'H' | b'f' | b'J' => self.complete(InjectionReason::CursorHome),
                0x40..=0x7e => self.complete(InjectionReason::AfterCompleteEscape),
                _ => self.control_in_sequence(byte),
            },
            State::String(kind) => match byte {
                BEL if kind == StringKind::Osc => {
                    self.complete(InjectionReason::AfterCompleteEscape)
                }
                ESC => self.enter(State::StringEscape),
                CAN | SUB => self.enter(State::Ground),
                _ => Step::Consumed(None),
            },
            State::StringEscape => match byte {
                b'\\' => self.complete(InjectionReason::AfterCompleteEscape),
                // Any other byte after ESC cancels the string and starts a new escape.
                _ => {
                    self.state = State::Escape;
                    Step::Reprocess
                }
            },
        }
    }

    fn ground(&mut self, byte: u8) -> Option<InjectionReason> {
        match byte {
            LF => Some(InjectionReason::LineBoundary),
            ESC => {
                self.state = State::Escape;
                None
            }
            0xc2..=0xdf => {
                self.state = State::Utf8 { remaining: 1 };
                None
            }
            0xe0..=0xef => {
                self.state = State::Utf8 { remaining: 2 };
                None
            }
            0xf0..=0xf4 => {
                self.state = State::Utf8 { remaining: 3 };
                None
            }
            _ => None,
        }
    }

    fn enter(&mut self, state: State) -> Step {
        self.state = state;
        Step::Consumed(None)
    }

    fn complete(&mut self, reason: InjectionReason) -> Step {
        self.state = State::Ground;
        Step::Consumed(Some(reason))
    }

    /// Bytes that are not part of an escape's grammar.
    fn control_in_sequence(&mut self, byte: u8) -> Step {
        match byte {
            ESC => self.enter(State::Escape),
            CAN | SUB => self.enter(State::Ground),
            // C0 controls execute without disturbing the sequence.
            0x00..=0x1f | 0x7f => Step::Consumed(None),
            _ => {
                self.state = State::Ground;
                Step::Reprocess
            }
        }
    }
}
