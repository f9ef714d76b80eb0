#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! I/O-free building blocks of the termcast host.
//!
//! Everything here operates on bytes and values handed in by the caller:
//! the incremental stream analyzer used for safe title injection, title
//! formatting and filtering, status-line activity detection, and the
//! binary frame encoder used by the broadcast protocol.

pub mod activity;
pub mod frame;
pub mod protocol;
pub mod session_types;
pub mod stream_analyzer;
pub mod title;

pub use activity::ActivityDetector;
pub use activity::ActivityState;
pub use activity::SpecificStatus;
pub use activity::detect_dynamic_command;
pub use frame::BROADCAST_MAGIC;
pub use frame::BufferEncoder;
pub use frame::Cell;
pub use frame::CellColor;
pub use frame::FRAME_MAGIC;
pub use frame::FRAME_VERSION;
pub use frame::FrameHeader;
pub use frame::TerminalSnapshot;
pub use frame::encode_broadcast;
pub use frame::parse_broadcast;
pub use protocol::ControlMessage;
pub use protocol::ProtocolError;
pub use protocol::parse_control_message;
pub use session_types::SessionId;
pub use session_types::SessionIdError;
pub use session_types::SessionRecord;
pub use session_types::SessionStatus;
pub use session_types::SessionSummary;
pub use session_types::TerminalSize;
pub use session_types::TerminalSizeError;
pub use session_types::TitleMode;
pub use stream_analyzer::InjectionReason;
pub use stream_analyzer::SafeInjectionPoint;
pub use stream_analyzer::StreamAnalyzer;
pub use title::TitleFilter;
pub use title::dynamic_title;
pub use title::sanitize_title;
pub use title::static_title;
pub use title::title_sequence;
