#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod error;
mod pty;
mod terminal;

pub use error::PtyError;
pub use error::PtyOperation;
pub use error::SpawnErrorKind;
pub use pty::PtyHandle;
pub use pty::PtyWriter;
pub use terminal::VirtualTerminal;

pub type Result<T> = std::result::Result<T, PtyError>;
