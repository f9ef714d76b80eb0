#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Session host for termcast.
//!
//! [`SessionManager`] spawns PTY-backed sessions and keeps their screen
//! state; [`SubscriptionHub`] fans encoded frames out to WebSocket viewers;
//! [`ResourceGovernor`] caps both. [`Daemon`] wires them together.

mod activity_file;
mod cancel;
pub mod config;
pub mod error;
mod governor;
mod hub;
mod pump;
mod safe_writer;
mod server;
mod session;
mod signal_handler;
mod store;
mod ws_server;

pub use activity_file::ACTIVITY_FILE_NAME;
pub use activity_file::ActivityFileError;
pub use activity_file::read_activity_file;
pub use activity_file::write_activity_file;
pub use cancel::CancellationToken;
pub use config::DaemonConfig;
pub use error::DaemonError;
pub use error::GovernorError;
pub use error::InjectionError;
pub use error::Resource;
pub use error::SessionError;
pub use governor::ConnectionPermit;
pub use governor::ResourceGovernor;
pub use governor::SessionPermit;
pub use hub::ConnectionId;
pub use hub::FrameSource;
pub use hub::Outbox;
pub use hub::SubscriptionHub;
pub use pump::spawn_broadcast_pump;
pub use safe_writer::ForwardFn;
pub use safe_writer::IdleCandidate;
pub use safe_writer::SafeStreamWriter;
pub use server::Daemon;
pub use server::run_daemon;
pub use session::CreateSessionOptions;
pub use session::OUTPUT_FORWARD_CAPACITY;
pub use session::SessionEvent;
pub use session::SessionManager;
pub use session::generate_session_id;
pub use session::resolve_title_mode;
pub use signal_handler::SignalHandler;
pub use store::SESSION_FILE_NAME;
pub use store::SessionStore;
pub use store::is_process_alive;
pub use ws_server::WsServerHandle;
pub use ws_server::start_ws_server;
