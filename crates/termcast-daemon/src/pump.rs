//! Moves session state changes from the manager to the hub.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use termcast_core::SessionId;
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::error::DaemonError;
use crate::hub::SubscriptionHub;
use crate::session::SessionEvent;

/// How long an idle pump waits before rechecking cancellation.
const IDLE_POLL: Duration = Duration::from_millis(200);

struct BroadcastPump {
    events: Receiver<SessionEvent>,
    hub: Arc<SubscriptionHub>,
    interval: Duration,
    dirty: HashSet<SessionId>,
    flush_at: Option<Instant>,
}

impl BroadcastPump {
    fn run(mut self, token: CancellationToken) {
        while !token.is_cancelled() {
            let timeout = match self.flush_at {
                Some(at) => at.saturating_duration_since(Instant::now()),
                None => IDLE_POLL,
            };
            match self.events.recv_timeout(timeout) {
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.flush();
                    break;
                }
            }
            if self.flush_at.is_some_and(|at| Instant::now() >= at) {
                self.flush();
            }
        }
        debug!("Broadcast pump stopped");
    }

    fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Output(id) => {
                if self.dirty.insert(id) && self.flush_at.is_none() {
                    self.flush_at = Some(Instant::now() + self.interval);
                }
            }
            SessionEvent::Created(id) | SessionEvent::Resized(id) | SessionEvent::Exited(id) => {
                self.dirty.remove(&id);
                self.hub.broadcast(&id);
            }
            SessionEvent::Removed(id) => {
                self.dirty.remove(&id);
                self.hub.drop_session(&id);
            }
        }
    }

    fn flush(&mut self) {
        for id in self.dirty.drain() {
            self.hub.broadcast(&id);
        }
        self.flush_at = None;
    }
}

/// Starts the pump thread. Output events are coalesced per session and
/// flushed every `interval`; other events are forwarded at once.
pub fn spawn_broadcast_pump(
    events: Receiver<SessionEvent>,
    hub: Arc<SubscriptionHub>,
    interval: Duration,
    token: CancellationToken,
) -> Result<JoinHandle<()>, DaemonError> {
    let pump = BroadcastPump {
        events,
        hub,
        interval,
        dirty: HashSet::new(),
        flush_at: None,
    };
    thread::Builder::new()
        .name("broadcast-pump".to_string())
        .spawn(move || pump.run(token))
        .map_err(|source| DaemonError::Io {
            operation: "spawn broadcast pump",
            source,
        })
}
