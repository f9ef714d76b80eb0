//! Fan-out of encoded buffer frames to WebSocket subscribers.
//!
//! Each connection owns a bounded [`Outbox`]. Broadcasting only pushes into
//! outboxes and never waits on a socket, so one slow viewer cannot hold up
//! the others or the session that produced the frame.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use termcast_common::mutex_lock_or_recover;
use termcast_common::rwlock_read_or_recover;
use termcast_common::rwlock_write_or_recover;
use termcast_core::ControlMessage;
use termcast_core::SessionId;
use termcast_core::encode_broadcast;
use termcast_core::parse_control_message;
use tokio::sync::Notify;
use tracing::debug;
use tracing::trace;
use tracing::warn;

/// Read access to session state, implemented by the session manager.
pub trait FrameSource: Send + Sync {
    fn session_exists(&self, id: &SessionId) -> bool;

    /// Current buffer frame, or `None` once the session is gone.
    fn encode_frame(&self, id: &SessionId) -> Option<Bytes>;
}

pub type ConnectionId = u64;

#[derive(Debug, Default)]
struct OutboxState {
    frames: VecDeque<(SessionId, Bytes)>,
    dropped: u64,
    closed: bool,
}

/// Pending broadcast messages of one connection.
///
/// A newer frame for a session replaces the queued one in place; when the
/// queue is full the oldest frame is dropped.
#[derive(Debug)]
pub struct Outbox {
    state: Mutex<OutboxState>,
    notify: Notify,
    capacity: usize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(OutboxState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, session_id: &SessionId, message: Bytes) {
        {
            let mut state = mutex_lock_or_recover(&self.state);
            if state.closed {
                return;
            }
            if let Some(slot) = state.frames.iter_mut().find(|(id, _)| id == session_id) {
                slot.1 = message;
            } else {
                if state.frames.len() >= self.capacity {
                    state.frames.pop_front();
                    state.dropped += 1;
                    trace!(dropped = state.dropped, "Outbox full; dropped oldest frame");
                }
                state.frames.push_back((session_id.clone(), message));
            }
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<Bytes> {
        mutex_lock_or_recover(&self.state)
            .frames
            .pop_front()
            .map(|(_, message)| message)
    }

    /// Waits for the next message; `None` once the outbox is closed.
    pub async fn recv(&self) -> Option<Bytes> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = mutex_lock_or_recover(&self.state);
                if let Some((_, message)) = state.frames.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        mutex_lock_or_recover(&self.state).closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        mutex_lock_or_recover(&self.state).frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        mutex_lock_or_recover(&self.state).dropped
    }
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, Arc<Outbox>>,
    subscribers: HashMap<SessionId, HashSet<ConnectionId>>,
}

/// Tracks which connection watches which session.
///
/// Every frame push for a session happens under that session's delivery
/// lock, from encoding to the last outbox, so a subscriber never sees an
/// older frame after a newer one.
pub struct SubscriptionHub {
    source: Arc<dyn FrameSource>,
    outbox_capacity: usize,
    next_connection: AtomicU64,
    state: RwLock<HubState>,
    delivery: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl SubscriptionHub {
    pub fn new(source: Arc<dyn FrameSource>, outbox_capacity: usize) -> Self {
        Self {
            source,
            outbox_capacity,
            next_connection: AtomicU64::new(1),
            state: RwLock::new(HubState::default()),
            delivery: Mutex::new(HashMap::new()),
        }
    }

    fn delivery_lock(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        Arc::clone(
            mutex_lock_or_recover(&self.delivery)
                .entry(session_id.clone())
                .or_default(),
        )
    }

    pub fn register_connection(&self) -> (ConnectionId, Arc<Outbox>) {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let outbox = Arc::new(Outbox::new(self.outbox_capacity));
        rwlock_write_or_recover(&self.state)
            .connections
            .insert(id, Arc::clone(&outbox));
        (id, outbox)
    }

    /// Subscribes and pushes the current frame right away. Unknown sessions
    /// are ignored; returns whether a subscription now exists.
    pub fn subscribe(&self, connection: ConnectionId, session_id: &SessionId) -> bool {
        if !self.source.session_exists(session_id) {
            debug!(connection, session_id = %session_id, "Ignoring subscribe to unknown session");
            return false;
        }
        let delivery = self.delivery_lock(session_id);
        let _delivering = mutex_lock_or_recover(&delivery);
        let outbox = {
            let mut state = rwlock_write_or_recover(&self.state);
            let Some(outbox) = state.connections.get(&connection).cloned() else {
                return false;
            };
            state
                .subscribers
                .entry(session_id.clone())
                .or_default()
                .insert(connection);
            outbox
        };
        debug!(connection, session_id = %session_id, "Subscribed");
        if let Some(frame) = self.source.encode_frame(session_id) {
            outbox.push(session_id, encode_broadcast(session_id.as_str(), &frame));
        }
        true
    }

    /// Idempotent; unknown pairs are a no-op.
    pub fn unsubscribe(&self, connection: ConnectionId, session_id: &SessionId) {
        let mut state = rwlock_write_or_recover(&self.state);
        if let Some(set) = state.subscribers.get_mut(session_id) {
            set.remove(&connection);
            if set.is_empty() {
                state.subscribers.remove(session_id);
            }
        }
    }

    pub fn on_connection_closed(&self, connection: ConnectionId) {
        let outbox = {
            let mut state = rwlock_write_or_recover(&self.state);
            state.subscribers.retain(|_, set| {
                set.remove(&connection);
                !set.is_empty()
            });
            state.connections.remove(&connection)
        };
        if let Some(outbox) = outbox {
            outbox.close();
        }
        debug!(connection, "Connection closed");
    }

    /// Pushes the session's current frame to every subscriber; returns how
    /// many outboxes received it.
    pub fn broadcast(&self, session_id: &SessionId) -> usize {
        if !rwlock_read_or_recover(&self.state)
            .subscribers
            .contains_key(session_id)
        {
            return 0;
        }
        let delivery = self.delivery_lock(session_id);
        let _delivering = mutex_lock_or_recover(&delivery);
        let outboxes: Vec<Arc<Outbox>> = {
            let state = rwlock_read_or_recover(&self.state);
            let Some(set) = state.subscribers.get(session_id) else {
                return 0;
            };
            set.iter()
                .filter_map(|conn| state.connections.get(conn).cloned())
                .collect()
        };
        if outboxes.is_empty() {
            return 0;
        }
        let Some(frame) = self.source.encode_frame(session_id) else {
            return 0;
        };
        let message = encode_broadcast(session_id.as_str(), &frame);
        for outbox in &outboxes {
            outbox.push(session_id, message.clone());
        }
        trace!(session_id = %session_id, subscribers = outboxes.len(), "Broadcast frame");
        outboxes.len()
    }

    /// Forgets every subscription to a removed session.
    pub fn drop_session(&self, session_id: &SessionId) {
        rwlock_write_or_recover(&self.state)
            .subscribers
            .remove(session_id);
        mutex_lock_or_recover(&self.delivery).remove(session_id);
    }

    /// Applies one text frame from a client. Malformed messages are logged
    /// and ignored; the connection stays open.
    pub fn handle_control_message(&self, connection: ConnectionId, text: &str) {
        match parse_control_message(text) {
            Ok(ControlMessage::Subscribe { session_id }) => {
                self.subscribe(connection, &session_id);
            }
            Ok(ControlMessage::Unsubscribe { session_id }) => {
                self.unsubscribe(connection, &session_id);
            }
            Err(e) => warn!(connection, error = %e, "Ignoring malformed control message"),
        }
    }

    pub fn subscriber_count(&self, session_id: &SessionId) -> usize {
        rwlock_read_or_recover(&self.state)
            .subscribers
            .get(session_id)
            .map_or(0, HashSet::len)
    }

    pub fn connection_count(&self) -> usize {
        rwlock_read_or_recover(&self.state).connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termcast_core::parse_broadcast;

    struct FakeSource {
        sessions: Mutex<HashMap<SessionId, Bytes>>,
    }

    impl FakeSource {
        fn with(ids: &[&str]) -> Arc<Self> {
            let sessions = ids
                .iter()
                .map(|id| {
                    (
                        SessionId::new(*id),
                        Bytes::from(format!("frame-{}", id).into_bytes()),
                    )
                })
                .collect();
            Arc::new(Self {
                sessions: Mutex::new(sessions),
            })
        }

        fn set_frame(&self, id: &str, frame: &'static [u8]) {
            self.sessions
                .lock()
                .unwrap()
                .insert(SessionId::new(id), Bytes::from_static(frame));
        }
    }

    impl FrameSource for FakeSource {
        fn session_exists(&self, id: &SessionId) -> bool {
            self.sessions.lock().unwrap().contains_key(id)
        }

        fn encode_frame(&self, id: &SessionId) -> Option<Bytes> {
            self.sessions.lock().unwrap().get(id).cloned()
        }
    }

    fn drain(outbox: &Outbox) -> Vec<Bytes> {
        std::iter::from_fn(|| outbox.try_pop()).collect()
    }

    #[test]
    fn test_two_connections_receive_same_frame() {
        let hub = SubscriptionHub::new(FakeSource::with(&["s1"]), 8);
        let (a, out_a) = hub.register_connection();
        let (b, out_b) = hub.register_connection();
        let id = SessionId::new("s1");
        assert!(hub.subscribe(a, &id));
        assert!(hub.subscribe(b, &id));
        drain(&out_a);
        drain(&out_b);

        assert_eq!(hub.broadcast(&id), 2);
        for outbox in [&out_a, &out_b] {
            let messages = drain(outbox);
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0][0], 0xbf);
            let (session, frame) = parse_broadcast(&messages[0]).unwrap();
            assert_eq!(session, "s1");
            assert_eq!(frame, b"frame-s1");
        }
    }

    #[test]
    fn test_subscribe_pushes_initial_frame() {
        let hub = SubscriptionHub::new(FakeSource::with(&["s1"]), 8);
        let (conn, outbox) = hub.register_connection();
        hub.subscribe(conn, &SessionId::new("s1"));
        assert_eq!(drain(&outbox).len(), 1);
    }

    #[test]
    fn test_subscribe_unknown_session_is_noop() {
        let hub = SubscriptionHub::new(FakeSource::with(&[]), 8);
        let (conn, outbox) = hub.register_connection();
        let id = SessionId::new("ghost");
        assert!(!hub.subscribe(conn, &id));
        assert_eq!(hub.subscriber_count(&id), 0);
        assert_eq!(hub.broadcast(&id), 0);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let hub = SubscriptionHub::new(FakeSource::with(&["s1", "s2"]), 8);
        let (conn, _outbox) = hub.register_connection();
        let s1 = SessionId::new("s1");
        let s2 = SessionId::new("s2");
        hub.subscribe(conn, &s1);
        hub.subscribe(conn, &s2);

        hub.unsubscribe(conn, &SessionId::new("never"));
        hub.unsubscribe(conn, &s1);
        hub.unsubscribe(conn, &s1);

        assert_eq!(hub.subscriber_count(&s1), 0);
        assert_eq!(hub.subscriber_count(&s2), 1);
    }

    #[test]
    fn test_connection_close_removes_all_subscriptions() {
        let hub = SubscriptionHub::new(FakeSource::with(&["s1", "s2"]), 8);
        let (a, out_a) = hub.register_connection();
        let (b, _out_b) = hub.register_connection();
        for id in ["s1", "s2"] {
            hub.subscribe(a, &SessionId::new(id));
        }
        hub.subscribe(b, &SessionId::new("s1"));

        hub.on_connection_closed(a);
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.subscriber_count(&SessionId::new("s1")), 1);
        assert_eq!(hub.subscriber_count(&SessionId::new("s2")), 0);

        drain(&out_a);
        hub.broadcast(&SessionId::new("s1"));
        assert!(out_a.is_empty());
    }

    #[test]
    fn test_frames_coalesce_per_session() {
        let source = FakeSource::with(&["s1"]);
        let hub = SubscriptionHub::new(source.clone(), 8);
        let (conn, outbox) = hub.register_connection();
        let id = SessionId::new("s1");
        hub.subscribe(conn, &id);

        source.set_frame("s1", b"newer");
        hub.broadcast(&id);
        source.set_frame("s1", b"newest");
        hub.broadcast(&id);

        let messages = drain(&outbox);
        assert_eq!(messages.len(), 1);
        assert_eq!(parse_broadcast(&messages[0]).unwrap().1, b"newest");
    }

    #[test]
    fn test_full_outbox_drops_oldest() {
        let outbox = Outbox::new(2);
        for id in ["a", "b", "c"] {
            outbox.push(&SessionId::new(id), Bytes::from(id.as_bytes().to_vec()));
        }
        assert_eq!(outbox.dropped(), 1);
        assert_eq!(drain(&outbox), vec![Bytes::from("b"), Bytes::from("c")]);
    }

    #[test]
    fn test_malformed_control_messages_are_ignored() {
        let hub = SubscriptionHub::new(FakeSource::with(&["s1"]), 8);
        let (conn, _outbox) = hub.register_connection();
        hub.handle_control_message(conn, "not json");
        hub.handle_control_message(conn, r#"{"type":"subscribe"}"#);
        hub.handle_control_message(conn, r#"{"type":"dance","sessionId":"s1"}"#);
        assert_eq!(hub.subscriber_count(&SessionId::new("s1")), 0);

        hub.handle_control_message(conn, r#"{"type":"subscribe","sessionId":"s1"}"#);
        assert_eq!(hub.subscriber_count(&SessionId::new("s1")), 1);
        hub.handle_control_message(conn, r#"{"type":"unsubscribe","sessionId":"s1"}"#);
        assert_eq!(hub.subscriber_count(&SessionId::new("s1")), 0);
    }

    #[test]
    fn test_drop_session_forgets_subscribers() {
        let hub = SubscriptionHub::new(FakeSource::with(&["s1"]), 8);
        let (conn, _outbox) = hub.register_connection();
        let id = SessionId::new("s1");
        hub.subscribe(conn, &id);
        hub.drop_session(&id);
        assert_eq!(hub.subscriber_count(&id), 0);
    }

    /// First encode is slow and yields the older snapshot; later encodes see
    /// newer screen contents.
    struct SlowFirstFrame {
        encodes: std::sync::atomic::AtomicUsize,
        entered: Mutex<Option<std::sync::mpsc::Sender<()>>>,
    }

    impl FrameSource for SlowFirstFrame {
        fn session_exists(&self, _id: &SessionId) -> bool {
            true
        }

        fn encode_frame(&self, _id: &SessionId) -> Option<Bytes> {
            if self.encodes.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(entered) = self.entered.lock().unwrap().take() {
                    entered.send(()).unwrap();
                }
                std::thread::sleep(std::time::Duration::from_millis(150));
                return Some(Bytes::from_static(b"old"));
            }
            Some(Bytes::from_static(b"new"))
        }
    }

    #[test]
    fn test_initial_frame_never_overwrites_newer_broadcast() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let source = Arc::new(SlowFirstFrame {
            encodes: std::sync::atomic::AtomicUsize::new(0),
            entered: Mutex::new(Some(entered_tx)),
        });
        let hub = Arc::new(SubscriptionHub::new(source, 8));
        let (conn, outbox) = hub.register_connection();
        let id = SessionId::new("s1");

        let subscriber = {
            let hub = Arc::clone(&hub);
            let id = id.clone();
            std::thread::spawn(move || hub.subscribe(conn, &id))
        };
        entered_rx.recv().unwrap();
        hub.broadcast(&id);
        assert!(subscriber.join().unwrap());

        let frames: Vec<Vec<u8>> = drain(&outbox)
            .iter()
            .map(|m| parse_broadcast(m).unwrap().1.to_vec())
            .collect();
        assert_eq!(frames.last().map(Vec::as_slice), Some(&b"new"[..]));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push_and_close() {
        let outbox = Arc::new(Outbox::new(4));
        let waiter = Arc::clone(&outbox);
        let handle = tokio::spawn(async move { waiter.recv().await });
        tokio::task::yield_now().await;
        outbox.push(&SessionId::new("s1"), Bytes::from_static(b"x"));
        assert_eq!(handle.await.unwrap(), Some(Bytes::from_static(b"x")));

        outbox.close();
        assert_eq!(outbox.recv().await, None);
    }
}
