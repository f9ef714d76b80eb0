//! Session lifecycle: spawn, input, resize, kill, exit and listing.

use std::collections::HashMap;
use std::collections::HashSet;
use std::env;
use std::io::ErrorKind;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::TrySendError;
use termcast_common::mutex_lock_or_recover;
use termcast_common::rwlock_read_or_recover;
use termcast_common::rwlock_write_or_recover;
use termcast_core::ActivityDetector;
use termcast_core::ActivityState;
use termcast_core::BufferEncoder;
use termcast_core::SessionId;
use termcast_core::SessionRecord;
use termcast_core::SessionStatus;
use termcast_core::SessionSummary;
use termcast_core::TerminalSize;
use termcast_core::TitleFilter;
use termcast_core::TitleMode;
use termcast_core::detect_dynamic_command;
use termcast_core::dynamic_title;
use termcast_core::static_title;
use termcast_terminal::PtyError;
use termcast_terminal::PtyHandle;
use termcast_terminal::PtyWriter;
use termcast_terminal::SpawnErrorKind;
use termcast_terminal::VirtualTerminal;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;
use uuid::Uuid;

use crate::activity_file::ActivityFileError;
use crate::activity_file::read_activity_file;
use crate::activity_file::write_activity_file;
use crate::cancel::CancellationToken;
use crate::config::DaemonConfig;
use crate::error::SessionError;
use crate::governor::ResourceGovernor;
use crate::governor::SessionPermit;
use crate::hub::FrameSource;
use crate::safe_writer::SafeStreamWriter;
use crate::store::SessionStore;

/// Chunks buffered per local output subscriber before chunks are dropped.
pub const OUTPUT_FORWARD_CAPACITY: usize = 256;

const READ_BUFFER_SIZE: usize = 8192;
const IDLE_TICK: Duration = Duration::from_millis(50);
const ACTIVITY_PERSIST_INTERVAL: Duration = Duration::from_millis(500);
/// Unchanged activity is rewritten this often so readers do not see it as stale.
const ACTIVITY_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(10);
const EXIT_REAP_TIMEOUT: Duration = Duration::from_secs(2);

pub fn generate_session_id() -> SessionId {
    SessionId::new(Uuid::new_v4().to_string()[..8].to_string())
}

/// State changes published to the broadcast pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created(SessionId),
    Output(SessionId),
    Resized(SessionId),
    Exited(SessionId),
    Removed(SessionId),
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::Created(id)
            | SessionEvent::Output(id)
            | SessionEvent::Resized(id)
            | SessionEvent::Exited(id)
            | SessionEvent::Removed(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateSessionOptions {
    pub working_dir: PathBuf,
    /// `None` lets the command decide: known agent CLIs get `Dynamic`.
    pub title_mode: Option<TitleMode>,
    pub name: Option<String>,
    pub size: TerminalSize,
    pub env: HashMap<String, String>,
}

impl CreateSessionOptions {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            title_mode: None,
            name: None,
            size: TerminalSize::default(),
            env: HashMap::new(),
        }
    }

    pub fn with_title_mode(mut self, mode: TitleMode) -> Self {
        self.title_mode = Some(mode);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Explicit mode wins; otherwise known agent commands default to dynamic.
pub fn resolve_title_mode(requested: Option<TitleMode>, command: &[String]) -> TitleMode {
    match requested {
        Some(mode) => mode,
        None if detect_dynamic_command(command).is_some() => TitleMode::Dynamic,
        None => TitleMode::None,
    }
}

struct ActivityTracker {
    detector: ActivityDetector,
    current: ActivityState,
    persisted: Option<ActivityState>,
    last_persist: Option<Instant>,
}

type Forwarders = Arc<Mutex<Vec<Sender<Bytes>>>>;

struct Session {
    id: SessionId,
    title_base: String,
    record: Mutex<SessionRecord>,
    pty: Mutex<PtyHandle>,
    input: PtyWriter,
    terminal: Arc<VirtualTerminal>,
    output: SafeStreamWriter,
    activity: Option<Mutex<ActivityTracker>>,
    title_filter: Option<Mutex<TitleFilter>>,
    forwarders: Forwarders,
    token: CancellationToken,
    removed: AtomicBool,
    permit: Mutex<Option<SessionPermit>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    store: SessionStore,
    events: Sender<SessionEvent>,
}

impl Session {
    fn is_running(&self) -> bool {
        mutex_lock_or_recover(&self.record).is_running()
    }

    fn record(&self) -> SessionRecord {
        mutex_lock_or_recover(&self.record).clone()
    }

    fn emit(&self, event: SessionEvent) {
        // The receiver only goes away during shutdown.
        let _ = self.events.send(event);
    }

    fn save_record(&self) {
        let record = self.record();
        if let Err(e) = self.store.save(&record) {
            warn!(session_id = %self.id, error = %e, "Failed to persist session metadata");
        }
    }

    fn handle_output(&self, chunk: &[u8]) {
        let filtered;
        let chunk = match &self.title_filter {
            Some(filter) => {
                filtered = mutex_lock_or_recover(filter).filter(chunk);
                filtered.as_slice()
            }
            None => chunk,
        };

        if self.activity.is_some() {
            self.update_activity(Some(chunk));
        }

        if let Err(e) = self.output.process_output(chunk) {
            warn!(session_id = %self.id, error = %e, "Dropped pending title after failed injection");
        }
        self.emit(SessionEvent::Output(self.id.clone()));
    }

    /// Feeds raw output to the detector and queues a new title whenever
    /// the detected activity changes.
    fn update_activity(&self, output: Option<&[u8]>) {
        let Some(tracker) = &self.activity else {
            return;
        };
        let mut tracker = mutex_lock_or_recover(tracker);
        if let Some(output) = output {
            tracker.detector.process_bytes(output);
        }
        let state = tracker.detector.activity_state();
        if !state.same_activity(&tracker.current) {
            trace!(session_id = %self.id, active = state.is_active, "Activity changed");
            self.output.queue_title(&dynamic_title(&self.title_base, &state));
        }
        tracker.current = state;
    }

    fn activity_snapshot(&self) -> Option<ActivityState> {
        self.update_activity(None);
        self.activity
            .as_ref()
            .map(|tracker| mutex_lock_or_recover(tracker).current.clone())
    }

    fn persist_activity(&self) {
        let Some(tracker) = &self.activity else {
            return;
        };
        let mut tracker = mutex_lock_or_recover(tracker);
        let changed = tracker
            .persisted
            .as_ref()
            .is_none_or(|p| !p.same_activity(&tracker.current));
        let expiring = tracker
            .last_persist
            .is_none_or(|at| at.elapsed() >= ACTIVITY_REFRESH_INTERVAL);
        if !changed && !expiring {
            return;
        }
        let state = tracker.current.clone();
        match write_activity_file(&self.store.activity_path(&self.id), &state) {
            Ok(()) => {
                tracker.persisted = Some(state);
                tracker.last_persist = Some(Instant::now());
            }
            Err(e) => warn!(session_id = %self.id, error = %e, "Failed to write activity file"),
        }
    }

    /// Idle-injection and activity-persistence timer. Exits once the token
    /// is cancelled, and checks it again before every action.
    fn ticker_loop(&self) {
        let mut last_persist = Instant::now();
        while !self.token.wait_timeout(IDLE_TICK) {
            if let Some(candidate) = self.output.check_idle() {
                if self.token.is_cancelled() {
                    break;
                }
                match self.output.inject_if_still_idle(candidate) {
                    Ok(true) => trace!(session_id = %self.id, "Injected title on idle stream"),
                    Ok(false) => {}
                    Err(e) => warn!(session_id = %self.id, error = %e, "Idle title injection failed"),
                }
            }

            if self.activity.is_some() && last_persist.elapsed() >= ACTIVITY_PERSIST_INTERVAL {
                if self.token.is_cancelled() {
                    break;
                }
                self.update_activity(None);
                self.persist_activity();
                last_persist = Instant::now();
            }
        }
    }

    /// Cancels and joins the ticker. Safe to call from several paths.
    fn stop_timers(&self) {
        self.token.cancel();
        let handle = mutex_lock_or_recover(&self.ticker).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(session_id = %self.id, "Session ticker thread panicked");
            }
        }
    }

    fn release_permit(&self) {
        drop(mutex_lock_or_recover(&self.permit).take());
    }

    /// `finish` marks the record Exited only after its last store write.
    fn is_finished(&self) -> bool {
        !self.is_running()
    }

    fn poll_exit(&self, timeout: Duration) -> Option<u32> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(code)) = mutex_lock_or_recover(&self.pty).try_wait() {
                return Some(code);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(KILL_POLL_INTERVAL);
        }
    }

    /// Runs on the reader thread once the PTY reports EOF.
    fn finish(&self) {
        self.stop_timers();
        self.output.clear_pending();
        let exit_code = self.poll_exit(EXIT_REAP_TIMEOUT);
        if self.removed.load(Ordering::SeqCst) {
            return;
        }

        let exit_code = exit_code.and_then(|code| i32::try_from(code).ok());
        let mut record = self.record();
        record.status = SessionStatus::Exited;
        record.exit_code = exit_code;
        self.persist_activity();
        if let Err(e) = self.store.save(&record) {
            warn!(session_id = %self.id, error = %e, "Failed to persist session metadata");
        }
        self.release_permit();
        // Last step: once the status reads Exited the directory may be removed.
        {
            let mut current = mutex_lock_or_recover(&self.record);
            current.status = SessionStatus::Exited;
            current.exit_code = exit_code;
        }
        info!(session_id = %self.id, exit_code = ?exit_code, "Session exited");
        self.emit(SessionEvent::Exited(self.id.clone()));
    }
}

fn fan_out(forwarders: &Forwarders, bytes: &[u8]) {
    let mut forwarders = mutex_lock_or_recover(forwarders);
    if forwarders.is_empty() {
        return;
    }
    let chunk = Bytes::copy_from_slice(bytes);
    forwarders.retain(|tx| match tx.try_send(chunk.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            trace!("Output subscriber is full; dropping chunk");
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    });
}

fn reader_loop(session: Arc<Session>, mut reader: Box<dyn Read + Send>) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => session.handle_output(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is how Linux reports a closed PTY.
                debug!(session_id = %session.id, error = %e, "PTY read ended");
                break;
            }
        }
    }
    session.finish();
}

/// Owns every session spawned by this process.
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    governor: Arc<ResourceGovernor>,
    store: SessionStore,
    events: Sender<SessionEvent>,
    idle_threshold: Duration,
    kill_timeout: Duration,
    warned_activity: Mutex<HashSet<SessionId>>,
}

impl SessionManager {
    pub fn new(
        config: &DaemonConfig,
        governor: Arc<ResourceGovernor>,
        events: Sender<SessionEvent>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            governor,
            store: SessionStore::new(config.control_dir()),
            events,
            idle_threshold: config.idle_threshold(),
            kill_timeout: config.kill_timeout(),
            warned_activity: Mutex::new(HashSet::new()),
        }
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.governor
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn get(&self, id: &SessionId) -> Result<Arc<Session>, SessionError> {
        rwlock_read_or_recover(&self.sessions)
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    fn get_running(&self, id: &SessionId) -> Result<Arc<Session>, SessionError> {
        let session = self.get(id)?;
        if !session.is_running() {
            return Err(SessionError::NotRunning(id.clone()));
        }
        Ok(session)
    }

    fn unused_session_id(&self) -> SessionId {
        let sessions = rwlock_read_or_recover(&self.sessions);
        loop {
            let id = generate_session_id();
            if !sessions.contains_key(&id) && !self.store.session_dir(&id).exists() {
                return id;
            }
        }
    }

    pub fn create_session(
        &self,
        command: Vec<String>,
        options: CreateSessionOptions,
    ) -> Result<SessionId, SessionError> {
        let Some((program, args)) = command.split_first() else {
            return Err(SessionError::InvalidCommand("command is empty".to_string()));
        };
        if program.trim().is_empty() {
            return Err(SessionError::InvalidCommand(
                "program name is empty".to_string(),
            ));
        }
        let working_dir = resolve_working_dir(&options.working_dir)?;

        // Dropped on every early return below, which releases the slot.
        let permit = self.governor.acquire_session()?;

        let title_mode = resolve_title_mode(options.title_mode, &command);
        let size = options.size;
        let pty = PtyHandle::spawn(
            program,
            args,
            Some(&working_dir),
            Some(&options.env),
            size.cols(),
            size.rows(),
        )
        .map_err(SessionError::Spawn)?;
        let reader = pty.take_reader().map_err(SessionError::Spawn)?;

        let id = self.unused_session_id();
        let record = SessionRecord {
            id: id.clone(),
            name: options.name.clone(),
            command: command.clone(),
            working_dir: working_dir.display().to_string(),
            status: SessionStatus::Running,
            started_at: Utc::now(),
            title_mode,
            pid: pty.pid(),
            cols: size.cols(),
            rows: size.rows(),
            exit_code: None,
        };

        let home = env::var_os("HOME").map(PathBuf::from);
        let title_base = static_title(
            &working_dir,
            &command,
            options.name.as_deref(),
            home.as_deref(),
        );

        let terminal = Arc::new(VirtualTerminal::new(size.cols(), size.rows()));
        let forwarders: Forwarders = Arc::new(Mutex::new(Vec::new()));
        let output = SafeStreamWriter::new(self.idle_threshold);
        {
            let terminal = Arc::clone(&terminal);
            let forwarders = Arc::clone(&forwarders);
            output.attach(Box::new(move |bytes| {
                terminal.process(bytes);
                fan_out(&forwarders, bytes);
                Ok(())
            }));
        }
        if title_mode.injects_titles() {
            output.queue_title(&title_base);
        }

        let activity = (title_mode == TitleMode::Dynamic).then(|| {
            let app = detect_dynamic_command(&command).map(str::to_string);
            Mutex::new(ActivityTracker {
                detector: ActivityDetector::new(app),
                current: ActivityState::idle(),
                persisted: None,
                last_persist: None,
            })
        });
        let title_filter =
            (title_mode == TitleMode::Filter).then(|| Mutex::new(TitleFilter::new()));

        let session = Arc::new(Session {
            id: id.clone(),
            title_base,
            record: Mutex::new(record),
            input: pty.writer(),
            pty: Mutex::new(pty),
            terminal,
            output,
            activity,
            title_filter,
            forwarders,
            token: CancellationToken::new(),
            removed: AtomicBool::new(false),
            permit: Mutex::new(Some(permit)),
            ticker: Mutex::new(None),
            store: self.store.clone(),
            events: self.events.clone(),
        });

        rwlock_write_or_recover(&self.sessions).insert(id.clone(), Arc::clone(&session));
        session.save_record();
        session.persist_activity();

        if let Err(e) = self.start_threads(&session, reader, title_mode) {
            session.removed.store(true, Ordering::SeqCst);
            session.stop_timers();
            rwlock_write_or_recover(&self.sessions).remove(&id);
            let _ = mutex_lock_or_recover(&session.pty).kill();
            session.release_permit();
            let _ = self.store.remove(&id);
            return Err(e);
        }

        info!(
            session_id = %id,
            command = %command.join(" "),
            title_mode = %title_mode,
            "Session created"
        );
        let _ = self.events.send(SessionEvent::Created(id.clone()));
        Ok(id)
    }

    fn start_threads(
        &self,
        session: &Arc<Session>,
        reader: Box<dyn Read + Send>,
        title_mode: TitleMode,
    ) -> Result<(), SessionError> {
        let thread_error = |e: std::io::Error| {
            SessionError::Spawn(PtyError::Spawn {
                reason: format!("failed to start session thread: {}", e),
                kind: SpawnErrorKind::Other,
            })
        };

        if title_mode.injects_titles() {
            let ticker_session = Arc::clone(session);
            let handle = thread::Builder::new()
                .name(format!("session-ticker-{}", session.id))
                .spawn(move || ticker_session.ticker_loop())
                .map_err(thread_error)?;
            *mutex_lock_or_recover(&session.ticker) = Some(handle);
        }

        let reader_session = Arc::clone(session);
        thread::Builder::new()
            .name(format!("session-reader-{}", session.id))
            .spawn(move || reader_loop(reader_session, reader))
            .map_err(thread_error)?;
        Ok(())
    }

    pub fn write_input(&self, id: &SessionId, data: &[u8]) -> Result<(), SessionError> {
        let session = self.get_running(id)?;
        session.input.write(data)?;
        Ok(())
    }

    pub fn resize(&self, id: &SessionId, cols: u16, rows: u16) -> Result<(), SessionError> {
        let size = TerminalSize::try_new(cols, rows)?;
        let session = self.get_running(id)?;
        mutex_lock_or_recover(&session.pty).resize(size.cols(), size.rows())?;
        session.terminal.resize(size.cols(), size.rows());
        {
            let mut record = mutex_lock_or_recover(&session.record);
            record.cols = size.cols();
            record.rows = size.rows();
        }
        session.save_record();
        debug!(session_id = %id, cols, rows, "Session resized");
        let _ = self.events.send(SessionEvent::Resized(id.clone()));
        Ok(())
    }

    /// Terminates the process (escalating to a forced kill after the kill
    /// timeout) and removes the session.
    ///
    /// Timers are cancelled and the pending title is dropped before the
    /// session leaves the registry.
    pub fn kill_session(&self, id: &SessionId, force: bool) -> Result<(), SessionError> {
        let session = self.get(id)?;
        session.stop_timers();
        session.output.clear_pending();
        session.removed.store(true, Ordering::SeqCst);

        self.stop_process(&session, force);

        rwlock_write_or_recover(&self.sessions).remove(id);
        session.release_permit();
        if let Err(e) = self.store.remove(id) {
            warn!(session_id = %id, error = %e, "Failed to remove session directory");
        }
        mutex_lock_or_recover(&self.warned_activity).remove(id);

        info!(session_id = %id, force, "Session killed");
        let _ = self.events.send(SessionEvent::Removed(id.clone()));
        Ok(())
    }

    fn stop_process(&self, session: &Session, force: bool) {
        if !force {
            let terminated = {
                let mut pty = mutex_lock_or_recover(&session.pty);
                if !pty.is_running() {
                    return;
                }
                pty.terminate()
            };
            match terminated {
                Ok(()) => {
                    if session.poll_exit(self.kill_timeout).is_some() {
                        return;
                    }
                    debug!(session_id = %session.id, "Process ignored SIGTERM; killing");
                }
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to terminate process"),
            }
        }
        if let Err(e) = mutex_lock_or_recover(&session.pty).kill() {
            warn!(session_id = %session.id, error = %e, "Failed to kill process");
        }
    }

    /// Owned sessions plus sessions found only in the control directory,
    /// newest first.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let owned: Vec<Arc<Session>> = rwlock_read_or_recover(&self.sessions)
            .values()
            .cloned()
            .collect();
        let owned_ids: HashSet<SessionId> = owned.iter().map(|s| s.id.clone()).collect();

        let mut summaries: Vec<SessionSummary> = owned
            .iter()
            .map(|session| SessionSummary {
                record: session.record(),
                activity: session.activity_snapshot(),
                external: false,
            })
            .collect();

        let now = Utc::now();
        for record in self.store.list() {
            if owned_ids.contains(&record.id) {
                continue;
            }
            let activity = if record.title_mode == TitleMode::Dynamic {
                self.read_external_activity(&record.id, now)
            } else {
                None
            };
            summaries.push(SessionSummary {
                record,
                activity,
                external: true,
            });
        }

        summaries.sort_by(|a, b| b.record.started_at.cmp(&a.record.started_at));
        summaries
    }

    fn read_external_activity(
        &self,
        id: &SessionId,
        now: chrono::DateTime<Utc>,
    ) -> Option<ActivityState> {
        match read_activity_file(&self.store.activity_path(id), now) {
            Ok(state) => state,
            Err(e) => {
                // Logged once per session; later list calls stay quiet.
                if mutex_lock_or_recover(&self.warned_activity).insert(id.clone()) {
                    warn!(
                        session_id = %id,
                        error = %e,
                        missing = matches!(e, ActivityFileError::Missing),
                        "Activity file unavailable; reporting no activity"
                    );
                }
                None
            }
        }
    }

    /// Encoded buffer frame of the session's current screen.
    pub fn buffer_snapshot(&self, id: &SessionId) -> Result<Bytes, SessionError> {
        let session = self.get(id)?;
        Ok(BufferEncoder::encode(&session.terminal.snapshot()))
    }

    /// Receives the forwarded output, injected titles included. A full
    /// channel loses chunks for this subscriber only.
    pub fn subscribe_output(&self, id: &SessionId) -> Result<Receiver<Bytes>, SessionError> {
        let session = self.get(id)?;
        let (tx, rx) = crossbeam_channel::bounded(OUTPUT_FORWARD_CAPACITY);
        mutex_lock_or_recover(&session.forwarders).push(tx);
        Ok(rx)
    }

    pub fn terminal_title(&self, id: &SessionId) -> Result<String, SessionError> {
        Ok(self.get(id)?.terminal.title())
    }

    pub fn screen_text(&self, id: &SessionId) -> Result<String, SessionError> {
        Ok(self.get(id)?.terminal.screen_text())
    }

    pub fn session_record(&self, id: &SessionId) -> Result<SessionRecord, SessionError> {
        Ok(self.get(id)?.record())
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        rwlock_read_or_recover(&self.sessions).keys().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        rwlock_read_or_recover(&self.sessions).len()
    }

    /// Drops owned sessions that have exited and deletes control-directory
    /// entries of external sessions whose process is gone.
    pub fn remove_exited_sessions(&self) -> usize {
        let finished: Vec<Arc<Session>> = {
            let mut sessions = rwlock_write_or_recover(&self.sessions);
            let ids: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, session)| session.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let mut removed = 0;
        for session in &finished {
            session.removed.store(true, Ordering::SeqCst);
            match self.store.remove(&session.id) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Failed to remove session directory")
                }
            }
            mutex_lock_or_recover(&self.warned_activity).remove(&session.id);
            debug!(session_id = %session.id, "Removed exited session");
            let _ = self.events.send(SessionEvent::Removed(session.id.clone()));
        }

        let owned = self.session_ids();
        removed += self.store.remove_exited(&owned);
        if removed > 0 {
            info!(removed, "Removed exited sessions");
        }
        removed
    }

    /// Flushes pending titles regardless of stream position.
    pub fn force_inject_all(&self) {
        let sessions: Vec<Arc<Session>> = rwlock_read_or_recover(&self.sessions)
            .values()
            .cloned()
            .collect();
        for session in sessions {
            if let Err(e) = session.output.force_inject() {
                warn!(session_id = %session.id, error = %e, "Forced title injection failed");
            }
        }
    }

    /// Flushes pending titles, then kills every owned session.
    pub fn shutdown(&self) {
        self.force_inject_all();
        for id in self.session_ids() {
            if let Err(e) = self.kill_session(&id, false) {
                warn!(session_id = %id, error = %e, "Failed to kill session during shutdown");
            }
        }
    }
}

impl FrameSource for SessionManager {
    fn session_exists(&self, id: &SessionId) -> bool {
        rwlock_read_or_recover(&self.sessions).contains_key(id)
    }

    fn encode_frame(&self, id: &SessionId) -> Option<Bytes> {
        self.buffer_snapshot(id).ok()
    }
}

fn resolve_working_dir(dir: &Path) -> Result<PathBuf, SessionError> {
    let invalid = |reason: String| SessionError::InvalidWorkingDir {
        path: dir.display().to_string(),
        reason,
    };
    let resolved = dir.canonicalize().map_err(|e| invalid(e.to_string()))?;
    if !resolved.is_dir() {
        return Err(invalid("not a directory".to_string()));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn count(&self, needle: &str) -> usize {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .matches(needle)
                .count()
        }
    }

    fn idle_manager(control: &Path) -> SessionManager {
        let config = DaemonConfig::default().with_control_dir(control);
        let governor = Arc::new(ResourceGovernor::new(
            config.max_sessions(),
            config.max_connections(),
        ));
        let (tx, _rx) = crossbeam_channel::unbounded();
        SessionManager::new(&config, governor, tx)
    }

    #[test]
    fn test_unreadable_activity_warns_once_per_session() {
        let control = tempfile::tempdir().unwrap();
        let manager = idle_manager(control.path());
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let first = SessionId::new("first");
        let second = SessionId::new("second");
        tracing::subscriber::with_default(subscriber, || {
            for _ in 0..3 {
                assert!(manager.read_external_activity(&first, Utc::now()).is_none());
            }
            assert!(manager.read_external_activity(&second, Utc::now()).is_none());
        });

        assert_eq!(logs.count("Activity file unavailable"), 2);
        assert_eq!(logs.count("session_id=first"), 1);
        assert_eq!(mutex_lock_or_recover(&manager.warned_activity).len(), 2);
    }

    #[test]
    fn test_generate_session_id() {
        let id = generate_session_id();
        assert_eq!(id.len(), 8);
        assert!(SessionId::try_new(id.as_str()).is_ok());
    }

    #[test]
    fn test_explicit_title_mode_wins() {
        let claude = vec!["claude".to_string()];
        assert_eq!(resolve_title_mode(None, &claude), TitleMode::Dynamic);
        assert_eq!(
            resolve_title_mode(Some(TitleMode::Static), &claude),
            TitleMode::Static
        );
        assert_eq!(
            resolve_title_mode(Some(TitleMode::None), &claude),
            TitleMode::None
        );
        assert_eq!(
            resolve_title_mode(None, &["vim".to_string()]),
            TitleMode::None
        );
    }

    #[test]
    fn test_resolve_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_working_dir(dir.path()).is_ok());

        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            resolve_working_dir(&file),
            Err(SessionError::InvalidWorkingDir { .. })
        ));
        assert!(matches!(
            resolve_working_dir(&dir.path().join("missing")),
            Err(SessionError::InvalidWorkingDir { .. })
        ));
    }

    #[test]
    fn test_fan_out_drops_when_full_and_prunes_closed() {
        let forwarders: Forwarders = Arc::new(Mutex::new(Vec::new()));
        let (full_tx, full_rx) = crossbeam_channel::bounded(1);
        let (closed_tx, closed_rx) = crossbeam_channel::bounded(4);
        forwarders.lock().unwrap().push(full_tx);
        forwarders.lock().unwrap().push(closed_tx);
        drop(closed_rx);

        fan_out(&forwarders, b"one");
        fan_out(&forwarders, b"two");

        assert_eq!(forwarders.lock().unwrap().len(), 1);
        assert_eq!(full_rx.try_recv().unwrap(), Bytes::from_static(b"one"));
        assert!(full_rx.try_recv().is_err());
    }

    #[test]
    fn test_event_session_id() {
        let id = SessionId::new("abc");
        assert_eq!(SessionEvent::Exited(id.clone()).session_id(), &id);
    }
}
