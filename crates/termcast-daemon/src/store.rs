//! On-disk session metadata under `<control_dir>/<session_id>/`.

use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;
use termcast_core::SessionId;
use termcast_core::SessionRecord;
use termcast_core::SessionStatus;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::activity_file::ACTIVITY_FILE_NAME;
use crate::error::SessionError;

pub const SESSION_FILE_NAME: &str = "session.json";

fn persistence_error(operation: &'static str, path: &Path, err: impl std::fmt::Display) -> SessionError {
    SessionError::Persistence {
        operation,
        reason: format!("{}: {}", path.display(), err),
    }
}

/// Writes `value` as JSON to a uniquely named temp file and renames it over
/// `path`, so concurrent writers of one record never share a temp file.
pub(crate) fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
    operation: &'static str,
) -> Result<(), SessionError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| persistence_error(operation, parent, e))?;
    }
    let json = serde_json::to_vec_pretty(value).map_err(|e| persistence_error(operation, path, e))?;
    let tmp_path = temp_path_for(path);
    let written = create_private(&tmp_path).and_then(|mut file| {
        file.write_all(&json)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(persistence_error(operation, &tmp_path, e));
    }
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        persistence_error(operation, path, e)
    })
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

/// Creates a new file that is owner-only from the start.
fn create_private(path: &Path) -> io::Result<fs::File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Directory-per-session metadata store.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn activity_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join(ACTIVITY_FILE_NAME)
    }

    pub fn save(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let path = self.session_dir(&record.id).join(SESSION_FILE_NAME);
        write_json_atomic(&path, record, "write session.json")
    }

    pub fn load(&self, id: &SessionId) -> Result<SessionRecord, SessionError> {
        let path = self.session_dir(id).join(SESSION_FILE_NAME);
        let raw = fs::read(&path).map_err(|e| persistence_error("read session.json", &path, e))?;
        serde_json::from_slice(&raw).map_err(|e| persistence_error("parse session.json", &path, e))
    }

    pub fn remove(&self, id: &SessionId) -> Result<(), SessionError> {
        let dir = self.session_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence_error("remove session dir", &dir, e)),
        }
    }

    /// Every readable record in the control directory, with the status of
    /// running entries refreshed from the recorded pid.
    pub fn list(&self) -> Vec<SessionRecord> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.root.display(), error = %e, "Failed to read control directory");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(id) = SessionId::try_new(name) else {
                continue;
            };
            match self.load(&id) {
                Ok(mut record) => {
                    refresh_status(&mut record);
                    records.push(record);
                }
                Err(e) => debug!(session_id = %id, error = %e, "Skipping unreadable session"),
            }
        }
        records
    }

    /// Deletes directories of sessions not in `owned` whose process is gone.
    pub fn remove_exited(&self, owned: &[SessionId]) -> usize {
        let mut removed = 0;
        for record in self.list() {
            if owned.contains(&record.id) || record.is_running() {
                continue;
            }
            match self.remove(&record.id) {
                Ok(()) => removed += 1,
                Err(e) => warn!(session_id = %record.id, error = %e, "Failed to remove exited session"),
            }
        }
        removed
    }
}

fn refresh_status(record: &mut SessionRecord) {
    if record.status == SessionStatus::Running && !record.pid.is_some_and(is_process_alive) {
        record.status = SessionStatus::Exited;
    }
}

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence and permission.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use termcast_core::TitleMode;

    fn record(id: &str, pid: Option<u32>, status: SessionStatus) -> SessionRecord {
        SessionRecord {
            id: SessionId::new(id),
            name: None,
            command: vec!["cat".into()],
            working_dir: "/tmp".into(),
            status,
            started_at: Utc::now(),
            title_mode: TitleMode::None,
            pid,
            cols: 80,
            rows: 24,
            exit_code: None,
        }
    }

    #[test]
    fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let rec = record("s1", Some(std::process::id()), SessionStatus::Running);
        store.save(&rec).unwrap();

        assert_eq!(store.load(&rec.id).unwrap(), rec);
        let leftovers: Vec<_> = fs::read_dir(store.session_dir(&rec.id))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        store.remove(&rec.id).unwrap();
        assert!(!store.session_dir(&rec.id).exists());
        store.remove(&rec.id).unwrap();
    }

    #[test]
    fn test_list_refreshes_dead_pids() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store
            .save(&record("alive", Some(std::process::id()), SessionStatus::Running))
            .unwrap();
        store
            .save(&record("gone", Some(i32::MAX as u32), SessionStatus::Running))
            .unwrap();
        fs::create_dir_all(dir.path().join("junk")).unwrap();

        let mut records = store.list();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id.as_str(), "alive");
        assert_eq!(records[0].status, SessionStatus::Running);
        assert_eq!(records[1].status, SessionStatus::Exited);
    }

    #[test]
    fn test_remove_exited_skips_owned_and_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let owned = record("owned", None, SessionStatus::Exited);
        store.save(&owned).unwrap();
        store
            .save(&record("dead", None, SessionStatus::Exited))
            .unwrap();
        store
            .save(&record("live", Some(std::process::id()), SessionStatus::Running))
            .unwrap();

        assert_eq!(store.remove_exited(std::slice::from_ref(&owned.id)), 1);
        assert!(store.session_dir(&owned.id).exists());
        assert!(!store.session_dir(&SessionId::new("dead")).exists());
        assert!(store.session_dir(&SessionId::new("live")).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_record_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let rec = record("s1", None, SessionStatus::Exited);
        store.save(&rec).unwrap();

        let path = store.session_dir(&rec.id).join(SESSION_FILE_NAME);
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_temp_names_are_unique_per_write() {
        let path = Path::new("/tmp/s1/session.json");
        let a = temp_path_for(path);
        let b = temp_path_for(path);
        assert_ne!(a, b);
        assert_eq!(a.parent(), path.parent());
    }

    #[test]
    fn test_concurrent_saves_of_one_record_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let rec = record("s1", None, SessionStatus::Running);
        store.save(&rec).unwrap();

        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let store = store.clone();
                let mut rec = rec.clone();
                std::thread::spawn(move || {
                    rec.cols = 80 + i;
                    for _ in 0..20 {
                        store.save(&rec).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.load(&rec.id).unwrap().id, rec.id);
    }

    #[test]
    fn test_list_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("nope"));
        assert!(store.list().is_empty());
    }
}
