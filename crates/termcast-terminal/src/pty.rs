use std::collections::HashMap;
use std::io;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use portable_pty::Child;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use termcast_common::mutex_lock_or_recover;
use tracing::debug;

use crate::error::PtyError;
use crate::error::SpawnErrorKind;

/// Cloneable handle to the input side of a PTY.
#[derive(Clone)]
pub struct PtyWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
    #[cfg(unix)]
    fd: Option<std::os::unix::io::RawFd>,
}

impl PtyWriter {
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if data.is_empty() {
            return Ok(());
        }

        let mut writer = mutex_lock_or_recover(&self.inner);
        let mut offset = 0;
        while offset < data.len() {
            match writer.write(&data[offset..]) {
                Ok(0) => {
                    return Err(PtyError::Write {
                        reason: "write returned 0 bytes, PTY closed".to_string(),
                        source: None,
                    });
                }
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait_writable()?,
                Err(e) => return Err(PtyError::write(e)),
            }
        }
        writer.flush().map_err(PtyError::write)
    }

    fn wait_writable(&self) -> Result<(), PtyError> {
        #[cfg(unix)]
        {
            use libc::{POLLERR, POLLHUP, POLLOUT, poll, pollfd};

            let Some(fd) = self.fd else {
                return Ok(());
            };
            let mut fds = [pollfd {
                fd,
                events: POLLOUT,
                revents: 0,
            }];
            loop {
                // SAFETY: `fds` is a valid one-element array for the duration of the call.
                let rc = unsafe { poll(fds.as_mut_ptr(), 1, -1) };
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(PtyError::write(err));
                }
                let events = fds[0].revents;
                if events & (POLLHUP | POLLERR) != 0 {
                    return Err(PtyError::Write {
                        reason: "PTY closed".to_string(),
                        source: None,
                    });
                }
                if events & POLLOUT != 0 {
                    return Ok(());
                }
            }
        }
        #[cfg(not(unix))]
        {
            Ok(())
        }
    }
}

/// A child process attached to a pseudo-terminal.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: PtyWriter,
    size: PtySize,
    pid: Option<u32>,
    exit_code: Option<u32>,
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.kill();
        }
    }
}

impl PtyHandle {
    pub fn spawn(
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        env: Option<&HashMap<String, String>>,
        cols: u16,
        rows: u16,
    ) -> Result<Self, PtyError> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = native_pty_system()
            .openpty(size)
            .map_err(|e| PtyError::Open {
                reason: e.to_string(),
            })?;

        let mut cmd = CommandBuilder::new(command);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }
        if let Some(env_vars) = env {
            for (key, value) in env_vars {
                cmd.env(key, value);
            }
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            let kind = e
                .downcast_ref::<io::Error>()
                .map(SpawnErrorKind::from_io)
                .unwrap_or(SpawnErrorKind::Other);
            PtyError::Spawn {
                reason: e.to_string(),
                kind,
            }
        })?;
        // The slave side belongs to the child now; keeping it open would hide EOF.
        drop(pair.slave);

        let writer = pair.master.take_writer().map_err(|e| PtyError::Open {
            reason: e.to_string(),
        })?;
        let pid = child.process_id();
        debug!(command, pid, "Spawned PTY process");

        Ok(Self {
            writer: PtyWriter {
                inner: Arc::new(Mutex::new(writer)),
                #[cfg(unix)]
                fd: pair.master.as_raw_fd(),
            },
            master: pair.master,
            child,
            size,
            pid,
            exit_code: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn size(&self) -> (u16, u16) {
        (self.size.cols, self.size.rows)
    }

    /// A blocking reader over the PTY output; meant for a dedicated thread.
    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master.try_clone_reader().map_err(|e| PtyError::Read {
            reason: e.to_string(),
            source: None,
        })
    }

    pub fn writer(&self) -> PtyWriter {
        self.writer.clone()
    }

    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.writer.write(data)
    }

    /// Exit code once the child has been reaped, without blocking.
    pub fn try_wait(&mut self) -> Result<Option<u32>, PtyError> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(status.exit_code());
                Ok(self.exit_code)
            }
            Ok(None) => Ok(None),
            Err(e) => Err(PtyError::Signal {
                reason: e.to_string(),
                source: Some(e),
            }),
        }
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        self.master.resize(size).map_err(|e| PtyError::Resize {
            reason: e.to_string(),
        })?;
        self.size = size;
        Ok(())
    }

    /// Sends `signal` to the child. A process that is already gone is not an error.
    #[cfg(unix)]
    pub fn signal(&self, signal: i32) -> Result<(), PtyError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return Err(PtyError::Signal {
                reason: format!("pid {} out of range", pid),
                source: None,
            });
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(PtyError::Signal {
            reason: err.to_string(),
            source: Some(err),
        })
    }

    /// Asks the child to exit (SIGTERM on unix).
    pub fn terminate(&mut self) -> Result<(), PtyError> {
        #[cfg(unix)]
        {
            self.signal(libc::SIGTERM)
        }
        #[cfg(not(unix))]
        {
            self.kill()
        }
    }

    pub fn kill(&mut self) -> Result<(), PtyError> {
        if !self.is_running() {
            return Ok(());
        }
        self.child.kill().map_err(|e| PtyError::Signal {
            reason: e.to_string(),
            source: Some(e),
        })
    }
}
