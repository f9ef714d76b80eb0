//! Inline title injection that never splits a codepoint or escape sequence.

use std::io;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use termcast_common::mutex_lock_or_recover;
use termcast_core::InjectionReason;
use termcast_core::SafeInjectionPoint;
use termcast_core::StreamAnalyzer;
use termcast_core::title_sequence;
use tracing::debug;
use tracing::trace;

use crate::error::InjectionError;

/// Receives the forwarded output of one session.
pub type ForwardFn = Box<dyn FnMut(&[u8]) -> io::Result<()> + Send>;

/// Outcome of an idle check that found a title waiting on a quiet stream.
///
/// Carries the output timestamp that was observed so the injection step can
/// tell whether output arrived in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleCandidate {
    observed_output: Instant,
}

struct WriterState {
    analyzer: StreamAnalyzer,
    pending: Option<Vec<u8>>,
    last_output: Instant,
    forward: Option<ForwardFn>,
}

impl WriterState {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.forward.as_mut() {
            Some(forward) => forward(bytes),
            None => Ok(()),
        }
    }

    fn inject_pending(&mut self, reason: InjectionReason) -> Result<bool, InjectionError> {
        let Some(title) = self.pending.take() else {
            return Ok(false);
        };
        self.send(&title)?;
        trace!(?reason, len = title.len(), "Injected title");
        Ok(true)
    }
}

/// Wraps one session's output stream and splices queued title sequences
/// into it at safe points.
pub struct SafeStreamWriter {
    state: Mutex<WriterState>,
    idle_threshold: Duration,
}

impl SafeStreamWriter {
    pub fn new(idle_threshold: Duration) -> Self {
        Self {
            state: Mutex::new(WriterState {
                analyzer: StreamAnalyzer::new(),
                pending: None,
                last_output: Instant::now(),
                forward: None,
            }),
            idle_threshold,
        }
    }

    /// Sets the sink that receives the (possibly rewritten) output.
    pub fn attach(&self, forward: ForwardFn) {
        mutex_lock_or_recover(&self.state).forward = Some(forward);
    }

    /// Replaces any title still waiting for a safe point.
    pub fn queue_title(&self, title: &str) {
        let sequence = title_sequence(title);
        let mut state = mutex_lock_or_recover(&self.state);
        if state.pending.replace(sequence).is_some() {
            trace!("Replaced pending title");
        }
    }

    pub fn has_pending(&self) -> bool {
        mutex_lock_or_recover(&self.state).pending.is_some()
    }

    pub fn clear_pending(&self) {
        mutex_lock_or_recover(&self.state).pending = None;
    }

    /// Forwards `chunk`, splicing the pending title in at the first safe
    /// point when there is one.
    ///
    /// Returns the point used for injection, if any. On a forward failure
    /// the pending title is gone and the error is returned; the analyzer has
    /// still consumed the chunk so later output is scanned correctly.
    pub fn process_output(
        &self,
        chunk: &[u8],
    ) -> Result<Option<SafeInjectionPoint>, InjectionError> {
        let mut state = mutex_lock_or_recover(&self.state);
        state.last_output = Instant::now();
        let points = state.analyzer.process(chunk);

        let first = points.first().copied();
        let title = match first {
            Some(_) => state.pending.take(),
            None => None,
        };

        match (first, title) {
            (Some(point), Some(title)) => {
                let (prefix, suffix) = chunk.split_at(point.position);
                let mut combined = Vec::with_capacity(chunk.len() + title.len());
                combined.extend_from_slice(prefix);
                combined.extend_from_slice(&title);
                combined.extend_from_slice(suffix);
                state.send(&combined)?;
                trace!(
                    position = point.position,
                    reason = ?point.reason,
                    "Injected title into output"
                );
                Ok(Some(point))
            }
            _ => {
                state.send(chunk)?;
                Ok(None)
            }
        }
    }

    /// First half of the idle fallback: reports whether a title is waiting
    /// on a stream that has been quiet for the idle threshold and is not in
    /// the middle of a sequence.
    pub fn check_idle(&self) -> Option<IdleCandidate> {
        self.check_idle_at(Instant::now())
    }

    pub fn check_idle_at(&self, now: Instant) -> Option<IdleCandidate> {
        let state = mutex_lock_or_recover(&self.state);
        let quiet = now.saturating_duration_since(state.last_output) >= self.idle_threshold;
        if state.pending.is_some() && quiet && state.analyzer.is_ground() {
            Some(IdleCandidate {
                observed_output: state.last_output,
            })
        } else {
            None
        }
    }

    /// Second half of the idle fallback. Injects only if no output arrived
    /// since `candidate` was taken; otherwise leaves the title queued for the
    /// next tick and returns `Ok(false)`.
    pub fn inject_if_still_idle(&self, candidate: IdleCandidate) -> Result<bool, InjectionError> {
        let mut state = mutex_lock_or_recover(&self.state);
        if state.last_output != candidate.observed_output || !state.analyzer.is_ground() {
            debug!("Output arrived before idle injection; rescheduling");
            return Ok(false);
        }
        state.inject_pending(InjectionReason::Idle)
    }

    /// Writes the pending title immediately, ignoring stream position.
    /// Only for teardown, where a corrupted frame is acceptable.
    pub fn force_inject(&self) -> Result<bool, InjectionError> {
        let mut state = mutex_lock_or_recover(&self.state);
        let injected = state.inject_pending(InjectionReason::Idle)?;
        if injected {
            state.analyzer.reset();
        }
        Ok(injected)
    }
}
