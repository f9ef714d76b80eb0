//! SIGINT/SIGTERM handling.

use std::thread;
use std::thread::JoinHandle;

use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGTERM;
use signal_hook::iterator::Signals;
use tracing::info;

use crate::cancel::CancellationToken;
use crate::error::DaemonError;

pub struct SignalHandler {
    _handle: JoinHandle<()>,
}

impl SignalHandler {
    /// Cancels `shutdown` on the first SIGINT or SIGTERM.
    pub fn setup(shutdown: CancellationToken) -> Result<Self, DaemonError> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).map_err(|e| DaemonError::SignalSetup(e.to_string()))?;

        let handle = thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    info!(
                        signal = sig,
                        "Received signal, initiating graceful shutdown"
                    );
                    shutdown.cancel();
                }
            })
            .map_err(|e| {
                DaemonError::SignalSetup(format!("failed to spawn signal handler: {}", e))
            })?;

        Ok(Self { _handle: handle })
    }
}
